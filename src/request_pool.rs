//! A [RequestPool] is a vec-backed slot allocator handing out generational [RequestId]s.
//!
//! Freed slots go on an intrusive free list and are reused before the vec grows.  Every reuse bumps the slot's
//! generation, so an id kept around after its request was removed is detected as stale rather than silently pointing
//! at whatever moved into the slot.

/// Handle to an item in a [RequestPool].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct OccupiedSlot<T> {
    generation: u32,
    item: T,
}

struct EmptySlot {
    /// Generation the next occupant will get.
    generation: u32,
    next_empty: Option<usize>,
}

enum Slot<T> {
    /// This slot is empty, possibly with a pointer at the next empty slot.
    Empty(EmptySlot),
    Occupied(OccupiedSlot<T>),
}

pub struct RequestPool<T> {
    slots: Vec<Slot<T>>,
    empty_head: Option<usize>,
    len: usize,
}

impl<T> Default for RequestPool<T> {
    fn default() -> Self {
        RequestPool::with_capacity(0)
    }
}

impl<T> RequestPool<T> {
    pub fn with_capacity(capacity: usize) -> RequestPool<T> {
        RequestPool {
            slots: Vec::with_capacity(capacity),
            empty_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Find an available empty index, or make one if necessary.  Returns the index and the generation to use.
    fn find_empty(&mut self) -> (usize, u32) {
        if let Some(e) = self.empty_head {
            if let Slot::Empty(ref empty) = self.slots[e] {
                self.empty_head = empty.next_empty;
                return (e, empty.generation);
            }
        }

        self.slots.push(Slot::Empty(EmptySlot {
            generation: 0,
            next_empty: None,
        }));
        (self.slots.len() - 1, 0)
    }

    pub fn insert(&mut self, item: T) -> RequestId {
        let (index, generation) = self.find_empty();
        self.slots[index] = Slot::Occupied(OccupiedSlot { generation, item });
        self.len += 1;
        RequestId {
            index: index as u32,
            generation,
        }
    }

    fn occupied(&self, id: RequestId) -> Option<&OccupiedSlot<T>> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied(slot) if slot.generation == id.generation => Some(slot),
            _ => None,
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.occupied(id).is_some()
    }

    pub fn get(&self, id: RequestId) -> Option<&T> {
        self.occupied(id).map(|slot| &slot.item)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied(slot) if slot.generation == id.generation => Some(&mut slot.item),
            _ => None,
        }
    }

    /// Remove an item, making its slot available for reuse under a new generation.
    pub fn remove(&mut self, id: RequestId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }

        let index = id.index as usize;
        let mut old = Slot::Empty(EmptySlot {
            generation: id.generation.wrapping_add(1),
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.slots[index]);
        self.empty_head = Some(index);
        self.len -= 1;

        match old {
            Slot::Occupied(OccupiedSlot { item, .. }) => Some(item),
            Slot::Empty(_) => None,
        }
    }

    /// Iterate over the live items in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (RequestId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(slot) => Some((
                    RequestId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    &slot.item,
                )),
                Slot::Empty(_) => None,
            })
    }

    /// Ids of every live item, for iterating while mutating.
    pub fn ids(&self) -> Vec<RequestId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
