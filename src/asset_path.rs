//! [AssetPath] is an interned, hierarchical name for packages, objects, and object instances.
//!
//! Paths are written with three delimiters: `/` introduces a package segment, `:` introduces an object segment, and
//! `*` attaches an instance index to the final segment, e.g. `/Game/Levels:Forest:Tree*3`.  Package segments may only
//! appear before object segments.
//!
//! Every distinct segment chain is interned exactly once in a process-wide table, so an [AssetPath] is a single pointer
//! and equality or hashing never touches the strings.  The table is split into a fixed number of buckets, each behind
//! its own reader-writer lock: lookups of existing paths only ever take read locks, and inserting a new entry only
//! locks the bucket it lands in.
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

pub const PACKAGE_DELIMITER: char = '/';
pub const OBJECT_DELIMITER: char = ':';
pub const INSTANCE_DELIMITER: char = '*';

const TABLE_BUCKET_COUNT: usize = 256;

/// Instance index value that can never be used, since it marks "no index" in serialized forms.
pub const RESERVED_INSTANCE_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetPathError {
    #[error("path \"{0}\" does not start with a package or object delimiter")]
    MissingLeadingDelimiter(String),
    #[error("path \"{path}\" has an empty segment at byte {position}")]
    EmptySegment { path: String, position: usize },
    #[error("path \"{path}\" has a package segment below an object at byte {position}")]
    PackageAfterObject { path: String, position: usize },
    #[error("path \"{path}\" has an instance index on a segment that is not the leaf")]
    InstanceNotAtLeaf { path: String },
    #[error("path \"{path}\" has an invalid instance index \"{index}\"")]
    InvalidInstanceIndex { path: String, index: String },
    #[error("segment name \"{0}\" is empty or contains a path delimiter")]
    InvalidName(String),
    #[error("package \"{name}\" cannot be placed below object \"{parent}\"")]
    PackageBelowObject { name: String, parent: String },
}

struct PathEntry {
    parent: Option<Arc<PathEntry>>,
    name: Arc<str>,
    instance_index: Option<u32>,
    is_package: bool,
    hash: u64,
}

impl PathEntry {
    fn matches(
        &self,
        name: &str,
        instance_index: Option<u32>,
        is_package: bool,
        parent: Option<&Arc<PathEntry>>,
    ) -> bool {
        let same_parent = match (&self.parent, parent) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        same_parent
            && self.is_package == is_package
            && self.instance_index == instance_index
            && &*self.name == name
    }
}

struct PathTable {
    buckets: Box<[RwLock<Vec<Arc<PathEntry>>>]>,
    hash_state: ahash::RandomState,
}

impl PathTable {
    fn new() -> PathTable {
        PathTable {
            buckets: (0..TABLE_BUCKET_COUNT)
                .map(|_| RwLock::new(Vec::new()))
                .collect(),
            hash_state: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    fn global() -> &'static PathTable {
        static TABLE: OnceLock<PathTable> = OnceLock::new();
        TABLE.get_or_init(PathTable::new)
    }

    fn entry_hash(
        &self,
        name: &str,
        instance_index: Option<u32>,
        is_package: bool,
        parent: Option<&Arc<PathEntry>>,
    ) -> u64 {
        let mut hasher = self.hash_state.build_hasher();
        name.hash(&mut hasher);
        instance_index
            .unwrap_or(RESERVED_INSTANCE_INDEX)
            .hash(&mut hasher);
        is_package.hash(&mut hasher);
        parent.map_or(0, |p| p.hash).hash(&mut hasher);
        hasher.finish()
    }

    /// Find the entry with the given contents, adding it if it does not exist yet.
    fn intern(
        &self,
        name: &str,
        instance_index: Option<u32>,
        is_package: bool,
        parent: Option<Arc<PathEntry>>,
    ) -> Arc<PathEntry> {
        let hash = self.entry_hash(name, instance_index, is_package, parent.as_ref());
        let bucket = &self.buckets[(hash % TABLE_BUCKET_COUNT as u64) as usize];

        let seen = {
            let entries = bucket.read();
            if let Some(found) = entries
                .iter()
                .find(|e| e.matches(name, instance_index, is_package, parent.as_ref()))
            {
                return found.clone();
            }
            entries.len()
        };

        let mut entries = bucket.write();

        // Buckets only grow between shutdowns, so only entries pushed since the read pass need checking.
        let start = if seen <= entries.len() { seen } else { 0 };
        if let Some(found) = entries[start..]
            .iter()
            .find(|e| e.matches(name, instance_index, is_package, parent.as_ref()))
        {
            return found.clone();
        }

        let entry = Arc::new(PathEntry {
            parent,
            name: Arc::from(name),
            instance_index,
            is_package,
            hash,
        });
        entries.push(entry.clone());
        entry
    }

    fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.write().clear();
        }
    }
}

struct Segment<'a> {
    name: &'a str,
    is_package: bool,
    instance_index: Option<u32>,
}

fn is_delimiter(byte: u8) -> bool {
    byte == PACKAGE_DELIMITER as u8 || byte == OBJECT_DELIMITER as u8
}

fn parse_instance_index(path: &str, digits: &str) -> Result<u32, AssetPathError> {
    let invalid = || AssetPathError::InvalidInstanceIndex {
        path: path.to_string(),
        index: digits.to_string(),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(invalid());
    }

    match digits.parse::<u32>() {
        Ok(index) if index != RESERVED_INSTANCE_INDEX => Ok(index),
        _ => Err(invalid()),
    }
}

/// Split a non-empty path string into segments, root first.
fn parse_segments(path: &str) -> Result<Vec<Segment<'_>>, AssetPathError> {
    let bytes = path.as_bytes();
    if !is_delimiter(bytes[0]) {
        return Err(AssetPathError::MissingLeadingDelimiter(path.to_string()));
    }

    let mut segments = Vec::new();
    let mut seen_object = false;
    let mut start = 0;

    loop {
        let is_package = bytes[start] == PACKAGE_DELIMITER as u8;
        if is_package && seen_object {
            return Err(AssetPathError::PackageAfterObject {
                path: path.to_string(),
                position: start,
            });
        }
        seen_object |= !is_package;

        let end = bytes[start + 1..]
            .iter()
            .position(|b| is_delimiter(*b))
            .map_or(bytes.len(), |p| start + 1 + p);
        let text = &path[start + 1..end];

        let (name, instance) = match text.find(INSTANCE_DELIMITER) {
            Some(split) => (&text[..split], Some(&text[split + 1..])),
            None => (text, None),
        };

        if name.is_empty() {
            return Err(AssetPathError::EmptySegment {
                path: path.to_string(),
                position: start + 1,
            });
        }

        let instance_index = match instance {
            Some(_) if end != bytes.len() => {
                return Err(AssetPathError::InstanceNotAtLeaf {
                    path: path.to_string(),
                })
            }
            Some(digits) => Some(parse_instance_index(path, digits)?),
            None => None,
        };

        segments.push(Segment {
            name,
            is_package,
            instance_index,
        });

        if end == bytes.len() {
            return Ok(segments);
        }
        start = end;
    }
}

/// An interned hierarchical asset name.
///
/// The default value is the null path, which is unequal to every other path and renders as an empty string.
#[derive(Clone, Default)]
pub struct AssetPath {
    entry: Option<Arc<PathEntry>>,
}

impl AssetPath {
    /// Parse and intern a path string.  The empty string yields the null path.
    pub fn parse(path: &str) -> Result<AssetPath, AssetPathError> {
        if path.is_empty() {
            return Ok(AssetPath::default());
        }

        let segments = parse_segments(path)?;
        let table = PathTable::global();
        let mut entry = None;
        for segment in segments {
            entry = Some(table.intern(
                segment.name,
                segment.instance_index,
                segment.is_package,
                entry,
            ));
        }

        Ok(AssetPath { entry })
    }

    /// Replace this path with the parsed `path`.  On error the path is left unchanged.
    pub fn set(&mut self, path: &str) -> Result<(), AssetPathError> {
        *self = AssetPath::parse(path)?;
        Ok(())
    }

    /// Build a path from a single segment below `parent`.
    pub fn from_parts(
        name: &str,
        is_package: bool,
        parent: &AssetPath,
        instance_index: Option<u32>,
    ) -> Result<AssetPath, AssetPathError> {
        if name.is_empty()
            || name.contains(|c| c == PACKAGE_DELIMITER || c == OBJECT_DELIMITER || c == INSTANCE_DELIMITER)
        {
            return Err(AssetPathError::InvalidName(name.to_string()));
        }
        if instance_index == Some(RESERVED_INSTANCE_INDEX) {
            return Err(AssetPathError::InvalidInstanceIndex {
                path: name.to_string(),
                index: RESERVED_INSTANCE_INDEX.to_string(),
            });
        }
        if let Some(parent_entry) = &parent.entry {
            if is_package && !parent_entry.is_package {
                return Err(AssetPathError::PackageBelowObject {
                    name: name.to_string(),
                    parent: parent.to_string(),
                });
            }
            if parent_entry.instance_index.is_some() {
                return Err(AssetPathError::InstanceNotAtLeaf {
                    path: parent.to_string(),
                });
            }
        }

        let entry = PathTable::global().intern(name, instance_index, is_package, parent.entry.clone());
        Ok(AssetPath { entry: Some(entry) })
    }

    /// Append `sub` below this path.
    pub fn join(&self, sub: &AssetPath) -> Result<AssetPath, AssetPathError> {
        let mut joined = self.clone();
        for entry in sub.entries() {
            joined = AssetPath::from_parts(&entry.name, entry.is_package, &joined, entry.instance_index)?;
        }
        Ok(joined)
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Name of the last segment, without any instance index.
    pub fn name(&self) -> &str {
        self.entry.as_deref().map_or("", |e| &*e.name)
    }

    pub fn parent(&self) -> AssetPath {
        AssetPath {
            entry: self.entry.as_ref().and_then(|e| e.parent.clone()),
        }
    }

    pub fn instance_index(&self) -> Option<u32> {
        self.entry.as_ref().and_then(|e| e.instance_index)
    }

    pub fn is_package(&self) -> bool {
        self.entry.as_ref().map_or(false, |e| e.is_package)
    }

    /// The nearest package at or above this path, or the null path if there is none.
    pub fn package(&self) -> AssetPath {
        let mut current = self.entry.clone();
        while let Some(entry) = current {
            if entry.is_package {
                return AssetPath { entry: Some(entry) };
            }
            current = entry.parent.clone();
        }
        AssetPath::default()
    }

    /// Hash of the path contents, consistent for the lifetime of the process.
    pub fn compute_hash(&self) -> u64 {
        self.entry.as_ref().map_or(0, |e| e.hash)
    }

    /// Render with every package and object delimiter replaced by the platform directory separator.
    pub fn to_file_path_string(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            out.push(std::path::MAIN_SEPARATOR);
            out.push_str(&entry.name);
            if let Some(index) = entry.instance_index {
                out.push(INSTANCE_DELIMITER);
                out.push_str(&index.to_string());
            }
        }
        out
    }

    /// Drop every interned entry.
    ///
    /// Paths created before the shutdown keep their memory alive but no longer compare equal to newly parsed paths,
    /// so nothing should hold on to an [AssetPath] across this call.
    pub fn shutdown() {
        log::info!("Shutting down the asset path table");
        PathTable::global().clear();
    }

    /// Entries from the root down to this path.
    fn entries(&self) -> Vec<&PathEntry> {
        let mut entries = Vec::new();
        let mut current = self.entry.as_deref();
        while let Some(entry) = current {
            entries.push(entry);
            current = entry.parent.as_deref();
        }
        entries.reverse();
        entries
    }
}

impl PartialEq for AssetPath {
    fn eq(&self, other: &Self) -> bool {
        match (&self.entry, &other.entry) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for AssetPath {}

impl Hash for AssetPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.compute_hash());
    }
}

impl fmt::Display for AssetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries() {
            let delimiter = if entry.is_package {
                PACKAGE_DELIMITER
            } else {
                OBJECT_DELIMITER
            };
            write!(f, "{}{}", delimiter, entry.name)?;
            if let Some(index) = entry.instance_index {
                write!(f, "{}{}", INSTANCE_DELIMITER, index)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AssetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetPath(\"{}\")", self)
    }
}

impl FromStr for AssetPath {
    type Err = AssetPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetPath::parse(s)
    }
}
