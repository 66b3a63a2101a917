//! An in-memory [Vfs], for tools that build caches without touching disk and for tests.
use std::io::{Error, ErrorKind, Result};

use parking_lot::Mutex;

use crate::*;

type FileMap = std::collections::HashMap<String, Vec<u8>, ahash::RandomState>;

#[derive(Debug, Default)]
pub struct MemoryVfs {
    files: Mutex<FileMap>,
}

impl MemoryVfs {
    pub fn new() -> MemoryVfs {
        Default::default()
    }

    pub fn insert(&self, key: &str, contents: Vec<u8>) {
        self.files.lock().insert(key.to_string(), contents);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.files.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.files.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl Vfs for MemoryVfs {
    fn file_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.files.lock().get(key).map(|f| f.len() as u64))
    }

    fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let files = self.files.lock();
        let file = files
            .get(key)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{} not found", key)))?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if end <= file.len() => Ok(file[start..end].to_vec()),
            _ => Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} is past the end of {}", len, offset, key),
            )),
        }
    }

    fn write_at(&self, key: &str, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "offset too large"))?;
        let mut files = self.files.lock();
        let file = files.entry(key.to_string()).or_default();
        if file.len() < start + data.len() {
            file.resize(start + data.len(), 0);
        }
        file[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn replace(&self, key: &str, data: &[u8]) -> Result<()> {
        self.insert(key, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_vfs() {
        let vfs = MemoryVfs::new();
        assert_eq!(vfs.file_size("a").unwrap(), None);
        assert_eq!(vfs.read_at("a", 0, 1).unwrap_err().kind(), ErrorKind::NotFound);

        vfs.write_at("a", 2, b"cd").unwrap();
        assert_eq!(vfs.get("a").unwrap(), b"\0\0cd");
        vfs.write_at("a", 0, b"ab").unwrap();
        assert_eq!(vfs.read_at("a", 1, 3).unwrap(), b"bcd");
        assert_eq!(
            vfs.read_at("a", 3, 2).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );

        vfs.replace("a", b"z").unwrap();
        assert_eq!(vfs.file_size("a").unwrap(), Some(1));
        assert_eq!(vfs.remove("a").unwrap(), b"z");
        assert!(vfs.is_empty());
    }
}
