//! Encoding and decoding of the cache table of contents.
//!
//! Layout, little-endian when written:
//!
//! ```text
//! magic: u32, version: u32, count: u32
//! count times: path (u16 length + UTF-8), sub-data index: u32, offset: u64, size: u32, timestamp: i64
//! ```
//!
//! A TOC whose magic reads byte-swapped was written on a big-endian machine and is decoded as big-endian.
use std::collections::HashSet;

use crate::*;

pub const TOC_MAGIC: u32 = 0xcac4_e70c;
pub const TOC_VERSION: u32 = 1;

const TOC_MAGIC_SWAPPED: u32 = TOC_MAGIC.swap_bytes();

/// Smallest possible encoded entry: a one-byte path plus the fixed-size fields.
const MIN_ENTRY_SIZE: usize = 2 + 2 + 4 + 8 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TocError {
    #[error(transparent)]
    Truncated(#[from] Truncated),
    #[error("invalid TOC magic {0:#010x}")]
    BadMagic(u32),
    #[error("TOC version {found} is newer than the supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("TOC entry {index} has a path which is not valid UTF-8")]
    InvalidUtf8 { index: u32 },
    #[error("TOC entry {index} has an empty path")]
    EmptyPath { index: u32 },
    #[error("TOC entry {index} has an invalid path")]
    InvalidPath {
        index: u32,
        #[source]
        source: AssetPathError,
    },
    #[error("duplicate TOC entry for \"{path}\", sub-data {sub_data_index}")]
    DuplicateEntry { path: String, sub_data_index: u32 },
    #[error("path \"{0}\" is too long to store in a TOC")]
    PathTooLong(String),
    #[error("too many entries to store in a TOC")]
    TooManyEntries,
}

/// Decode a complete TOC.  Any failure rejects the whole TOC.
pub fn read_toc(data: &[u8]) -> Result<Vec<CacheEntry>, TocError> {
    let mut reader = ByteReader::new(data);

    let magic = reader.read_u32("TOC magic")?;
    if magic == TOC_MAGIC_SWAPPED {
        reader.set_order(ByteOrder::Big);
    } else if magic != TOC_MAGIC {
        return Err(TocError::BadMagic(magic));
    }

    let version = reader.read_u32("TOC version")?;
    if version > TOC_VERSION {
        return Err(TocError::UnsupportedVersion {
            found: version,
            supported: TOC_VERSION,
        });
    }

    let count = reader.read_u32("TOC entry count")?;

    // Don't trust the count for the allocation; a corrupt one would otherwise reserve gigabytes.
    let mut entries = Vec::with_capacity((count as usize).min(reader.remaining() / MIN_ENTRY_SIZE));
    let mut seen = HashSet::with_capacity_and_hasher(entries.capacity(), ahash::RandomState::new());

    for index in 0..count {
        let path_bytes = reader.read_string("TOC entry path")?;
        let path_string =
            std::str::from_utf8(path_bytes).map_err(|_| TocError::InvalidUtf8 { index })?;
        let path = AssetPath::parse(path_string)
            .map_err(|source| TocError::InvalidPath { index, source })?;
        if path.is_empty() {
            return Err(TocError::EmptyPath { index });
        }

        let sub_data_index = reader.read_u32("TOC entry sub-data index")?;
        let offset = reader.read_u64("TOC entry offset")?;
        let size = reader.read_u32("TOC entry size")?;
        let timestamp = reader.read_i64("TOC entry timestamp")?;

        if !seen.insert((path.clone(), sub_data_index)) {
            return Err(TocError::DuplicateEntry {
                path: path.to_string(),
                sub_data_index,
            });
        }

        entries.push(CacheEntry {
            path,
            sub_data_index,
            offset,
            size,
            timestamp,
        });
    }

    if reader.remaining() != 0 {
        log::warn!("TOC has {} trailing bytes", reader.remaining());
    }

    Ok(entries)
}

/// Encode a TOC, entries in the order given.
pub fn write_toc<'a>(entries: impl IntoIterator<Item = &'a CacheEntry>) -> Result<Vec<u8>, TocError> {
    let mut writer = ByteWriter::new();
    writer.write_u32(TOC_MAGIC);
    writer.write_u32(TOC_VERSION);
    let count_at = writer.len();
    writer.write_u32(0);

    let mut count = 0u32;
    for entry in entries {
        let path = entry.path.to_string();
        writer
            .write_string(&path)
            .map_err(|_| TocError::PathTooLong(path.clone()))?;
        writer.write_u32(entry.sub_data_index);
        writer.write_u64(entry.offset);
        writer.write_u32(entry.size);
        writer.write_i64(entry.timestamp);
        count = count.checked_add(1).ok_or(TocError::TooManyEntries)?;
    }

    writer.patch_u32(count_at, count);
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, sub_data_index: u32, offset: u64, size: u32) -> CacheEntry {
        CacheEntry {
            path: AssetPath::parse(path).unwrap(),
            sub_data_index,
            offset,
            size,
            timestamp: 1234,
        }
    }

    fn sample() -> Vec<CacheEntry> {
        vec![
            entry("/TocTest:A", 0, 0, 10),
            entry("/TocTest:A", 1, 10, 5),
            entry("/TocTest/Sub:B*2", 0, 15, 100),
        ]
    }

    #[test]
    fn encode_decode() {
        let entries = sample();
        let bytes = write_toc(&entries).unwrap();
        assert_eq!(read_toc(&bytes).unwrap(), entries);

        let empty = write_toc(&Vec::new()).unwrap();
        assert_eq!(empty.len(), 12);
        assert!(read_toc(&empty).unwrap().is_empty());
    }

    #[test]
    fn big_endian_toc_is_accepted() {
        let mut writer = ByteWriter::new();
        writer.write_bytes(&TOC_MAGIC.to_be_bytes());
        writer.write_bytes(&TOC_VERSION.to_be_bytes());
        writer.write_bytes(&1u32.to_be_bytes());
        let path = b"/TocTest:BigEndian";
        writer.write_bytes(&(path.len() as u16).to_be_bytes());
        writer.write_bytes(path);
        writer.write_bytes(&3u32.to_be_bytes());
        writer.write_bytes(&40u64.to_be_bytes());
        writer.write_bytes(&8u32.to_be_bytes());
        writer.write_bytes(&(-1i64).to_be_bytes());

        let entries = read_toc(&writer.into_inner()).unwrap();
        assert_eq!(
            entries,
            vec![CacheEntry {
                path: AssetPath::parse("/TocTest:BigEndian").unwrap(),
                sub_data_index: 3,
                offset: 40,
                size: 8,
                timestamp: -1,
            }]
        );
    }

    #[test]
    fn truncated_toc_is_rejected() {
        let bytes = write_toc(&sample()).unwrap();
        for len in 0..bytes.len() {
            assert!(read_toc(&bytes[..len]).is_err(), "length {} should fail", len);
        }

        // A claimed count well beyond the data must not allocate or succeed.
        let mut huge = bytes[..12].to_vec();
        huge[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(read_toc(&huge), Err(TocError::Truncated(_))));
    }

    #[test]
    fn bad_headers() {
        let mut bytes = write_toc(&sample()).unwrap();
        bytes[4..8].copy_from_slice(&(TOC_VERSION + 1).to_le_bytes());
        assert_eq!(
            read_toc(&bytes),
            Err(TocError::UnsupportedVersion {
                found: TOC_VERSION + 1,
                supported: TOC_VERSION,
            })
        );

        bytes[0] ^= 0xff;
        assert!(matches!(read_toc(&bytes), Err(TocError::BadMagic(_))));
    }

    #[test]
    fn duplicates_and_bad_paths() {
        let dup = vec![entry("/TocTest:Dup", 0, 0, 1), entry("/TocTest:Dup", 0, 1, 1)];
        let bytes = write_toc(&dup).unwrap();
        assert!(matches!(
            read_toc(&bytes),
            Err(TocError::DuplicateEntry { sub_data_index: 0, .. })
        ));

        let mut writer = ByteWriter::new();
        writer.write_u32(TOC_MAGIC);
        writer.write_u32(TOC_VERSION);
        writer.write_u32(1);
        writer.write_string("NoDelimiter").unwrap();
        writer.write_bytes(&[0; 24]);
        assert!(matches!(
            read_toc(&writer.into_inner()),
            Err(TocError::InvalidPath { index: 0, .. })
        ));
    }
}
