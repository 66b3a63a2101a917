//! The serialized form of one cached object.
//!
//! ```text
//! header:               link_table_end: u32, property_end: u32, resource_end: u32 (absolute offsets)
//! link table:           type, template, owner (u16 length + UTF-8, empty for none), count: u32, count references
//! properties:           [link_table_end, property_end)
//! persistent resource:  [property_end, resource_end)
//! ```
//!
//! Property and resource bytes are opaque here; the loader hands them out as ranges of the loaded buffer.
use std::ops::Range;

use crate::*;

pub const RECORD_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Truncated(#[from] Truncated),
    #[error("record regions (link table end {link_table_end}, property end {property_end}, resource end {resource_end}) do not fit a {len} byte buffer")]
    InvalidRegions {
        len: usize,
        link_table_end: u32,
        property_end: u32,
        resource_end: u32,
    },
    #[error("{what} link is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },
    #[error("{what} link \"{path}\" is malformed")]
    InvalidLinkPath {
        what: &'static str,
        path: String,
        #[source]
        source: AssetPathError,
    },
    #[error("reference {index} is empty")]
    EmptyReference { index: u32 },
    #[error("{what} is too large to encode")]
    TooLarge { what: &'static str },
}

/// Byte ranges of the three regions of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRegions {
    pub link_table: Range<usize>,
    pub properties: Range<usize>,
    pub persistent_resource: Range<usize>,
}

impl RecordRegions {
    /// Read and validate the header of `buffer`.
    pub fn read(buffer: &[u8]) -> Result<RecordRegions, RecordError> {
        let mut reader = ByteReader::new(buffer);
        let link_table_end = reader.read_u32("record link table end")?;
        let property_end = reader.read_u32("record property end")?;
        let resource_end = reader.read_u32("record resource end")?;

        let ordered = RECORD_HEADER_SIZE <= link_table_end as usize
            && link_table_end <= property_end
            && property_end <= resource_end
            && resource_end as usize <= buffer.len();
        if !ordered {
            return Err(RecordError::InvalidRegions {
                len: buffer.len(),
                link_table_end,
                property_end,
                resource_end,
            });
        }

        Ok(RecordRegions {
            link_table: RECORD_HEADER_SIZE..link_table_end as usize,
            properties: link_table_end as usize..property_end as usize,
            persistent_resource: property_end as usize..resource_end as usize,
        })
    }
}

/// The links of a record.  The null path means the link is absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkTableData {
    pub type_path: AssetPath,
    pub template: AssetPath,
    pub owner: AssetPath,
    pub references: Vec<AssetPath>,
}

fn read_link(reader: &mut ByteReader<'_>, what: &'static str) -> Result<AssetPath, RecordError> {
    let bytes = reader.read_string(what)?;
    let text = std::str::from_utf8(bytes).map_err(|_| RecordError::InvalidUtf8 { what })?;
    AssetPath::parse(text).map_err(|source| RecordError::InvalidLinkPath {
        what,
        path: text.to_string(),
        source,
    })
}

fn write_link(writer: &mut ByteWriter, path: &AssetPath, what: &'static str) -> Result<(), RecordError> {
    writer
        .write_string(&path.to_string())
        .map_err(|_| RecordError::TooLarge { what })
}

impl LinkTableData {
    /// Parse the link table region, not including the header.
    pub fn read(bytes: &[u8]) -> Result<LinkTableData, RecordError> {
        let mut reader = ByteReader::new(bytes);
        let type_path = read_link(&mut reader, "type")?;
        let template = read_link(&mut reader, "template")?;
        let owner = read_link(&mut reader, "owner")?;

        let count = reader.read_u32("reference count")?;
        let mut references = Vec::with_capacity((count as usize).min(reader.remaining() / 2));
        for index in 0..count {
            let reference = read_link(&mut reader, "reference")?;
            if reference.is_empty() {
                return Err(RecordError::EmptyReference { index });
            }
            references.push(reference);
        }

        if reader.remaining() != 0 {
            log::debug!("Ignoring {} trailing link table bytes", reader.remaining());
        }

        Ok(LinkTableData {
            type_path,
            template,
            owner,
            references,
        })
    }

    fn write(&self, writer: &mut ByteWriter) -> Result<(), RecordError> {
        write_link(writer, &self.type_path, "type")?;
        write_link(writer, &self.template, "template")?;
        write_link(writer, &self.owner, "owner")?;

        let count = u32::try_from(self.references.len()).map_err(|_| RecordError::TooLarge {
            what: "reference list",
        })?;
        writer.write_u32(count);
        for (index, reference) in self.references.iter().enumerate() {
            if reference.is_empty() {
                return Err(RecordError::EmptyReference {
                    index: index as u32,
                });
            }
            write_link(writer, reference, "reference")?;
        }
        Ok(())
    }
}

/// Builds the bytes of a record, e.g. for [Cache::cache_entry].
#[derive(Clone, Debug, Default)]
pub struct ObjectRecordWriter {
    links: LinkTableData,
    properties: Vec<u8>,
    persistent_resource: Vec<u8>,
}

impl ObjectRecordWriter {
    pub fn new() -> ObjectRecordWriter {
        Default::default()
    }

    pub fn type_path(mut self, path: AssetPath) -> Self {
        self.links.type_path = path;
        self
    }

    pub fn template(mut self, path: AssetPath) -> Self {
        self.links.template = path;
        self
    }

    pub fn owner(mut self, path: AssetPath) -> Self {
        self.links.owner = path;
        self
    }

    pub fn reference(mut self, path: AssetPath) -> Self {
        self.links.references.push(path);
        self
    }

    pub fn properties(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.properties = bytes.into();
        self
    }

    pub fn persistent_resource(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.persistent_resource = bytes.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let mut writer = ByteWriter::new();
        writer.write_bytes(&[0; RECORD_HEADER_SIZE]);
        self.links.write(&mut writer)?;

        let region_end = |writer: &ByteWriter, what: &'static str| {
            u32::try_from(writer.len()).map_err(|_| RecordError::TooLarge { what })
        };
        let link_table_end = region_end(&writer, "link table")?;
        writer.write_bytes(&self.properties);
        let property_end = region_end(&writer, "property region")?;
        writer.write_bytes(&self.persistent_resource);
        let resource_end = region_end(&writer, "persistent resource region")?;

        writer.patch_u32(0, link_table_end);
        writer.patch_u32(4, property_end);
        writer.patch_u32(8, resource_end);
        Ok(writer.into_inner())
    }
}
