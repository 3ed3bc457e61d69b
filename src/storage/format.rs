//! Container format structures
//!
//! ```text
//! +----------------------+ 0
//! | FileHeader (128 B)   |
//! +----------------------+ index_offset
//! | index records        |
//! +----------------------+ blob_offset
//! | BlobHeader + bytes   |
//! | BlobHeader + bytes   |
//! | ...                  |
//! +----------------------+
//! ```
//!
//! All integers are little-endian.

use bytemuck::{Pod, Zeroable};
use crc32fast::Hasher;

use crate::{Result, RewindError};

/// File magic bytes: "RWND\x00\x01\x00\x00"
pub const FILE_MAGIC: [u8; 8] = [0x52, 0x57, 0x4E, 0x44, 0x00, 0x01, 0x00, 0x00];

/// Current format version
pub const FILE_VERSION: u32 = 1;

/// File header size (cache-aligned to 128 bytes)
pub const HEADER_SIZE: usize = 128;

/// Blob header size
pub const BLOB_HEADER_SIZE: usize = 24;

/// Byte range of `header_crc` inside the header
const CRC_FIELD: std::ops::Range<usize> = 12..16;

/// File header (128 bytes, cache-aligned)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, align(128))]
pub struct FileHeader {
    /// Magic bytes for file format identification
    pub magic: [u8; 8],

    /// Format version
    pub version: u32,

    /// CRC32 of header (excluding this field)
    pub header_crc: u32,

    /// Number of index records
    pub entry_count: u64,

    /// Number of blobs in the blob section
    pub blob_count: u64,

    /// Offset of the index section
    pub index_offset: u64,

    /// Length of the index section in bytes
    pub index_len: u64,

    /// Offset of the blob section
    pub blob_offset: u64,

    /// Length of the blob section in bytes
    pub blob_len: u64,

    /// Creation timestamp (Unix epoch nanoseconds)
    pub created_at: u64,

    /// Next blob id to hand out after reopening
    pub next_blob_id: u64,

    /// CRC32 of the index section
    pub index_crc: u32,

    /// Reserved flags
    pub flags: u32,

    /// Reserved for future use
    pub reserved: [u8; 32],

    /// Reserved for future use
    pub reserved_tail: [u8; 8],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), HEADER_SIZE);
static_assertions::const_assert_eq!(std::mem::align_of::<FileHeader>(), 128);

/// Header preceding each blob in the blob section
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BlobHeader {
    /// Blob id referenced from the index
    pub id: u64,

    /// Body length
    pub len: u64,

    /// CRC32 of body
    pub crc: u32,

    /// Reserved
    pub reserved: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<BlobHeader>(), BLOB_HEADER_SIZE);

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            header_crc: 0,
            entry_count: 0,
            blob_count: 0,
            index_offset: HEADER_SIZE as u64,
            index_len: 0,
            blob_offset: HEADER_SIZE as u64,
            blob_len: 0,
            created_at: 0,
            next_blob_id: 0,
            index_crc: 0,
            flags: 0,
            reserved: [0; 32],
            reserved_tail: [0; 8],
        }
    }
}

impl FileHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`
    ///
    /// # Errors
    ///
    /// Returns error if `bytes` is too short, the magic or version is wrong,
    /// or the header checksum does not match
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(RewindError::InvalidFormat(format!(
                "File too small to contain header: {} bytes",
                bytes.len()
            )));
        }

        let header: Self = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);

        if header.magic != FILE_MAGIC {
            return Err(RewindError::InvalidFormat(format!(
                "Invalid magic bytes: expected {FILE_MAGIC:?}, got {:?}",
                header.magic
            )));
        }

        if header.version != FILE_VERSION {
            return Err(RewindError::InvalidFormat(format!(
                "Unsupported version: {}, expected {FILE_VERSION}",
                header.version
            )));
        }

        let computed = header_crc(&bytes[..HEADER_SIZE]);
        if header.header_crc != computed {
            return Err(RewindError::CorruptedData {
                offset: 0,
                expected: header.header_crc,
                actual: computed,
            });
        }

        Ok(header)
    }

    /// Encode with a freshly computed `header_crc`
    #[must_use]
    pub fn seal(mut self) -> [u8; HEADER_SIZE] {
        self.header_crc = 0;
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(bytemuck::bytes_of(&self));

        let crc = header_crc(&bytes);
        bytes[CRC_FIELD].copy_from_slice(&crc.to_le_bytes());
        bytes
    }
}

/// CRC over the header, skipping the CRC field itself
fn header_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..CRC_FIELD.start]); // magic + version
    hasher.update(&bytes[CRC_FIELD.end..HEADER_SIZE]); // rest of header after CRC
    hasher.finalize()
}

impl BlobHeader {
    /// Decode a blob header at the start of `bytes`
    ///
    /// # Errors
    ///
    /// Returns error if `bytes` is too short
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOB_HEADER_SIZE {
            return Err(RewindError::InvalidFormat(
                "Truncated blob header".to_string(),
            ));
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..BLOB_HEADER_SIZE]))
    }
}
