//! Index record codec
//!
//! Record layout:
//!
//! ```text
//! bucket_len: u16 | bucket | key: [u8; 32] | status: u16 | header_count: u16
//! (name_len: u16 | name | value_len: u32 | value)*
//! body_tag: u8 = 0 | len: u32 | bytes        inline body
//! body_tag: u8 = 1 | id: u64 | len: u64 | crc: u32   blob reference
//! ```

use bytes::Bytes;

use crate::key::{TransactionKey, KEY_LEN};
use crate::{Result, RewindError};

const TAG_INLINE: u8 = 0;
const TAG_BLOB: u8 = 1;

/// A transaction as stored and returned by the archive
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredTransaction {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs in wire order
    pub headers: Vec<(String, Vec<u8>)>,
    /// Full body
    pub body: Bytes,
}

/// Where a stored body lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRef {
    /// Kept in the index record
    Inline(Bytes),
    /// Kept out of line in the blob area
    Blob {
        /// Blob id
        id: u64,
        /// Body length
        len: u64,
        /// CRC32 of the body
        crc: u32,
    },
}

impl BodyRef {
    /// Body length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Blob { len, .. } => *len,
        }
    }

    /// Check if the body is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index value for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs
    pub headers: Vec<(String, Vec<u8>)>,
    /// Body location
    pub body: BodyRef,
}

/// One decoded index record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Bucket name
    pub bucket: String,
    /// Transaction key
    pub key: TransactionKey,
    /// Stored value
    pub entry: IndexEntry,
}

/// Append one record to `out`
///
/// # Errors
///
/// Returns error if a field exceeds its length prefix
pub fn encode_record(
    out: &mut Vec<u8>,
    bucket: &str,
    key: &TransactionKey,
    entry: &IndexEntry,
) -> Result<()> {
    put_u16_bytes(out, bucket.as_bytes())?;
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&entry.status.to_le_bytes());

    let count = u16::try_from(entry.headers.len())
        .map_err(|_| too_long("header count", entry.headers.len()))?;
    out.extend_from_slice(&count.to_le_bytes());
    for (name, value) in &entry.headers {
        put_u16_bytes(out, name.as_bytes())?;
        put_u32_bytes(out, value)?;
    }

    match &entry.body {
        BodyRef::Inline(bytes) => {
            out.push(TAG_INLINE);
            put_u32_bytes(out, bytes)?;
        }
        BodyRef::Blob { id, len, crc } => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
        }
    }

    Ok(())
}

/// Check that `bucket` and `entry` fit their length prefixes
///
/// [`encode_record`] cannot fail on a record that passes this check.
///
/// # Errors
///
/// Returns `InvalidFormat` naming the first field that is too long
pub fn validate(bucket: &str, entry: &IndexEntry) -> Result<()> {
    fits::<u16>("bucket", bucket.len())?;
    fits::<u16>("header count", entry.headers.len())?;
    for (name, value) in &entry.headers {
        fits::<u16>("header name", name.len())?;
        fits::<u32>("header value", value.len())?;
    }
    if let BodyRef::Inline(bytes) = &entry.body {
        fits::<u32>("inline body", bytes.len())?;
    }
    Ok(())
}

fn fits<T: TryFrom<usize>>(what: &str, len: usize) -> Result<()> {
    T::try_from(len).map(|_| ()).map_err(|_| too_long(what, len))
}

/// Decode exactly `count` records from `buf`
///
/// # Errors
///
/// Returns error if the buffer is truncated, has trailing bytes, or holds
/// an unknown body tag
pub fn decode_records(buf: &[u8], count: u64) -> Result<Vec<IndexRecord>> {
    let mut cursor = Cursor::new(buf);
    let mut records = Vec::new();

    for _ in 0..count {
        let bucket = cursor.string_u16()?;

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(cursor.take(KEY_LEN)?);

        let status = cursor.u16()?;
        let header_count = cursor.u16()?;
        let mut headers = Vec::with_capacity(usize::from(header_count));
        for _ in 0..header_count {
            let name = cursor.string_u16()?;
            let len = cursor.u32()? as usize;
            headers.push((name, cursor.take(len)?.to_vec()));
        }

        let body = match cursor.u8()? {
            TAG_INLINE => {
                let len = cursor.u32()? as usize;
                BodyRef::Inline(Bytes::copy_from_slice(cursor.take(len)?))
            }
            TAG_BLOB => BodyRef::Blob {
                id: cursor.u64()?,
                len: cursor.u64()?,
                crc: cursor.u32()?,
            },
            tag => {
                return Err(RewindError::InvalidFormat(format!(
                    "Unknown body tag {tag} at offset {}",
                    cursor.pos - 1
                )))
            }
        };

        records.push(IndexRecord {
            bucket,
            key: TransactionKey::from_bytes(key),
            entry: IndexEntry {
                status,
                headers,
                body,
            },
        });
    }

    if cursor.remaining() != 0 {
        return Err(RewindError::InvalidFormat(format!(
            "{} trailing bytes after {count} index records",
            cursor.remaining()
        )));
    }

    Ok(records)
}

fn too_long(what: &str, len: usize) -> RewindError {
    RewindError::InvalidFormat(format!("{what} too long to encode: {len}"))
}

fn put_u16_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| too_long("field", bytes.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_u32_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| too_long("field", bytes.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(RewindError::InvalidFormat(format!(
                "Index truncated at offset {}: need {n} bytes, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string_u16(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let start = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            RewindError::InvalidFormat(format!("Invalid UTF-8 string at offset {start}"))
        })
    }
}
