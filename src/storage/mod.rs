//! Archive storage
//!
//! One container file per archive, holding an index of stored transactions
//! grouped by bucket plus an area of out-of-line body blobs.

mod archive;
mod codec;
mod format;

pub use archive::{Archive, BlobWriter, EntryInfo, DEFAULT_INLINE_THRESHOLD};
pub use codec::{BodyRef, IndexEntry, StoredTransaction};
pub use format::{BlobHeader, FileHeader, BLOB_HEADER_SIZE, FILE_MAGIC, FILE_VERSION, HEADER_SIZE};
