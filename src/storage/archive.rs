//! Archive store
//!
//! An open archive lives in a private working directory: index in memory,
//! large bodies as one file per blob. `close` packs the working area back
//! into a single container file and removes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crc32fast::Hasher;
use fs2::FileExt;
use memmap2::Mmap;
use parking_lot::{RwLock, RwLockWriteGuard};
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::codec::{self, BodyRef, IndexEntry, StoredTransaction};
use super::format::{BlobHeader, FileHeader, BLOB_HEADER_SIZE, HEADER_SIZE};
use crate::key::TransactionKey;
use crate::{Result, RewindError};

/// Default size above which bodies are stored as blobs
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;

type Buckets = BTreeMap<String, BTreeMap<TransactionKey, IndexEntry>>;

/// Summary of one stored transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Bucket name
    pub bucket: String,
    /// Transaction key
    pub key: TransactionKey,
    /// HTTP status code
    pub status: u16,
    /// Body length in bytes
    pub body_len: u64,
    /// Blob id, if the body is stored out of line
    pub blob: Option<u64>,
}

enum State {
    Open(Workspace),
    Closed,
    Broken(String),
}

struct Workspace {
    dir: TempDir,
    buckets: Buckets,
    created_at: u64,
    _lock: LockFile,
}

impl Workspace {
    fn blob_dir(&self) -> PathBuf {
        self.dir.path().join("blobs")
    }

    fn blob_path(&self, id: u64) -> PathBuf {
        blob_path(&self.blob_dir(), id)
    }

    fn entry_count(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    fn insert(&mut self, bucket: &str, key: TransactionKey, entry: IndexEntry) {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key, entry);
    }
}

/// Exclusive lock on `<archive>.lock`, released on drop
///
/// The file stays on disk so every opener contends for the same inode.
struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    fn acquire(archive: &Path) -> Result<Self> {
        let path = lock_path(archive);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(RewindError::ArchiveLocked(archive.to_path_buf()));
        }
        Ok(Self { file, path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

fn blob_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:016x}.blob"))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Count of streaming writes that have not committed or aborted yet
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

struct PendingGuard(Arc<PendingWrites>);

impl PendingGuard {
    fn new(pending: &Arc<PendingWrites>) -> Self {
        pending.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(pending))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Persistent transaction store backed by a single container file
///
/// Reads share a lock; writes and `close` take it exclusively. Any I/O
/// failure while writing moves the archive to a broken state in which
/// every later operation fails immediately.
pub struct Archive {
    path: PathBuf,
    inline_threshold: usize,
    next_blob_id: AtomicU64,
    state: RwLock<State>,
    pending: Arc<PendingWrites>,
}

impl Archive {
    /// Open `path` with the default inline threshold
    ///
    /// # Errors
    ///
    /// See [`Archive::open_with`]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DEFAULT_INLINE_THRESHOLD)
    }

    /// Open or create the archive at `path`
    ///
    /// A missing or empty file starts a fresh archive. Bodies longer than
    /// `inline_threshold` bytes are stored as blobs.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveLocked` if another handle has the archive open,
    /// `CorruptArchive` if the container cannot be parsed, or an I/O error
    pub fn open_with(path: impl AsRef<Path>, inline_threshold: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = LockFile::acquire(&path)?;

        let dir = tempfile::Builder::new().prefix("rewind-").tempdir()?;
        let mut workspace = Workspace {
            dir,
            buckets: Buckets::new(),
            created_at: now_nanos(),
            _lock: lock,
        };
        let blob_dir = workspace.blob_dir();
        fs::create_dir(&blob_dir)?;

        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let mut next_blob_id = 0;
        if existing {
            let file = File::open(&path)?;
            // SAFETY: the container is only replaced by rename, never written in place
            let mmap = unsafe { Mmap::map(&file)? };
            let (buckets, next_id, created_at) =
                unpack(&mmap, &blob_dir).map_err(|e| RewindError::CorruptArchive {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            workspace.buckets = buckets;
            workspace.created_at = created_at;
            next_blob_id = next_id;
        }

        info!(
            "Opened archive {} ({} entries, work dir {})",
            path.display(),
            workspace.entry_count(),
            workspace.dir.path().display()
        );

        Ok(Self {
            path,
            inline_threshold,
            next_blob_id: AtomicU64::new(next_blob_id),
            state: RwLock::new(State::Open(workspace)),
            pending: Arc::new(PendingWrites::default()),
        })
    }

    /// Container file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bodies longer than this are stored as blobs
    #[must_use]
    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    /// Check if the archive accepts operations
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), State::Open(_))
    }

    /// Check if a write failure broke the archive
    #[must_use]
    pub fn is_broken(&self) -> bool {
        matches!(*self.state.read(), State::Broken(_))
    }

    /// Number of stored transactions across all buckets
    ///
    /// # Errors
    ///
    /// Returns error if the archive is closed or broken
    pub fn len(&self) -> Result<usize> {
        match &*self.state.read() {
            State::Open(ws) => Ok(ws.entry_count()),
            other => Err(not_open(other)),
        }
    }

    /// Check if the archive holds no transactions
    ///
    /// # Errors
    ///
    /// Returns error if the archive is closed or broken
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Streaming writes still in flight
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Look up a transaction
    ///
    /// `Ok(None)` is a normal miss.
    ///
    /// # Errors
    ///
    /// Returns `CorruptArchive` if a referenced blob is missing,
    /// `CorruptedData` if a blob fails its checksum, or an error if the
    /// archive is closed or broken
    pub fn get(&self, bucket: &str, key: &TransactionKey) -> Result<Option<StoredTransaction>> {
        let state = self.state.read();
        let ws = match &*state {
            State::Open(ws) => ws,
            other => return Err(not_open(other)),
        };

        let Some(entry) = ws.buckets.get(bucket).and_then(|b| b.get(key)) else {
            return Ok(None);
        };

        let body = match &entry.body {
            BodyRef::Inline(bytes) => bytes.clone(),
            BodyRef::Blob { id, len, crc } => self.read_blob(ws, *id, *len, *crc)?,
        };

        Ok(Some(StoredTransaction {
            status: entry.status,
            headers: entry.headers.clone(),
            body,
        }))
    }

    fn read_blob(&self, ws: &Workspace, id: u64, len: u64, crc: u32) -> Result<Bytes> {
        let data = match fs::read(ws.blob_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RewindError::CorruptArchive {
                    path: self.path.clone(),
                    reason: format!("blob {id} is missing from the working area"),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != len {
            return Err(RewindError::CorruptArchive {
                path: self.path.clone(),
                reason: format!("blob {id} has {} bytes, index says {len}", data.len()),
            });
        }

        let actual = crc32fast::hash(&data);
        if actual != crc {
            return Err(RewindError::CorruptedData {
                offset: 0,
                expected: crc,
                actual,
            });
        }

        Ok(Bytes::from(data))
    }

    /// Insert or overwrite a transaction
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a field is too long to store, an error if
    /// the archive is closed or broken, or if writing the blob fails (which
    /// breaks the archive)
    pub fn put(&self, bucket: &str, key: TransactionKey, txn: &StoredTransaction) -> Result<()> {
        let mut entry = IndexEntry {
            status: txn.status,
            headers: txn.headers.clone(),
            body: if txn.body.len() > self.inline_threshold {
                BodyRef::Blob {
                    id: 0,
                    len: txn.body.len() as u64,
                    crc: crc32fast::hash(&txn.body),
                }
            } else {
                BodyRef::Inline(txn.body.clone())
            },
        };
        codec::validate(bucket, &entry)?;

        let mut state = self.state.write();
        let ws = match &mut *state {
            State::Open(ws) => ws,
            other => return Err(not_open(other)),
        };

        if let BodyRef::Blob { id, .. } = &mut entry.body {
            *id = self.next_blob_id.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = fs::write(ws.blob_path(*id), &txn.body) {
                return Err(break_archive(&mut state, &self.path, e.into()));
            }
        }

        debug!(
            "put {}/{} status={} body={} bytes",
            bucket,
            key,
            txn.status,
            entry.body.len()
        );

        ws.insert(bucket, key, entry);
        Ok(())
    }

    /// Start writing a body whose length is not known up front
    ///
    /// The body becomes visible only on [`BlobWriter::commit`]; dropping the
    /// writer discards it.
    ///
    /// # Errors
    ///
    /// Returns error if the archive is closed or broken, or the partial
    /// file cannot be created
    pub fn begin_blob(self: &Arc<Self>) -> Result<BlobWriter> {
        let (partial, final_path) = {
            let state = self.state.read();
            let ws = match &*state {
                State::Open(ws) => ws,
                other => return Err(not_open(other)),
            };
            let id = self.next_blob_id.fetch_add(1, Ordering::SeqCst);
            let final_path = ws.blob_path(id);
            let mut partial = final_path.clone().into_os_string();
            partial.push(".partial");
            ((id, PathBuf::from(partial)), final_path)
        };

        let (id, partial_path) = partial;
        let file = match File::create(&partial_path) {
            Ok(file) => file,
            Err(e) => return Err(break_archive(&mut self.state.write(), &self.path, e.into())),
        };

        debug!("begin blob {} in {}", id, self.path.display());

        Ok(BlobWriter {
            archive: Arc::clone(self),
            id,
            partial_path,
            final_path,
            file: Some(BufWriter::new(file)),
            hasher: Hasher::new(),
            len: 0,
            committed: false,
            _pending: PendingGuard::new(&self.pending),
        })
    }

    /// Wait until no streaming write is in flight
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.pending.idle.notified();
                if self.pending.count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Pack the working area into the container file and release it
    ///
    /// Closing a closed archive does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the archive is broken or packing fails (which
    /// breaks it and leaves the previous container untouched)
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match std::mem::replace(&mut *state, State::Closed) {
            State::Closed => Ok(()),
            State::Broken(reason) => {
                *state = State::Broken(reason.clone());
                Err(RewindError::ArchiveBroken(reason))
            }
            State::Open(ws) => {
                let pending = self.pending_writes();
                if pending > 0 {
                    warn!(
                        "Closing {} with {} streaming writes still open; they will be discarded",
                        self.path.display(),
                        pending
                    );
                }

                match self.pack(&ws) {
                    Ok(count) => {
                        info!("Closed archive {} ({} entries)", self.path.display(), count);
                        Ok(())
                    }
                    Err(e) => Err(break_archive(&mut state, &self.path, e)),
                }
            }
        }
    }

    fn pack(&self, ws: &Workspace) -> Result<u64> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&parent)?;

        // Only blobs the index still references are carried over
        let mut index = Vec::new();
        let mut blobs: BTreeMap<u64, (u64, u32)> = BTreeMap::new();
        let mut entry_count = 0u64;
        for (bucket, entries) in &ws.buckets {
            for (key, entry) in entries {
                codec::encode_record(&mut index, bucket, key, entry)?;
                if let BodyRef::Blob { id, len, crc } = entry.body {
                    blobs.insert(id, (len, crc));
                }
                entry_count += 1;
            }
        }

        let mut header = FileHeader::default();
        header.entry_count = entry_count;
        header.blob_count = blobs.len() as u64;
        header.index_offset = HEADER_SIZE as u64;
        header.index_len = index.len() as u64;
        header.index_crc = crc32fast::hash(&index);
        header.blob_offset = header.index_offset + header.index_len;
        header.created_at = ws.created_at;
        header.next_blob_id = self.next_blob_id.load(Ordering::SeqCst);

        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            out.write_all(&[0u8; HEADER_SIZE])?;
            out.write_all(&index)?;

            let mut blob_len = 0u64;
            for (&id, &(len, crc)) in &blobs {
                let blob_header = BlobHeader {
                    id,
                    len,
                    crc,
                    reserved: 0,
                };
                out.write_all(bytemuck::bytes_of(&blob_header))?;
                let copied = io::copy(&mut File::open(ws.blob_path(id))?, &mut out)?;
                if copied != len {
                    return Err(RewindError::CorruptArchive {
                        path: self.path.clone(),
                        reason: format!("blob {id} has {copied} bytes, index says {len}"),
                    });
                }
                blob_len += BLOB_HEADER_SIZE as u64 + len;
            }
            header.blob_len = blob_len;

            out.seek(SeekFrom::Start(0))?;
            out.write_all(&header.seal())?;
            out.flush()?;
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| RewindError::Io(e.error))?;

        Ok(entry_count)
    }

    /// List the entries of a container file without opening it for writing
    ///
    /// # Errors
    ///
    /// Returns `CorruptArchive` if the container cannot be parsed
    pub fn inspect(path: impl AsRef<Path>) -> Result<Vec<EntryInfo>> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the container is only replaced by rename, never written in place
        let mmap = unsafe { Mmap::map(&file)? };

        let records = read_index(&mmap).map_err(|e| RewindError::CorruptArchive {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(records
            .into_iter()
            .map(|r| EntryInfo {
                body_len: r.entry.body.len(),
                blob: match r.entry.body {
                    BodyRef::Blob { id, .. } => Some(id),
                    BodyRef::Inline(_) => None,
                },
                status: r.entry.status,
                bucket: r.bucket,
                key: r.key,
            })
            .collect())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                error!("Failed to close archive {} on drop: {}", self.path.display(), e);
            }
        }
    }
}

fn not_open(state: &State) -> RewindError {
    match state {
        State::Broken(reason) => RewindError::ArchiveBroken(reason.clone()),
        _ => RewindError::ArchiveClosed,
    }
}

fn break_archive(
    state: &mut RwLockWriteGuard<'_, State>,
    path: &Path,
    err: RewindError,
) -> RewindError {
    error!("Archive {} is now broken: {}", path.display(), err);
    **state = State::Broken(err.to_string());
    err
}

fn section<'a>(bytes: &'a [u8], offset: u64, len: u64, what: &str) -> Result<&'a [u8]> {
    let start = usize::try_from(offset).ok();
    let end = offset.checked_add(len).and_then(|e| usize::try_from(e).ok());
    match (start, end) {
        (Some(start), Some(end)) if end <= bytes.len() => Ok(&bytes[start..end]),
        _ => Err(RewindError::InvalidFormat(format!(
            "{what} extends beyond file: {offset}+{len} > {}",
            bytes.len()
        ))),
    }
}

fn read_index(bytes: &[u8]) -> Result<Vec<codec::IndexRecord>> {
    let header = FileHeader::read(bytes)?;
    let index = section(bytes, header.index_offset, header.index_len, "Index")?;

    let actual = crc32fast::hash(index);
    if actual != header.index_crc {
        return Err(RewindError::CorruptedData {
            offset: header.index_offset,
            expected: header.index_crc,
            actual,
        });
    }

    codec::decode_records(index, header.entry_count)
}

/// Verify a container and unpack its blobs into `blob_dir`
fn unpack(bytes: &[u8], blob_dir: &Path) -> Result<(Buckets, u64, u64)> {
    let header = FileHeader::read(bytes)?;
    let records = read_index(bytes)?;
    let blob_section = section(bytes, header.blob_offset, header.blob_len, "Blob section")?;

    let mut present: HashMap<u64, u64> = HashMap::new();
    let mut pos = 0usize;
    let mut max_id = None;
    for _ in 0..header.blob_count {
        let blob = BlobHeader::read(&blob_section[pos..])?;
        let data_offset = pos + BLOB_HEADER_SIZE;
        let data = section(blob_section, data_offset as u64, blob.len, "Blob")?;

        let actual = crc32fast::hash(data);
        if actual != blob.crc {
            return Err(RewindError::CorruptedData {
                offset: header.blob_offset + data_offset as u64,
                expected: blob.crc,
                actual,
            });
        }

        fs::write(blob_path(blob_dir, blob.id), data)?;
        present.insert(blob.id, blob.len);
        max_id = max_id.max(Some(blob.id));
        pos = data_offset + data.len();
    }

    if pos != blob_section.len() {
        return Err(RewindError::InvalidFormat(format!(
            "{} trailing bytes in blob section",
            blob_section.len() - pos
        )));
    }

    let mut buckets = Buckets::new();
    let mut seen = BTreeSet::new();
    for record in records {
        if let BodyRef::Blob { id, len, .. } = record.entry.body {
            match present.get(&id) {
                Some(&stored) if stored == len => {}
                Some(&stored) => {
                    return Err(RewindError::InvalidFormat(format!(
                        "blob {id} has {stored} bytes, index says {len}"
                    )))
                }
                None => {
                    return Err(RewindError::InvalidFormat(format!(
                        "blob {id} referenced by the index is missing"
                    )))
                }
            }
        }
        if !seen.insert((record.bucket.clone(), record.key)) {
            return Err(RewindError::InvalidFormat(format!(
                "duplicate index record {}/{}",
                record.bucket, record.key
            )));
        }
        buckets
            .entry(record.bucket)
            .or_default()
            .insert(record.key, record.entry);
    }

    let after_max = match max_id {
        Some(id) => id
            .checked_add(1)
            .ok_or_else(|| RewindError::InvalidFormat(format!("blob id {id} leaves no room")))?,
        None => 0,
    };
    let next_blob_id = after_max.max(header.next_blob_id);
    Ok((buckets, next_blob_id, header.created_at))
}

/// Streaming writer for one out-of-line body
pub struct BlobWriter {
    archive: Arc<Archive>,
    id: u64,
    partial_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: Hasher,
    len: u64,
    committed: bool,
    _pending: PendingGuard,
}

impl BlobWriter {
    /// Blob id this writer will commit under
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check if nothing has been written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a chunk
    ///
    /// # Errors
    ///
    /// Returns error if the write fails, which breaks the archive
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(RewindError::ArchiveClosed);
        };

        if let Err(e) = file.write_all(chunk) {
            self.file = None;
            return Err(break_archive(
                &mut self.archive.state.write(),
                &self.archive.path,
                e.into(),
            ));
        }

        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Make the blob visible under `bucket`/`key` with the given response head
    ///
    /// # Errors
    ///
    /// The file is flushed and synced before the archive lock is taken; the
    /// lock covers only the rename and the index insert. This blocks on
    /// disk I/O, so async callers should run it on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the bucket or headers are too long to
    /// store, an error if the archive closed or broke meanwhile, or if the
    /// blob cannot be flushed, which breaks the archive
    pub fn commit(
        mut self,
        bucket: &str,
        key: TransactionKey,
        status: u16,
        headers: Vec<(String, Vec<u8>)>,
    ) -> Result<()> {
        let file = self.file.take().ok_or(RewindError::ArchiveClosed)?;
        let entry = IndexEntry {
            status,
            headers,
            body: BodyRef::Blob {
                id: self.id,
                len: self.len,
                crc: self.hasher.clone().finalize(),
            },
        };
        codec::validate(bucket, &entry)?;

        let synced = file
            .into_inner()
            .map_err(io::IntoInnerError::into_error)
            .and_then(|f| f.sync_data());
        if let Err(e) = synced {
            let mut state = self.archive.state.write();
            if !matches!(*state, State::Open(_)) {
                return Err(not_open(&state));
            }
            return Err(break_archive(&mut state, &self.archive.path, e.into()));
        }

        let mut state = self.archive.state.write();
        let ws = match &mut *state {
            State::Open(ws) => ws,
            other => return Err(not_open(other)),
        };

        if let Err(e) = fs::rename(&self.partial_path, &self.final_path) {
            return Err(break_archive(&mut state, &self.archive.path, e.into()));
        }

        debug!(
            "commit blob {} as {}/{} ({} bytes)",
            self.id, bucket, key, self.len
        );

        ws.insert(bucket, key, entry);
        self.committed = true;
        Ok(())
    }

    /// Discard the partial blob
    pub fn abort(self) {
        debug!("abort blob {}", self.id);
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.file = None;
        if let Err(e) = fs::remove_file(&self.partial_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to discard partial blob {}: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn txn(status: u16, body: &[u8]) -> StoredTransaction {
        StoredTransaction {
            status,
            headers: vec![
                ("content-type".to_string(), b"text/plain".to_vec()),
                ("x-multi".to_string(), b"a".to_vec()),
                ("x-multi".to_string(), b"b".to_vec()),
            ],
            body: Bytes::copy_from_slice(body),
        }
    }

    fn key(s: &str) -> TransactionKey {
        TransactionKey::digest(s.as_bytes())
    }

    #[test]
    fn test_put_get_inline_and_blob() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open_with(dir.path().join("a.rwnd"), 16).unwrap();

        let small = txn(200, b"small");
        let large = txn(201, &[7u8; 1000]);
        archive.put("b", key("small"), &small).unwrap();
        archive.put("b", key("large"), &large).unwrap();

        assert_eq!(archive.get("b", &key("small")).unwrap(), Some(small));
        assert_eq!(archive.get("b", &key("large")).unwrap(), Some(large));
        assert_eq!(archive.get("b", &key("missing")).unwrap(), None);
        assert_eq!(archive.get("other", &key("small")).unwrap(), None);
        assert_eq!(archive.len().unwrap(), 2);
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open_with(dir.path().join("a.rwnd"), 4).unwrap();

        archive.put("b", key("k"), &txn(200, b"first body")).unwrap();
        archive.put("b", key("k"), &txn(404, b"second")).unwrap();

        let got = archive.get("b", &key("k")).unwrap().unwrap();
        assert_eq!(got.status, 404);
        assert_eq!(&got.body[..], b"second");
        assert_eq!(archive.len().unwrap(), 1);
    }

    #[test]
    fn test_close_open_cycles_preserve_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");

        let small = txn(200, b"small");
        let large = txn(500, &(0..=255u8).cycle().take(4096).collect::<Vec<_>>());
        {
            let archive = Archive::open_with(&path, 64).unwrap();
            archive.put("one", key("small"), &small).unwrap();
            archive.put("two", key("large"), &large).unwrap();
            archive.close().unwrap();
        }

        for _ in 0..3 {
            let archive = Archive::open_with(&path, 64).unwrap();
            assert_eq!(archive.get("one", &key("small")).unwrap(), Some(small.clone()));
            assert_eq!(archive.get("two", &key("large")).unwrap(), Some(large.clone()));
            archive.close().unwrap();
        }

        // Lock file stays behind, unlocked
        assert!(lock_path(&path).exists());
        Archive::open(&path).unwrap().close().unwrap();
    }

    #[test]
    fn test_overwritten_blobs_dropped_at_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");

        let archive = Archive::open_with(&path, 4).unwrap();
        archive.put("b", key("k"), &txn(200, &[1u8; 100])).unwrap();
        archive.put("b", key("k"), &txn(200, &[2u8; 100])).unwrap();
        archive.close().unwrap();

        let entries = Archive::inspect(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].blob, Some(1));

        let header = FileHeader::read(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(header.blob_count, 1);
        assert_eq!(header.next_blob_id, 2);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");

        let archive = Archive::open(&path).unwrap();
        assert!(matches!(
            Archive::open(&path),
            Err(RewindError::ArchiveLocked(_))
        ));

        archive.close().unwrap();
        Archive::open(&path).unwrap().close().unwrap();
    }

    #[test]
    fn test_empty_file_is_fresh_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        File::create(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(archive.is_empty().unwrap());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        fs::write(&path, b"definitely not an archive").unwrap();

        let err = Archive::open(&path).err().unwrap();
        assert!(err.is_corruption());

        // Lock is released after a failed open
        let err = Archive::open(&path).err().unwrap();
        assert!(!matches!(err, RewindError::ArchiveLocked(_)));
    }

    #[test]
    fn test_flipped_blob_byte_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");

        let archive = Archive::open_with(&path, 4).unwrap();
        archive.put("b", key("k"), &txn(200, &[9u8; 64])).unwrap();
        archive.close().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Archive::open(&path),
            Err(RewindError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_missing_blob_in_work_area_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open_with(dir.path().join("a.rwnd"), 4).unwrap();
        archive.put("b", key("k"), &txn(200, &[3u8; 64])).unwrap();

        {
            let state = archive.state.read();
            let State::Open(ws) = &*state else {
                panic!("archive should be open")
            };
            fs::remove_file(ws.blob_path(0)).unwrap();
        }

        let err = archive.get("b", &key("k")).unwrap_err();
        assert!(matches!(err, RewindError::CorruptArchive { .. }));
    }

    #[test]
    fn test_closed_archive_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.rwnd")).unwrap();
        archive.close().unwrap();
        archive.close().unwrap();

        assert!(matches!(
            archive.get("b", &key("k")),
            Err(RewindError::ArchiveClosed)
        ));
        assert!(matches!(
            archive.put("b", key("k"), &txn(200, b"")),
            Err(RewindError::ArchiveClosed)
        ));
    }

    #[test]
    fn test_streaming_blob_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        let archive = Arc::new(Archive::open(&path).unwrap());

        let mut writer = archive.begin_blob().unwrap();
        assert_eq!(archive.pending_writes(), 1);
        writer.write_chunk(b"hello ").unwrap();
        writer.write_chunk(b"world").unwrap();
        writer
            .commit("b", key("k"), 200, vec![("x".to_string(), b"y".to_vec())])
            .unwrap();
        assert_eq!(archive.pending_writes(), 0);

        let got = archive.get("b", &key("k")).unwrap().unwrap();
        assert_eq!(&got.body[..], b"hello world");

        archive.close().unwrap();
        let reopened = Archive::open(&path).unwrap();
        let got = reopened.get("b", &key("k")).unwrap().unwrap();
        assert_eq!(&got.body[..], b"hello world");
        assert_eq!(got.headers, vec![("x".to_string(), b"y".to_vec())]);
    }

    #[test]
    fn test_dropped_blob_writer_discards() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(Archive::open(dir.path().join("a.rwnd")).unwrap());

        let mut writer = archive.begin_blob().unwrap();
        writer.write_chunk(b"partial").unwrap();
        let partial = writer.partial_path.clone();
        assert!(partial.exists());
        drop(writer);

        assert!(!partial.exists());
        assert_eq!(archive.pending_writes(), 0);
        assert!(archive.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_drain_waits_for_writers() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(Archive::open(dir.path().join("a.rwnd")).unwrap());

        assert!(archive.drain(Duration::from_millis(10)).await);

        let writer = archive.begin_blob().unwrap();
        assert!(!archive.drain(Duration::from_millis(20)).await);

        let waiter = {
            let archive = Arc::clone(&archive);
            tokio::spawn(async move { archive.drain(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.abort();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_oversized_put_rejected_before_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        let kept = txn(200, b"kept");

        let archive = Archive::open(&path).unwrap();
        archive.put("ok", key("k"), &kept).unwrap();

        let err = archive
            .put(&"b".repeat(70_000), key("k"), &txn(200, b"lost"))
            .unwrap_err();
        assert!(matches!(err, RewindError::InvalidFormat(_)));

        let mut wide = txn(200, b"x");
        wide.headers.push(("h".repeat(70_000), Vec::new()));
        assert!(archive.put("ok", key("wide"), &wide).is_err());

        assert!(archive.is_open());
        assert_eq!(archive.len().unwrap(), 1);
        archive.close().unwrap();

        let reopened = Archive::open(&path).unwrap();
        assert_eq!(reopened.get("ok", &key("k")).unwrap(), Some(kept));
    }

    #[test]
    fn test_oversized_commit_rejected_before_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        let archive = Arc::new(Archive::open(&path).unwrap());
        archive.put("ok", key("k"), &txn(200, b"kept")).unwrap();

        let mut writer = archive.begin_blob().unwrap();
        writer.write_chunk(b"streamed").unwrap();
        let err = writer
            .commit(&"b".repeat(70_000), key("s"), 200, Vec::new())
            .unwrap_err();
        assert!(matches!(err, RewindError::InvalidFormat(_)));
        assert_eq!(archive.pending_writes(), 0);

        archive.close().unwrap();
        assert_eq!(Archive::inspect(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_blob_write_failure_breaks_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        let archive = Archive::open_with(&path, 4).unwrap();
        archive.put("b", key("small"), &txn(200, b"ok")).unwrap();

        {
            let state = archive.state.read();
            let State::Open(ws) = &*state else {
                panic!("archive should be open")
            };
            fs::remove_dir_all(ws.blob_dir()).unwrap();
        }

        let err = archive.put("b", key("large"), &txn(200, &[5u8; 64])).unwrap_err();
        assert!(matches!(err, RewindError::Io(_)));
        assert!(archive.is_broken());

        assert!(matches!(
            archive.get("b", &key("small")),
            Err(RewindError::ArchiveBroken(_))
        ));
        assert!(matches!(
            archive.put("b", key("small"), &txn(200, b"ok")),
            Err(RewindError::ArchiveBroken(_))
        ));
        assert!(matches!(archive.close(), Err(RewindError::ArchiveBroken(_))));
        assert!(matches!(archive.len(), Err(RewindError::ArchiveBroken(_))));

        // Previous container, if any, is left alone
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_puts_and_gets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");
        let archive = Archive::open_with(&path, 32).unwrap();

        std::thread::scope(|s| {
            for t in 0..4 {
                let archive = &archive;
                s.spawn(move || {
                    for i in 0..50 {
                        let name = format!("{t}-{i}");
                        let body = if i % 2 == 0 { vec![t as u8; 8] } else { vec![t as u8; 100] };
                        archive.put("b", key(&name), &txn(200, &body)).unwrap();
                        let got = archive.get("b", &key(&name)).unwrap().unwrap();
                        assert_eq!(&got.body[..], &body[..]);
                    }
                });
            }
            for _ in 0..2 {
                let archive = &archive;
                s.spawn(move || {
                    for i in 0..50 {
                        archive.get("b", &key(&format!("0-{i}"))).unwrap();
                    }
                });
            }
        });

        assert_eq!(archive.len().unwrap(), 200);
        archive.close().unwrap();
        assert_eq!(Archive::inspect(&path).unwrap().len(), 200);
    }

    #[test]
    fn test_exhausted_blob_id_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rwnd");

        let archive = Archive::open_with(&path, 4).unwrap();
        archive.next_blob_id.store(u64::MAX, Ordering::SeqCst);
        archive.put("b", key("k"), &txn(200, &[1u8; 16])).unwrap();
        archive.close().unwrap();

        assert_eq!(Archive::inspect(&path).unwrap()[0].blob, Some(u64::MAX));
        assert!(matches!(
            Archive::open(&path),
            Err(RewindError::CorruptArchive { .. })
        ));
    }
}
