//! Record/replay cache modifier
//!
//! In record mode every response is stored under the key of the request
//! that produced it. In replay mode a stored response is served for a
//! matching request and the upstream round-trip is skipped; a miss lets the
//! request through unless the modifier is hermetic.

mod factory;
mod pool;
mod stream;

pub use factory::register;
pub use pool::ArchivePool;
pub use stream::RecordingStream;

use std::sync::Arc;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::Mode;
use crate::key::{KeyFunction, TransactionKey, UrlKey};
use crate::message::{Body, Context, Request, RequestHead, Response};
use crate::modifier::Modifier;
use crate::storage::{Archive, StoredTransaction};
use crate::{Result, RewindError};

/// Registered type name
pub const MODIFIER_NAME: &str = "cache.Modifier";

/// Modifier that records responses to, or replays them from, an archive
pub struct CacheModifier {
    archive: Arc<Archive>,
    bucket: String,
    mode: RwLock<Mode>,
    key_fn: Arc<dyn KeyFunction>,
    hermetic: bool,
    failure: RwLock<Option<String>>,
}

impl CacheModifier {
    /// Record into `bucket` of `archive` with the default key function
    #[must_use]
    pub fn new(archive: Arc<Archive>, bucket: impl Into<String>) -> Self {
        Self {
            archive,
            bucket: bucket.into(),
            mode: RwLock::new(Mode::Record),
            key_fn: Arc::new(UrlKey::new()),
            hermetic: false,
            failure: RwLock::new(None),
        }
    }

    /// Start in `mode`
    #[must_use]
    pub fn with_mode(self, mode: Mode) -> Self {
        *self.mode.write() = mode;
        self
    }

    /// Derive keys with `key_fn`
    #[must_use]
    pub fn with_key_fn(mut self, key_fn: Arc<dyn KeyFunction>) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Fail replay misses instead of letting them through
    #[must_use]
    pub fn hermetic(mut self, hermetic: bool) -> Self {
        self.hermetic = hermetic;
        self
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Switch mode; waits for lookups and stores already in progress
    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.mode.write();
        if *current != mode {
            info!("{} {:?} -> {:?}", MODIFIER_NAME, *current, mode);
            *current = mode;
        }
    }

    /// Backing archive
    #[must_use]
    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// Bucket inside the archive
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Reason the modifier stopped working, if it did
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }

    fn check_healthy(&self) -> Result<()> {
        match &*self.failure.read() {
            Some(reason) => Err(RewindError::ArchiveBroken(reason.clone())),
            None => Ok(()),
        }
    }

    fn key_for(&self, head: &RequestHead, ctx: &Context) -> Result<TransactionKey> {
        match ctx.cache_key() {
            Some(key) => Ok(*key),
            None => self.key_fn.derive(head),
        }
    }

    fn fail(&self, err: RewindError) -> RewindError {
        if err.is_corruption() || matches!(err, RewindError::ArchiveBroken(_)) {
            let mut failure = self.failure.write();
            if failure.is_none() {
                error!(
                    "{} on {} disabled: {}",
                    MODIFIER_NAME,
                    self.archive.path().display(),
                    err
                );
                *failure = Some(err.to_string());
            }
        }
        RewindError::modifier_failed(MODIFIER_NAME, err)
    }

    fn replay(&self, req: &Request, ctx: &mut Context) -> Result<()> {
        self.check_healthy()?;
        let key = self.key_for(&req.head, ctx)?;

        match self.archive.get(&self.bucket, &key)? {
            Some(txn) => {
                debug!("replay hit {} {} -> {}", req.head.method, req.head.uri, key);
                let res = into_response(txn, req.head.clone())?;
                ctx.replay(res);
                Ok(())
            }
            None if self.hermetic => Err(RewindError::HermeticMiss(key.to_string())),
            None => {
                debug!("replay miss {} {} -> {}", req.head.method, req.head.uri, key);
                Ok(())
            }
        }
    }

    fn record(&self, res: &mut Response, ctx: &Context) -> Result<()> {
        self.check_healthy()?;
        let key = self.key_for(&res.request, ctx)?;
        let status = res.status.as_u16();
        let headers = header_pairs(&res.headers);

        let (body, outcome) = match std::mem::take(&mut res.body) {
            Body::Full(bytes) => {
                let txn = StoredTransaction {
                    status,
                    headers,
                    body: bytes.clone(),
                };
                let outcome = self.archive.put(&self.bucket, key, &txn);
                (Body::Full(bytes), outcome)
            }
            Body::Streaming(inner) => match self.archive.begin_blob() {
                Ok(writer) => {
                    let recording =
                        RecordingStream::new(inner, writer, self.bucket.clone(), key, status, headers);
                    (Body::Streaming(Box::pin(recording)), Ok(()))
                }
                Err(e) => (Body::Streaming(inner), Err(e)),
            },
        };
        res.body = body;

        if outcome.is_ok() {
            debug!("recorded {} {} -> {}", res.request.method, res.request.uri, key);
        }
        outcome
    }
}

impl Modifier for CacheModifier {
    fn modify_request(&self, req: &mut Request, ctx: &mut Context) -> Result<()> {
        let mode = self.mode.read();
        if *mode != Mode::Replay {
            return Ok(());
        }
        self.replay(req, ctx).map_err(|e| self.fail(e))
    }

    fn modify_response(&self, res: &mut Response, ctx: &mut Context) -> Result<()> {
        let mode = self.mode.read();
        if *mode != Mode::Record || ctx.was_replayed() {
            return Ok(());
        }
        self.record(res, ctx).map_err(|e| self.fail(e))
    }
}

/// Header pairs in wire order
fn header_pairs(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

/// Rebuild a response from its stored form
fn into_response(txn: StoredTransaction, request: RequestHead) -> Result<Response> {
    let status = StatusCode::from_u16(txn.status)
        .map_err(|_| RewindError::InvalidFormat(format!("stored status {} is invalid", txn.status)))?;

    let mut headers = HeaderMap::with_capacity(txn.headers.len());
    for (name, value) in txn.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RewindError::InvalidFormat(format!("stored header name '{name}': {e}")))?;
        let value = HeaderValue::from_bytes(&value)
            .map_err(|e| RewindError::InvalidFormat(format!("stored header {name}: {e}")))?;
        headers.append(name, value);
    }

    let mut res = Response::new(status, txn.body, request);
    res.headers = headers;
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{stream, StreamExt};
    use hyper::Method;
    use std::io;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<Archive>, CacheModifier) {
        let archive = Arc::new(Archive::open_with(dir.path().join("cache.rwnd"), 16).unwrap());
        let modifier = CacheModifier::new(Arc::clone(&archive), "test");
        (archive, modifier)
    }

    fn get(uri: &str) -> Request {
        Request::parse(Method::GET, uri).unwrap()
    }

    fn upstream(req: &Request, body: &'static str) -> Response {
        let mut res = Response::new(StatusCode::OK, body, req.head.clone());
        res.headers
            .insert("content-type", HeaderValue::from_static("text/plain"));
        res
    }

    fn round_trip(modifier: &CacheModifier, uri: &str, body: &'static str) -> (Context, Response) {
        let mut req = get(uri);
        let mut ctx = Context::new();
        modifier.modify_request(&mut req, &mut ctx).unwrap();

        let mut res = match ctx.take_synthesized() {
            Some(res) => res,
            None => upstream(&req, body),
        };
        modifier.modify_response(&mut res, &mut ctx).unwrap();
        (ctx, res)
    }

    #[test]
    fn test_record_then_replay() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);

        let (ctx, _) = round_trip(&modifier, "http://backend/counter", "1");
        assert!(!ctx.skipping_round_trip());
        assert_eq!(archive.len().unwrap(), 1);

        modifier.set_mode(Mode::Replay);
        for _ in 0..2 {
            let (ctx, res) = round_trip(&modifier, "http://backend/counter", "2");
            assert!(ctx.skipping_round_trip());
            assert!(ctx.was_replayed());
            assert_eq!(res.body.as_bytes().unwrap(), &Bytes::from_static(b"1"));
            assert_eq!(res.headers["content-type"], "text/plain");
        }
    }

    #[test]
    fn test_replay_miss_falls_through() {
        let dir = TempDir::new().unwrap();
        let (_archive, modifier) = setup(&dir);
        let modifier = modifier.with_mode(Mode::Replay);

        let mut req = get("http://backend/never-stored");
        let before = req.clone();
        let mut ctx = Context::new();
        modifier.modify_request(&mut req, &mut ctx).unwrap();

        assert!(!ctx.skipping_round_trip());
        assert!(ctx.take_synthesized().is_none());
        assert_eq!(req.head.uri, before.head.uri);
        assert_eq!(req.head.headers, before.head.headers);
    }

    #[test]
    fn test_hermetic_miss_fails() {
        let dir = TempDir::new().unwrap();
        let (_archive, modifier) = setup(&dir);
        let modifier = modifier.with_mode(Mode::Replay).hermetic(true);

        let mut req = get("http://backend/never-stored");
        let mut ctx = Context::new();
        let err = modifier.modify_request(&mut req, &mut ctx).unwrap_err();

        assert!(matches!(
            err,
            RewindError::ModifierFailed { ref name, ref source }
                if name == MODIFIER_NAME && matches!(**source, RewindError::HermeticMiss(_))
        ));
        // A miss is not a failure of the store
        assert!(modifier.failure().is_none());
    }

    #[test]
    fn test_context_key_overrides_key_fn() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);
        let pinned = TransactionKey::digest(b"pinned");

        let req = get("http://backend/a");
        let mut ctx = Context::new();
        ctx.set_cache_key(pinned);
        let mut res = upstream(&req, "pinned body");
        modifier.modify_response(&mut res, &mut ctx).unwrap();

        assert!(archive.get("test", &pinned).unwrap().is_some());
    }

    #[test]
    fn test_key_failure_wrapped() {
        let dir = TempDir::new().unwrap();
        let (_archive, modifier) = setup(&dir);

        let req = get("/no-host");
        let mut res = upstream(&req, "x");
        let err = modifier
            .modify_response(&mut res, &mut Context::new())
            .unwrap_err();

        assert!(matches!(
            err,
            RewindError::ModifierFailed { ref source, .. }
                if matches!(**source, RewindError::KeyDerivation(_))
        ));
        assert_eq!(modifier.mode(), Mode::Record);
    }

    #[test]
    fn test_closed_archive_poisons_modifier() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);
        let modifier = modifier.with_mode(Mode::Replay);

        // Simulate a store that broke underneath the modifier
        let err = modifier.fail(RewindError::CorruptArchive {
            path: archive.path().to_path_buf(),
            reason: "blob 3 missing".to_string(),
        });
        assert!(err.is_corruption());

        let mut req = get("http://backend/a");
        let err = modifier
            .modify_request(&mut req, &mut Context::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RewindError::ModifierFailed { ref source, .. }
                if matches!(**source, RewindError::ArchiveBroken(_))
        ));
        assert_eq!(modifier.mode(), Mode::Replay);
    }

    #[tokio::test]
    async fn test_streaming_body_recorded_at_eof() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);

        let req = get("http://backend/stream");
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"chunk-1,")),
            Ok(Bytes::from_static(b"chunk-2")),
        ];
        let mut res = Response::new(
            StatusCode::OK,
            Body::Streaming(Box::pin(stream::iter(chunks))),
            req.head.clone(),
        );
        let mut ctx = Context::new();
        modifier.modify_response(&mut res, &mut ctx).unwrap();
        assert_eq!(archive.pending_writes(), 1);

        let Body::Streaming(mut body) = res.body else {
            panic!("body should still stream");
        };
        let mut delivered = Vec::new();
        while let Some(chunk) = body.next().await {
            delivered.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(delivered, b"chunk-1,chunk-2");

        // Commit runs off the polling task
        assert!(archive.drain(Duration::from_secs(5)).await);
        assert_eq!(archive.pending_writes(), 0);

        let key = UrlKey::new().derive(&req.head).unwrap();
        let stored = archive.get("test", &key).unwrap().unwrap();
        assert_eq!(&stored.body[..], b"chunk-1,chunk-2");
    }

    #[tokio::test]
    async fn test_streaming_error_discards_blob() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);

        let req = get("http://backend/broken-stream");
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut res = Response::new(
            StatusCode::OK,
            Body::Streaming(Box::pin(stream::iter(chunks))),
            req.head.clone(),
        );
        modifier
            .modify_response(&mut res, &mut Context::new())
            .unwrap();

        let Body::Streaming(mut body) = res.body else {
            panic!("body should still stream");
        };
        while body.next().await.is_some() {}

        assert_eq!(archive.pending_writes(), 0);
        assert!(archive.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_traffic_and_mode_switches() {
        let dir = TempDir::new().unwrap();
        let (archive, modifier) = setup(&dir);
        let paths: Vec<String> = (0..8).map(|i| format!("http://backend/item/{i}")).collect();

        std::thread::scope(|s| {
            for t in 0..4 {
                let (modifier, paths) = (&modifier, &paths);
                s.spawn(move || {
                    for i in 0..40 {
                        let (ctx, res) = round_trip(modifier, &paths[(t + i) % paths.len()], "live");
                        if ctx.was_replayed() {
                            assert_eq!(res.body.as_bytes().unwrap(), &Bytes::from_static(b"live"));
                        }
                    }
                });
            }
            let modifier = &modifier;
            s.spawn(move || {
                for i in 0..20 {
                    let mode = if i % 2 == 0 { Mode::Replay } else { Mode::Record };
                    modifier.set_mode(mode);
                    std::thread::yield_now();
                }
            });
        });

        assert!(modifier.failure().is_none());
        assert!(archive.len().unwrap() <= paths.len());

        // Every recorded path replays after the dust settles
        modifier.set_mode(Mode::Record);
        for path in &paths {
            round_trip(&modifier, path, "live");
        }
        modifier.set_mode(Mode::Replay);
        for path in &paths {
            let (ctx, _) = round_trip(&modifier, path, "other");
            assert!(ctx.was_replayed());
        }
        assert_eq!(archive.len().unwrap(), paths.len());
    }
}
