//! Modifier pipeline contract
//!
//! A modifier sees every request before it goes upstream and every response
//! before it goes back to the client. Modifiers run synchronously on the
//! request's task and may only block on bounded local work.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::message::{Context, Request, Response};
use crate::registry::Registry;
use crate::{Result, RewindError};

/// A request/response transformation
///
/// Both phases default to doing nothing, so an implementation only provides
/// the phase it cares about.
pub trait Modifier: Send + Sync {
    /// Modify a request before the upstream round-trip
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be processed
    fn modify_request(&self, _req: &mut Request, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Modify a response before it reaches the client
    ///
    /// # Errors
    ///
    /// Returns error if the response cannot be processed
    fn modify_response(&self, _res: &mut Response, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }
}

impl<M: Modifier + ?Sized> Modifier for Arc<M> {
    fn modify_request(&self, req: &mut Request, ctx: &mut Context) -> Result<()> {
        (**self).modify_request(req, ctx)
    }

    fn modify_response(&self, res: &mut Response, ctx: &mut Context) -> Result<()> {
        (**self).modify_response(res, ctx)
    }
}

/// Pipeline phase named in a `scope` list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Request phase
    Request,
    /// Response phase
    Response,
}

/// Phases a modifier applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    /// Runs on requests
    pub request: bool,
    /// Runs on responses
    pub response: bool,
}

impl Scope {
    /// Request and response
    pub const BOTH: Self = Self {
        request: true,
        response: true,
    };

    /// Request only
    pub const REQUEST: Self = Self {
        request: true,
        response: false,
    };

    /// Response only
    pub const RESPONSE: Self = Self {
        request: false,
        response: true,
    };

    /// Build a scope from a configured phase list
    ///
    /// # Errors
    ///
    /// Returns error if the list is empty
    pub fn from_phases(phases: &[Phase]) -> Result<Self> {
        if phases.is_empty() {
            return Err(RewindError::ConfigError(
                "scope must name at least one of \"request\", \"response\"".to_string(),
            ));
        }

        Ok(Self {
            request: phases.contains(&Phase::Request),
            response: phases.contains(&Phase::Response),
        })
    }

    /// Resolve an optional `scope` field, missing means both phases
    ///
    /// # Errors
    ///
    /// Returns error if the list is present but empty
    pub fn resolve(phases: Option<&[Phase]>) -> Result<Self> {
        phases.map_or(Ok(Self::BOTH), Self::from_phases)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::BOTH
    }
}

/// A modifier gated to the phases of its scope
#[derive(Clone)]
pub struct Scoped {
    inner: Arc<dyn Modifier>,
    scope: Scope,
}

impl Scoped {
    /// Bind `inner` to `scope`
    #[must_use]
    pub fn new(inner: Arc<dyn Modifier>, scope: Scope) -> Self {
        Self { inner, scope }
    }

    /// Declared scope
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }
}

impl Modifier for Scoped {
    fn modify_request(&self, req: &mut Request, ctx: &mut Context) -> Result<()> {
        if self.scope.request {
            self.inner.modify_request(req, ctx)?;
        }
        Ok(())
    }

    fn modify_response(&self, res: &mut Response, ctx: &mut Context) -> Result<()> {
        if self.scope.response {
            self.inner.modify_response(res, ctx)?;
        }
        Ok(())
    }
}

/// Modifier that does nothing
#[derive(Debug, Clone, Default)]
pub struct Noop {
    id: String,
}

impl Noop {
    /// Noop tagged with `id` in debug logs
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Modifier for Noop {
    fn modify_request(&self, req: &mut Request, _ctx: &mut Context) -> Result<()> {
        debug!("noop {}: request {} {}", self.id, req.head.method, req.head.uri);
        Ok(())
    }

    fn modify_response(&self, res: &mut Response, _ctx: &mut Context) -> Result<()> {
        debug!("noop {}: response {} for {}", self.id, res.status, res.request.uri);
        Ok(())
    }
}

/// Modifier that tells the host not to send the request upstream
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipRoundTrip;

impl Modifier for SkipRoundTrip {
    fn modify_request(&self, _req: &mut Request, ctx: &mut Context) -> Result<()> {
        ctx.skip_round_trip();
        Ok(())
    }
}

/// Root modifier that can be replaced while requests are in flight
///
/// Each call clones the current root before running it, so a swap never
/// waits on, or disturbs, requests already using the previous root.
pub struct Pipeline {
    root: RwLock<Arc<dyn Modifier>>,
}

impl Pipeline {
    /// Pipeline with a no-op root
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(Arc::new(Noop::new("root")))
    }

    /// Pipeline with the given root
    #[must_use]
    pub fn with_root(root: Arc<dyn Modifier>) -> Self {
        Self {
            root: RwLock::new(root),
        }
    }

    /// Current root
    #[must_use]
    pub fn current(&self) -> Arc<dyn Modifier> {
        self.root.read().clone()
    }

    /// Replace the root
    pub fn set(&self, root: Arc<dyn Modifier>) {
        *self.root.write() = root;
    }

    /// Build a modifier from a JSON envelope and install it as the root
    ///
    /// Nothing changes unless the whole envelope builds.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the envelope cannot be built
    pub fn configure(&self, registry: &Registry, json: &[u8]) -> Result<()> {
        let built = registry.build(json)?;
        self.set(Arc::new(built.into_scoped()));
        debug!("pipeline root replaced");
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Modifier for Pipeline {
    fn modify_request(&self, req: &mut Request, ctx: &mut Context) -> Result<()> {
        self.current().modify_request(req, ctx)
    }

    fn modify_response(&self, res: &mut Response, ctx: &mut Context) -> Result<()> {
        self.current().modify_response(res, ctx)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts calls per phase and optionally fails
    #[derive(Default)]
    pub struct Recorder {
        pub requests: AtomicUsize,
        pub responses: AtomicUsize,
        pub fail: bool,
    }

    impl Recorder {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        pub fn responses(&self) -> usize {
            self.responses.load(Ordering::SeqCst)
        }
    }

    impl Modifier for Recorder {
        fn modify_request(&self, _req: &mut Request, _ctx: &mut Context) -> Result<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RewindError::Upstream("recorder failure".to_string()));
            }
            Ok(())
        }

        fn modify_response(&self, _res: &mut Response, _ctx: &mut Context) -> Result<()> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RewindError::Upstream("recorder failure".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;
    use hyper::{Method, StatusCode};

    fn request() -> Request {
        Request::parse(Method::GET, "http://example.com/").unwrap()
    }

    #[test]
    fn test_scope_from_phases() {
        assert_eq!(Scope::from_phases(&[Phase::Request]).unwrap(), Scope::REQUEST);
        assert_eq!(
            Scope::from_phases(&[Phase::Response, Phase::Request]).unwrap(),
            Scope::BOTH
        );
        assert!(Scope::from_phases(&[]).is_err());
        assert_eq!(Scope::resolve(None).unwrap(), Scope::BOTH);
    }

    #[test]
    fn test_scoped_gates_phases() {
        let recorder = Arc::new(Recorder::default());
        let scoped = Scoped::new(recorder.clone(), Scope::RESPONSE);

        let mut req = request();
        let mut ctx = Context::new();
        scoped.modify_request(&mut req, &mut ctx).unwrap();

        let mut res = Response::new(StatusCode::OK, "", req.head.clone());
        scoped.modify_response(&mut res, &mut ctx).unwrap();

        assert_eq!(recorder.requests(), 0);
        assert_eq!(recorder.responses(), 1);
    }

    #[test]
    fn test_skip_round_trip_sets_flag() {
        let mut req = request();
        let mut ctx = Context::new();
        SkipRoundTrip.modify_request(&mut req, &mut ctx).unwrap();
        assert!(ctx.skipping_round_trip());
        assert!(!ctx.was_replayed());
    }

    #[test]
    fn test_pipeline_swap() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let pipeline = Pipeline::with_root(first.clone());

        let mut req = request();
        let mut ctx = Context::new();
        pipeline.modify_request(&mut req, &mut ctx).unwrap();

        pipeline.set(second.clone());
        pipeline.modify_request(&mut req, &mut ctx).unwrap();

        assert_eq!(first.requests(), 1);
        assert_eq!(second.requests(), 1);
    }

    #[test]
    fn test_pipeline_configure_failure_keeps_root() {
        let registry = Registry::with_builtins().unwrap();
        let first = Arc::new(Recorder::default());
        let pipeline = Pipeline::with_root(first.clone());

        let err = pipeline
            .configure(&registry, br#"{"bogus.Type": {}}"#)
            .unwrap_err();
        assert!(matches!(err, RewindError::UnknownModifier(ref name) if name == "bogus.Type"));

        let mut req = request();
        let mut ctx = Context::new();
        pipeline.modify_request(&mut req, &mut ctx).unwrap();
        assert_eq!(first.requests(), 1);
    }
}
