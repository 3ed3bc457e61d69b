//! Conditional dispatch
//!
//! A [`Filter`] evaluates a [`Condition`] once per phase and runs exactly one
//! of two modifiers. Unset branches are no-ops.

mod json;
mod matchers;

pub use json::register;
pub use matchers::{
    CookieMatcher, HeaderMatcher, MuxMatcher, SecureMatcher, UrlMatcher, UrlRegexMatcher,
};

use std::sync::Arc;

use crate::message::{Context, Request, Response};
use crate::modifier::{Modifier, Noop};
use crate::Result;

/// Boolean test over a request or a response
///
/// Evaluation must not change the message or the context.
pub trait Condition: Send + Sync {
    /// Test a request
    fn match_request(&self, req: &Request, ctx: &Context) -> bool;

    /// Test a response
    fn match_response(&self, res: &Response, ctx: &Context) -> bool;
}

impl<C: Condition + ?Sized> Condition for Arc<C> {
    fn match_request(&self, req: &Request, ctx: &Context) -> bool {
        (**self).match_request(req, ctx)
    }

    fn match_response(&self, res: &Response, ctx: &Context) -> bool {
        (**self).match_response(res, ctx)
    }
}

/// Inverts each evaluation of the wrapped condition
pub struct NotCondition {
    inner: Arc<dyn Condition>,
}

impl NotCondition {
    /// Invert `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn Condition>) -> Self {
        Self { inner }
    }
}

impl Condition for NotCondition {
    fn match_request(&self, req: &Request, ctx: &Context) -> bool {
        !self.inner.match_request(req, ctx)
    }

    fn match_response(&self, res: &Response, ctx: &Context) -> bool {
        !self.inner.match_response(res, ctx)
    }
}

/// Runs one of two modifiers per phase depending on a condition
pub struct Filter {
    condition: Arc<dyn Condition>,
    request_true: Arc<dyn Modifier>,
    request_false: Arc<dyn Modifier>,
    response_true: Arc<dyn Modifier>,
    response_false: Arc<dyn Modifier>,
}

impl Filter {
    /// Filter over `condition` with every branch a no-op
    #[must_use]
    pub fn new(condition: Arc<dyn Condition>) -> Self {
        let noop: Arc<dyn Modifier> = Arc::new(Noop::new("filter"));
        Self {
            condition,
            request_true: Arc::clone(&noop),
            request_false: Arc::clone(&noop),
            response_true: Arc::clone(&noop),
            response_false: noop,
        }
    }

    /// Run `modifier` on requests that match
    #[must_use]
    pub fn request_when_true(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.request_true = modifier;
        self
    }

    /// Run `modifier` on requests that do not match
    #[must_use]
    pub fn request_when_false(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.request_false = modifier;
        self
    }

    /// Run `modifier` on responses that match
    #[must_use]
    pub fn response_when_true(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.response_true = modifier;
        self
    }

    /// Run `modifier` on responses that do not match
    #[must_use]
    pub fn response_when_false(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.response_false = modifier;
        self
    }

    /// Use `modifier` as the true branch of both phases
    #[must_use]
    pub fn when_true(self, modifier: Arc<dyn Modifier>) -> Self {
        self.request_when_true(Arc::clone(&modifier))
            .response_when_true(modifier)
    }

    /// Use `modifier` as the false branch of both phases
    #[must_use]
    pub fn when_false(self, modifier: Arc<dyn Modifier>) -> Self {
        self.request_when_false(Arc::clone(&modifier))
            .response_when_false(modifier)
    }
}

impl Modifier for Filter {
    fn modify_request(&self, req: &mut Request, ctx: &mut Context) -> Result<()> {
        let branch = if self.condition.match_request(req, ctx) {
            &self.request_true
        } else {
            &self.request_false
        };
        branch.modify_request(req, ctx)
    }

    fn modify_response(&self, res: &mut Response, ctx: &mut Context) -> Result<()> {
        let branch = if self.condition.match_response(res, ctx) {
            &self.response_true
        } else {
            &self.response_false
        };
        branch.modify_response(res, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::testing::Recorder;
    use crate::RewindError;
    use hyper::header::HeaderValue;
    use hyper::{Method, StatusCode};

    fn request_with_x(value: Option<&'static str>) -> Request {
        let mut req = Request::parse(Method::GET, "http://example.com/").unwrap();
        if let Some(value) = value {
            req.headers_mut()
                .insert("x", HeaderValue::from_static(value));
        }
        req
    }

    fn dispatch(filter: &Filter, value: Option<&'static str>) {
        let mut req = request_with_x(value);
        let mut ctx = Context::new();
        filter.modify_request(&mut req, &mut ctx).unwrap();
    }

    #[test]
    fn test_header_condition_routes_branches() {
        let on_true = Arc::new(Recorder::default());
        let on_false = Arc::new(Recorder::default());
        let filter = Filter::new(Arc::new(HeaderMatcher::new("X", "true").unwrap()))
            .request_when_true(on_true.clone())
            .request_when_false(on_false.clone());

        dispatch(&filter, Some("true"));
        assert_eq!((on_true.requests(), on_false.requests()), (1, 0));

        dispatch(&filter, Some("false"));
        dispatch(&filter, None);
        assert_eq!((on_true.requests(), on_false.requests()), (1, 2));
    }

    #[test]
    fn test_not_condition_inverts() {
        let on_true = Arc::new(Recorder::default());
        let on_false = Arc::new(Recorder::default());
        let matcher: Arc<dyn Condition> = Arc::new(HeaderMatcher::new("X", "true").unwrap());
        let filter = Filter::new(Arc::new(NotCondition::new(matcher)))
            .request_when_true(on_true.clone())
            .request_when_false(on_false.clone());

        dispatch(&filter, Some("true"));
        assert_eq!((on_true.requests(), on_false.requests()), (0, 1));

        dispatch(&filter, Some("other"));
        dispatch(&filter, None);
        assert_eq!((on_true.requests(), on_false.requests()), (2, 1));
    }

    struct Split;

    impl Condition for Split {
        fn match_request(&self, _req: &Request, _ctx: &Context) -> bool {
            true
        }

        fn match_response(&self, _res: &Response, _ctx: &Context) -> bool {
            false
        }
    }

    #[test]
    fn test_not_condition_phases_independent() {
        let not = NotCondition::new(Arc::new(Split));
        let req = request_with_x(None);
        let res = Response::new(StatusCode::OK, "", req.head.clone());
        let ctx = Context::new();

        assert!(!not.match_request(&req, &ctx));
        assert!(not.match_response(&res, &ctx));
    }

    #[test]
    fn test_response_phase_dispatch() {
        let on_true = Arc::new(Recorder::default());
        let on_false = Arc::new(Recorder::default());
        let filter = Filter::new(Arc::new(Split))
            .when_true(on_true.clone())
            .response_when_false(on_false.clone());

        let req = request_with_x(None);
        let mut res = Response::new(StatusCode::OK, "", req.head.clone());
        let mut ctx = Context::new();
        filter.modify_response(&mut res, &mut ctx).unwrap();

        assert_eq!(on_true.responses(), 0);
        assert_eq!(on_false.responses(), 1);
        assert_eq!(on_false.requests(), 0);
    }

    #[test]
    fn test_branch_error_propagates() {
        let filter = Filter::new(Arc::new(Split)).when_true(Arc::new(Recorder::failing()));

        let mut req = request_with_x(None);
        let mut ctx = Context::new();
        let err = filter.modify_request(&mut req, &mut ctx).unwrap_err();
        assert!(matches!(err, RewindError::Upstream(_)));
    }
}
