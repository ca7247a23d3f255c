//! Ordered interceptor chain that owns the request lifecycle.
//!
//! ```text
//! dispatch(req, res)
//!   → RequestLog ─ next.run → RateLimiter ─ next.run → … → Router ─ next.run → NotFound
//!   ← Ok(())     ← Ok(())                               ← handler sent the response
//! ```
//!
//! Each interceptor decides one of three things:
//!
//! - **advance**: `next.run(req, res).await`
//! - **abort**: return `Err(e)`; the rest of the chain is skipped and the
//!   pipeline answers with `e.status()` unless the response was already sent
//! - **terminate**: `res.send(...)` and return `Ok(())` without calling `next`
//!
//! A panic while building or polling an interceptor's future is caught right
//! where that interceptor is called and becomes [`Error::Handler`], so it
//! travels the same path as an explicit error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::error;

use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler};
use crate::request::Request;
use crate::response::Response;

/// One unit of the ordered request-processing chain.
///
/// ```rust
/// use neon::{Error, Interceptor, Next, Request, Response};
/// use neon::handler::BoxFuture;
///
/// struct PoweredBy;
///
/// impl Interceptor for PoweredBy {
///     fn intercept<'a>(
///         &'a self,
///         req: &'a mut Request,
///         res: &'a mut Response,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, Result<(), Error>> {
///         res.set_header("x-powered-by", "neon");
///         next.run(req, res)
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Label used in logs and in route layer listings.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<T: Interceptor + ?Sized> Interceptor for Arc<T> {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        (**self).intercept(req, res, next)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// The continuation handed to every interceptor.
///
/// Holds the remainder of the chain and, for route-level chains, the handler
/// that runs once the remainder is exhausted.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    endpoint: Option<&'a BoxedHandler>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], endpoint: Option<&'a BoxedHandler>) -> Self {
        Self { chain, endpoint }
    }

    /// Advances to the next interceptor, or to the endpoint when the chain is
    /// exhausted. A chain without an endpoint simply returns `Ok(())`.
    pub fn run(self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if let Some((first, rest)) = self.chain.split_first() {
                let next = Next { chain: rest, endpoint: self.endpoint };
                let fut = panic::catch_unwind(AssertUnwindSafe(move || first.intercept(req, res, next)))
                    .map_err(Error::from_panic)?;
                return AssertUnwindSafe(fut).catch_unwind().await.map_err(Error::from_panic)?;
            }

            if let Some(endpoint) = self.endpoint {
                let request = req.clone();
                let fut = panic::catch_unwind(AssertUnwindSafe(|| endpoint.call(request)))
                    .map_err(Error::from_panic)?;
                let response = AssertUnwindSafe(fut).catch_unwind().await.map_err(Error::from_panic)?;
                res.send(response);
            }
            Ok(())
        })
    }
}

/// The application-level interceptor chain.
///
/// Built once before serving; every request walks the interceptors in the
/// same order. Requests are independent and run concurrently.
#[derive(Default)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor to the end of the chain.
    pub fn register(&mut self, interceptor: impl Interceptor) -> &mut Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Chaining form of [`register`](Pipeline::register).
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.register(interceptor);
        self
    }

    pub fn len(&self) -> usize { self.interceptors.len() }
    pub fn is_empty(&self) -> bool { self.interceptors.is_empty() }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Runs one request through the chain. Never fails: errors are logged and
    /// answered, and the response is always finalized on return.
    pub async fn dispatch(&self, req: &mut Request, res: &mut Response) {
        if let Err(err) = Next::new(&self.interceptors, None).run(req, res).await {
            error!(method = %req.method(), path = req.path(), error = %err, "request aborted");
            if !res.is_finalized() {
                res.send(err);
            }
        }
        res.end();
    }
}
