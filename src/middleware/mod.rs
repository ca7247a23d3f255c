//! Built-in interceptors.
//!
//! Interceptors are the right place for cross-cutting concerns: request logs,
//! rate limits, sessions, security headers, body validation. Each one here
//! follows the [`Interceptor`] contract and knows nothing about routing.
//!
//! The default [`App`](crate::App) chain is:
//!
//! ```text
//! RequestLog → RateLimiter → Sessions → SecurityHeaders → JsonBody → Router → NotFound
//! ```

mod rate_limit;
mod security;
mod session;
mod trace;

use http::StatusCode;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

pub use rate_limit::RateLimiter;
pub use security::{JsonBody, SecurityHeaders};
pub use session::{Session, Sessions};
pub use trace::RequestLog;

/// Terminal `404 Not Found`, installed after the router.
pub struct NotFound;

impl Interceptor for NotFound {
    fn intercept<'a>(
        &'a self,
        _req: &'a mut Request,
        res: &'a mut Response,
        _next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        res.send(Response::builder().status(StatusCode::NOT_FOUND).text("Not Found"));
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &'static str {
        "not_found"
    }
}
