//! Sliding-window request limiting per client address.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::StatusCode;
use tracing::debug;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

const UNKNOWN_CLIENT: &str = "unknown";

/// Requests admitted between sweeps of idle clients.
const SWEEP_EVERY: usize = 1024;

/// Answers `429 Too Many Requests` once a client exceeds `max_requests`
/// within the trailing `window`.
///
/// Clients are keyed by remote IP; requests without an address (in-process
/// dispatch) share one bucket.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    message: String,
    hits: DashMap<String, VecDeque<Instant>>,
    seen: AtomicUsize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            message: "Too Many Requests".to_owned(),
            hits: DashMap::new(),
            seen: AtomicUsize::new(0),
        }
    }

    /// Body text of the 429 response.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Records a hit for `client` at `now`; `false` when over the limit.
    fn admit(&self, client: String, now: Instant) -> bool {
        if self.seen.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        let mut queue = self.hits.entry(client).or_default();
        while queue.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            queue.pop_front();
        }
        if queue.len() >= self.max_requests {
            return false;
        }
        queue.push_back(now);
        true
    }

    /// Forgets clients whose every hit has left the window.
    fn sweep(&self, now: Instant) {
        self.hits
            .retain(|_, queue| queue.back().is_some_and(|t| now.duration_since(*t) < self.window));
    }

    /// Clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.hits.len()
    }
}

impl Interceptor for RateLimiter {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let client = req
            .remote_addr()
            .map_or_else(|| UNKNOWN_CLIENT.to_owned(), |addr| addr.ip().to_string());
        if self.admit(client.clone(), Instant::now()) {
            return next.run(req, res);
        }
        debug!(client = %client, "rate limit exceeded");
        res.send(
            Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .text(self.message.clone()),
        );
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &'static str {
        "rate_limiter"
    }
}
