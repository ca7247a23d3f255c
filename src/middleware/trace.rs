//! Per-request log line: method, path, status, latency.

use std::time::Instant;

use tracing::info;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

/// Logs every request once the rest of the chain has answered it.
///
/// Install first so the latency covers every other interceptor.
pub struct RequestLog;

impl Interceptor for RequestLog {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let started = Instant::now();
            let method = req.method();
            let path = req.path().to_owned();
            let outcome = next.run(req, res).await;
            // An aborted chain is answered by the pipeline after we return;
            // report the status it will use.
            let status = match &outcome {
                Err(e) if !res.is_finalized() => e.status(),
                _ => res.status_code(),
            };
            info!(
                %method,
                path = %path,
                status = status.as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "request"
            );
            outcome
        })
    }

    fn name(&self) -> &'static str {
        "request_log"
    }
}
