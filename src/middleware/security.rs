//! Response hardening headers and request body validation.

use http::StatusCode;
use serde::de::IgnoredAny;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

const HEADERS: [(&str, &str); 6] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", "default-src 'self'"),
    ("referrer-policy", "no-referrer"),
    ("x-permitted-cross-domain-policies", "none"),
];

/// Sets the standard security headers on every response.
///
/// Headers set here survive a later `send` unless the handler overrides them.
pub struct SecurityHeaders;

impl Interceptor for SecurityHeaders {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        for (name, value) in HEADERS {
            res.set_header(name, value);
        }
        next.run(req, res)
    }

    fn name(&self) -> &'static str {
        "security_headers"
    }
}

/// Rejects `POST`, `PUT` and `PATCH` requests whose JSON body does not parse.
///
/// Only requests declaring a JSON content type with a non-empty body are
/// checked; they are answered `400 Invalid JSON`.
pub struct JsonBody;

impl JsonBody {
    fn is_invalid(req: &Request) -> bool {
        let declares_json = req
            .header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        req.method().has_body()
            && declares_json
            && !req.body().is_empty()
            && serde_json::from_slice::<IgnoredAny>(req.body()).is_err()
    }
}

impl Interceptor for JsonBody {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        if Self::is_invalid(req) {
            res.send(Response::builder().status(StatusCode::BAD_REQUEST).text("Invalid JSON"));
            return Box::pin(async { Ok(()) });
        }
        next.run(req, res)
    }

    fn name(&self) -> &'static str {
        "json_body"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::pipeline::Pipeline;

    struct Created;

    impl Interceptor for Created {
        fn intercept<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
            _next: Next<'a>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            res.send(Response::builder().status(StatusCode::CREATED).json("{}"));
            Box::pin(async { Ok(()) })
        }
    }

    async fn run(pipeline: &Pipeline, mut req: Request) -> Response {
        let mut res = Response::new();
        pipeline.dispatch(&mut req, &mut res).await;
        res
    }

    #[tokio::test]
    async fn security_headers_survive_the_handler_response() {
        let pipeline = Pipeline::new().with(SecurityHeaders).with(Created);
        let res = run(&pipeline, Request::new(Method::Get, "/")).await;
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.header("x-frame-options"), Some("DENY"));
        assert_eq!(res.header("referrer-policy"), Some("no-referrer"));
        assert_eq!(res.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn malformed_json_bodies_are_rejected() {
        let pipeline = Pipeline::new().with(JsonBody).with(Created);

        let bad = Request::new(Method::Post, "/cart")
            .with_header("content-type", "application/json")
            .with_body("{not json");
        let res = run(&pipeline, bad).await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body(), b"Invalid JSON");

        let good = Request::new(Method::Post, "/cart")
            .with_header("content-type", "application/json")
            .with_body(r#"{"item":1}"#);
        assert_eq!(run(&pipeline, good).await.status_code(), StatusCode::CREATED);

        let text = Request::new(Method::Post, "/cart")
            .with_header("content-type", "text/plain")
            .with_body("{not json");
        assert_eq!(run(&pipeline, text).await.status_code(), StatusCode::CREATED);

        let get = Request::new(Method::Get, "/cart")
            .with_header("content-type", "application/json")
            .with_body("{not json");
        assert_eq!(run(&pipeline, get).await.status_code(), StatusCode::CREATED);
    }
}
