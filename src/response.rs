//! Outgoing HTTP response type and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] travels down the pipeline next to the request. Interceptors
//! may set headers on it, or finalize it with [`Response::send`]; once
//! finalized it is frozen, and every later write is a no-op. Handlers simply
//! return a finalized `Response` (or anything [`IntoResponse`]) and the router
//! sends it for them.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use crate::error::Error;

/// Body type handed to hyper.
pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
enum Body {
    #[default]
    Empty,
    Full(Bytes),
    /// Streamed in chunks when handed to hyper, never buffered whole.
    File(tokio::fs::File),
}

/// An outgoing HTTP response.
///
/// # Shortcuts (200 OK)
///
/// ```rust
/// use neon::Response;
/// use http::StatusCode;
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::status(StatusCode::NO_CONTENT);
/// ```
///
/// # Builder (custom status or headers)
///
/// ```rust
/// use neon::{ContentType, Response};
/// use http::StatusCode;
///
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
///
/// Response::builder().bytes(ContentType::Xml, b"<ok/>".to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    finalized: bool,
}

impl Default for Response {
    fn default() -> Self { Self::new() }
}

impl Response {
    /// A pending `200 OK` with no body, not yet finalized.
    ///
    /// This is the response the pipeline starts every request with.
    pub fn new() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), body: Body::Empty, finalized: false }
    }

    /// `200 OK`, `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// `200 OK`, `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        Self::builder().html(body)
    }

    /// `200 OK` with the body written verbatim and no content type.
    pub fn raw(body: impl Into<Bytes>) -> Self {
        Self::builder().raw(body)
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self::builder().status(code).no_body()
    }

    /// `200 OK` streaming `file` as a download named `filename`.
    pub fn attachment(file: tokio::fs::File, filename: &str) -> Self {
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        let builder = Self::builder()
            .header("content-type", ContentType::OctetStream.as_str())
            .header("content-disposition", &disposition);
        Response { body: Body::File(file), ..builder.no_body() }
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: HeaderMap::new(), status: StatusCode::OK }
    }

    pub fn status_code(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The buffered body. Empty for streamed file bodies.
    pub fn body(&self) -> &[u8] {
        match &self.body {
            Body::Full(b) => b,
            Body::Empty | Body::File(_) => &[],
        }
    }

    /// `true` once an interceptor or handler has sent this response.
    pub fn is_finalized(&self) -> bool { self.finalized }

    /// Sets the status of a response that has not been sent yet.
    pub fn set_status(&mut self, code: StatusCode) {
        if self.finalized {
            debug!(status = %code, "status ignored, response already sent");
            return;
        }
        self.status = code;
    }

    /// Sets (replaces) a header on a response that has not been sent yet.
    /// Invalid names or values are dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.finalized {
            debug!(header = name, "header ignored, response already sent");
            return;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(header = name, "invalid header dropped"),
        }
    }

    /// Finalizes this response with `other`'s status, headers, and body.
    ///
    /// Headers already set on `self` survive unless `other` sets the same name.
    /// `set-cookie` values accumulate instead. Sending an already-finalized
    /// response is a no-op.
    pub fn send(&mut self, other: impl IntoResponse) {
        if self.finalized {
            debug!("send ignored, response already sent");
            return;
        }
        let other = other.into_response();
        self.status = other.status;
        let mut current: Option<HeaderName> = None;
        for (name, value) in other.headers {
            if let Some(name) = name {
                if name != header::SET_COOKIE {
                    self.headers.remove(&name);
                }
                current = Some(name);
            }
            if let Some(name) = &current {
                self.headers.append(name.clone(), value);
            }
        }
        self.body = other.body;
        self.finalized = true;
    }

    /// Finalizes with whatever is set so far. Idempotent.
    pub fn end(&mut self) {
        self.finalized = true;
    }

    /// Drains the body into memory, reading a streamed file to its end.
    pub async fn into_bytes(self) -> Result<Bytes, Error> {
        match self.body {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(b) => Ok(b),
            Body::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    pub(crate) fn into_hyper(self) -> http::Response<ResponseBody> {
        let body = match self.body {
            Body::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            Body::Full(b) => Full::new(b).map_err(|never| match never {}).boxed_unsync(),
            Body::File(file) => {
                StreamBody::new(ReaderStream::new(file).map_ok(Frame::data)).boxed_unsync()
            }
        };
        let mut res = http::Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`.
/// Terminated by a typed body method, so the content type is always explicit.
pub struct ResponseBuilder {
    headers: HeaderMap,
    status: StatusCode,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code;
        self
    }

    /// Appends a header. Invalid names or values are dropped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            self.headers.append(name, value);
        }
        self
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish(Some(ContentType::Json), body.into())
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish(Some(ContentType::Text), Bytes::from(body.into()))
    }

    /// Terminate with an HTML body (`text/html; charset=utf-8`).
    pub fn html(self, body: impl Into<String>) -> Response {
        self.finish(Some(ContentType::Html), Bytes::from(body.into()))
    }

    /// Terminate with a typed body.
    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(Some(content_type), body.into())
    }

    /// Terminate with a body and no content type.
    pub fn raw(self, body: impl Into<Bytes>) -> Response {
        self.finish(None, body.into())
    }

    /// Terminate with no body (e.g. `204 No Content`).
    pub fn no_body(self) -> Response {
        Response { status: self.status, headers: self.headers, body: Body::Empty, finalized: true }
    }

    fn finish(mut self, content_type: Option<ContentType>, body: Bytes) -> Response {
        if let Some(ct) = content_type {
            self.headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(ct.as_str()));
        }
        Response { status: self.status, headers: self.headers, body: Body::Full(body), finalized: true }
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into an HTTP [`Response`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

/// Return a status directly from a handler: `return StatusCode::NOT_FOUND`
impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::status(self) }
}

impl IntoResponse for serde_json::Value {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self) {
            Ok(bytes) => Response::json(bytes),
            Err(e) => Error::handler(format!("json serialization: {e}")).into_response(),
        }
    }
}

/// Errors become their stable status with the canonical reason as plain text.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        Response::builder()
            .status(status)
            .text(status.canonical_reason().unwrap_or("Error"))
    }
}

/// `Err` is logged in the caller's span, then rendered through [`Error`].
impl<T, E> IntoResponse for Result<T, E>
where
    T: IntoResponse,
    E: Into<Error>,
{
    fn into_response(self) -> Response {
        match self {
            Ok(v) => v.into_response(),
            Err(e) => {
                let e = e.into();
                error!(error = %e, "handler returned an error");
                e.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortcuts_are_finalized_with_content_types() {
        let res = Response::json(br#"{"ok":true}"#.to_vec());
        assert!(res.is_finalized());
        assert_eq!(res.header("content-type"), Some("application/json"));
        assert_eq!(res.body(), br#"{"ok":true}"#);

        let res = Response::html("<p>hi</p>");
        assert_eq!(res.header("content-type"), Some("text/html; charset=utf-8"));

        let res = Response::raw("verbatim");
        assert_eq!(res.header("content-type"), None);
        assert_eq!(res.body(), b"verbatim");
    }

    #[test]
    fn send_keeps_earlier_headers_and_freezes() {
        let mut res = Response::new();
        res.set_header("x-frame-options", "DENY");
        res.send(Response::builder().status(StatusCode::CREATED).text("made"));

        assert!(res.is_finalized());
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.header("x-frame-options"), Some("DENY"));

        res.send(Response::status(StatusCode::INTERNAL_SERVER_ERROR));
        res.set_status(StatusCode::IM_A_TEAPOT);
        res.set_header("x-late", "1");
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.header("x-late"), None);
        assert_eq!(res.body(), b"made");
    }

    #[test]
    fn send_appends_cookies_and_replaces_other_headers() {
        let mut res = Response::new();
        res.set_header("set-cookie", "neon_session=abc; HttpOnly; Secure; Path=/");
        res.set_header("cache-control", "no-store");
        res.send(
            Response::builder()
                .header("set-cookie", "theme=dark")
                .header("cache-control", "max-age=60")
                .text("ok"),
        );

        let cookies: Vec<_> = res.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["neon_session=abc; HttpOnly; Secure; Path=/", "theme=dark"]);
        assert_eq!(res.headers().get_all("cache-control").iter().count(), 1);
        assert_eq!(res.header("cache-control"), Some("max-age=60"));
    }

    #[test]
    fn end_is_idempotent() {
        let mut res = Response::new();
        res.end();
        res.end();
        assert!(res.is_finalized());
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
    }

    #[test]
    fn errors_render_their_status() {
        let res = Error::authentication("expired").into_response();
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);

        let res: Result<&'static str, Error> = Err(Error::handler("boom"));
        assert_eq!(res.into_response().status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn attachment_streams_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let res = Response::attachment(file, "report.txt");
        assert_eq!(
            res.header("content-disposition"),
            Some("attachment; filename=\"report.txt\"")
        );
        assert!(res.body().is_empty());
        assert_eq!(res.into_bytes().await.unwrap(), "line one\nline two\n");
    }
}
