//! WebSocket routes and the HTTP upgrade.
//!
//! ```text
//! GET /ws  (Connection: Upgrade, Upgrade: websocket)
//!   → server sees an upgrade request, skips the pipeline
//!   → 101 Switching Protocols  (Sec-WebSocket-Accept derived from the key)
//!   → spawned task awaits the upgraded IO, wraps it in a WebSocket
//!   → registry.resolve(path): first exact match runs, no match closes
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::{FutureExt, SinkExt, StreamExt};
use http::{HeaderMap, StatusCode, header};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::method::Method;
use crate::request::Request;
use crate::response::{ResponseBody, Response};

pub use tokio_tungstenite::tungstenite::Message;

// ── WebSocket ─────────────────────────────────────────────────────────────────

/// An accepted WebSocket connection.
pub struct WebSocket {
    inner: WebSocketStream<TokioIo<Upgraded>>,
}

impl WebSocket {
    pub async fn send(&mut self, message: impl Into<Message>) -> Result<(), Error> {
        self.inner.send(message.into()).await?;
        Ok(())
    }

    /// Next message from the peer; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Result<Message, Error>> {
        self.inner.next().await.map(|msg| msg.map_err(Error::from))
    }

    /// Sends a close frame and flushes it.
    pub async fn close(mut self) -> Result<(), Error> {
        self.inner.close(None).await?;
        Ok(())
    }
}

// ── WsHandler ─────────────────────────────────────────────────────────────────

/// Internal dispatch interface for connection handlers.
#[doc(hidden)]
pub trait ErasedWsHandler {
    fn call(&self, socket: WebSocket, req: Request) -> BoxFuture<'static, ()>;
}

#[doc(hidden)]
pub type BoxedWsHandler = Arc<dyn ErasedWsHandler + Send + Sync + 'static>;

/// Implemented for every valid connection handler:
///
/// ```text
/// async fn name(socket: WebSocket, req: Request)
/// ```
///
/// `req` is the upgrade request, with its headers and session-less context.
/// Sealed, like [`Handler`](crate::Handler).
pub trait WsHandler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_ws_handler(self) -> BoxedWsHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(WebSocket, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> WsHandler for F
where
    F: Fn(WebSocket, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_ws_handler(self) -> BoxedWsHandler {
        Arc::new(FnWsHandler(self))
    }
}

struct FnWsHandler<F>(F);

impl<F, Fut> ErasedWsHandler for FnWsHandler<F>
where
    F: Fn(WebSocket, Request) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, socket: WebSocket, req: Request) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(socket, req))
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// One exact-path connection endpoint.
pub struct WebSocketRoute {
    path: String,
    on_connection: BoxedWsHandler,
    provenance: Option<PathBuf>,
}

impl WebSocketRoute {
    pub fn new(path: impl Into<String>, on_connection: impl WsHandler) -> Self {
        Self::from_boxed(path, on_connection.into_boxed_ws_handler())
    }

    pub(crate) fn from_boxed(path: impl Into<String>, on_connection: BoxedWsHandler) -> Self {
        Self { path: path.into(), on_connection, provenance: None }
    }

    /// Records the document that declared this route.
    pub fn provenance(mut self, source: impl Into<PathBuf>) -> Self {
        self.provenance = Some(source.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn source(&self) -> Option<&Path> {
        self.provenance.as_deref()
    }
}

/// Exact-path table of WebSocket routes.
///
/// Registration appends to a copy of the table and swaps it in, so lookups
/// never block and a load during serving is seen whole or not at all.
#[derive(Default)]
pub struct WebSocketRegistry {
    routes: ArcSwap<Vec<Arc<WebSocketRoute>>>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `route`. The first registration for a path keeps winning.
    pub fn register(&self, route: WebSocketRoute) -> Result<(), Error> {
        if !route.path.starts_with('/') {
            let err = Error::configuration(format!("websocket path `{}` must start with `/`", route.path));
            error!(error = %err, "websocket route skipped");
            return Err(err);
        }
        if self.resolve(&route.path).is_some() {
            warn!(path = %route.path, "websocket path already registered, new entry is shadowed");
        }
        info!(path = %route.path, source = ?route.provenance, "websocket route registered");
        let route = Arc::new(route);
        self.routes.rcu(|routes| {
            let mut next = Vec::clone(routes);
            next.push(Arc::clone(&route));
            next
        });
        Ok(())
    }

    /// First route whose path equals `path` exactly.
    pub fn resolve(&self, path: &str) -> Option<Arc<WebSocketRoute>> {
        self.routes.load().iter().find(|r| r.path == path).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }

    /// Registered paths in registration order.
    pub fn paths(&self) -> Vec<String> {
        self.routes.load().iter().map(|r| r.path.clone()).collect()
    }
}

// ── Upgrade ───────────────────────────────────────────────────────────────────

fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// `true` for a `GET` asking to switch to the WebSocket protocol.
pub(crate) fn is_upgrade_request<B>(req: &http::Request<B>) -> bool {
    req.method() == http::Method::GET
        && has_token(req.headers(), header::CONNECTION, "upgrade")
        && has_token(req.headers(), header::UPGRADE, "websocket")
}

/// Answers the handshake and hands the connection to its route once hyper
/// releases the upgraded IO.
pub(crate) fn upgrade<B>(
    registry: Arc<WebSocketRegistry>,
    mut req: http::Request<B>,
    remote_addr: SocketAddr,
) -> http::Response<ResponseBody> {
    let version_ok = req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).filter(|_| version_ok) else {
        debug!(peer = %remote_addr, "malformed websocket handshake");
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .text("Bad Request")
            .into_hyper();
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();
    let request = Request::from_parts(Method::Get, &parts, Default::default(), remote_addr);
    let path = request.path().to_owned();

    let span = info_span!("websocket", path = %path, peer = %remote_addr);
    tokio::spawn(
        async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(error = %e, "upgrade failed");
                    return;
                }
            };
            let inner = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            let socket = WebSocket { inner };
            match registry.resolve(&path) {
                Some(route) => run(&route, socket, request).await,
                None => {
                    debug!("no websocket route, closing");
                    if let Err(e) = socket.close().await {
                        debug!(error = %e, "close failed");
                    }
                }
            }
        }
        .instrument(span),
    );

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION.as_str(), "Upgrade")
        .header(header::UPGRADE.as_str(), "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT.as_str(), &accept)
        .no_body()
        .into_hyper()
}

async fn run(route: &WebSocketRoute, socket: WebSocket, request: Request) {
    debug!(source = ?route.provenance, "connection accepted");
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| route.on_connection.call(socket, request))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(payload) => Err(payload),
    };
    match outcome {
        Ok(()) => debug!("connection finished"),
        Err(payload) => {
            let err = Error::from_panic(payload);
            error!(source = ?route.provenance, error = %err, "websocket handler panicked");
        }
    }
}
