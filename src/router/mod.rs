//! Ordered request router.
//!
//! Routes live in one list in registration order. Lookup first tries literal
//! routes by exact (method, path), then pattern routes in order; the first hit
//! wins. A literal route therefore beats any pattern route, whenever either was
//! registered. Re-registering a path appends a shadowed duplicate: the earlier
//! entry keeps winning.
//!
//! # Reloads while serving
//!
//! The table sits behind an [`ArcSwap`]. Registration clones the table, appends,
//! and swaps the new one in; dispatch reads whichever snapshot is current
//! without taking a lock. A request in flight during a reload sees either the
//! old or the new table, never a half-written one.

mod pattern;
mod responder;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;
use tracing::{Instrument, error, info, info_span, warn};

use crate::auth::{Authenticate, Authenticator};
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

pub use pattern::PathPattern;

// ── Descriptors ───────────────────────────────────────────────────────────────

/// What a route answers with.
pub enum ResponseSpec {
    /// Serialized once at registration, served as `application/json`.
    Json(Value),
    Html(String),
    /// Streamed as an attachment; the path is relative to the router's file root.
    File(PathBuf),
    /// Written verbatim with no content type.
    Raw(Bytes),
    Handler(BoxedHandler),
}

impl ResponseSpec {
    pub fn handler(handler: impl Handler) -> Self {
        Self::Handler(handler.into_boxed_handler())
    }
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Html(s) => f.debug_tuple("Html").field(s).finish(),
            Self::File(p) => f.debug_tuple("File").field(p).finish(),
            Self::Raw(b) => f.debug_tuple("Raw").field(b).finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Declarative route record, as read from a document or built by a plugin.
///
/// ```rust
/// use neon::RouteDescriptor;
/// use serde_json::json;
///
/// let public = RouteDescriptor::new("GET", "/public").json(json!({ "ok": true }));
/// let secure = RouteDescriptor::new("get", "/secure").html("<p>hi</p>").require_auth();
/// ```
#[derive(Debug)]
pub struct RouteDescriptor {
    pub method: String,
    pub path: String,
    pub response: Option<ResponseSpec>,
    pub auth_required: bool,
    /// Document the route came from, for diagnostics.
    pub provenance: Option<PathBuf>,
}

impl RouteDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            response: None,
            auth_required: false,
            provenance: None,
        }
    }

    pub fn respond(mut self, spec: ResponseSpec) -> Self {
        self.response = Some(spec);
        self
    }

    pub fn json(self, value: Value) -> Self { self.respond(ResponseSpec::Json(value)) }
    pub fn html(self, text: impl Into<String>) -> Self { self.respond(ResponseSpec::Html(text.into())) }
    pub fn file(self, path: impl Into<PathBuf>) -> Self { self.respond(ResponseSpec::File(path.into())) }
    pub fn raw(self, body: impl Into<Bytes>) -> Self { self.respond(ResponseSpec::Raw(body.into())) }
    pub fn handler(self, handler: impl Handler) -> Self { self.respond(ResponseSpec::handler(handler)) }

    pub fn require_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn provenance(mut self, source: impl Into<PathBuf>) -> Self {
        self.provenance = Some(source.into());
        self
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

/// An endpoint wrapped by zero or more interceptors, outermost first.
///
/// Built once at registration. The bare endpoint is private: once wrapped, the
/// only way to reach it is through the layers.
pub struct RouteHandler {
    layers: Vec<Arc<dyn Interceptor>>,
    endpoint: BoxedHandler,
}

impl RouteHandler {
    fn new(endpoint: BoxedHandler) -> Self {
        Self { layers: Vec::new(), endpoint }
    }

    /// Adds `layer` as the new outermost interceptor.
    fn wrap(mut self, layer: impl Interceptor) -> Self {
        self.layers.insert(0, Arc::new(layer));
        self
    }

    pub fn layers(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    fn call<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, Result<(), Error>> {
        Next::new(&self.layers, Some(&self.endpoint)).run(req, res)
    }
}

/// A compiled, immutable route.
struct Route {
    method: Method,
    path: String,
    pattern: Option<PathPattern>,
    handler: RouteHandler,
    auth_required: bool,
    provenance: Option<PathBuf>,
}

impl Route {
    fn source(&self) -> String {
        self.provenance
            .as_ref()
            .map_or_else(|| "<code>".to_owned(), |p| p.display().to_string())
    }
}

/// Read-only view of a registered route.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
    pub params: Vec<String>,
    pub auth_required: bool,
    pub provenance: Option<PathBuf>,
    pub layers: Vec<&'static str>,
}

#[derive(Clone, Default)]
struct RouteTable {
    routes: Vec<Arc<Route>>,
    /// First literal route per (method, path).
    literals: HashMap<(Method, String), Arc<Route>>,
}

impl RouteTable {
    /// Appends; returns `true` when an earlier route already claims the path.
    fn push(&mut self, route: Arc<Route>) -> bool {
        let shadowed = self
            .routes
            .iter()
            .any(|r| r.method == route.method && r.path == route.path);
        if route.pattern.is_none() {
            self.literals
                .entry((route.method, route.path.clone()))
                .or_insert_with(|| Arc::clone(&route));
        }
        self.routes.push(route);
        shadowed
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The application router.
///
/// Shared by `Arc`: the pipeline holds it as an interceptor while the
/// interpreter and plugins keep registering routes through the same value.
pub struct Router {
    table: ArcSwap<RouteTable>,
    authenticator: Arc<dyn Authenticator>,
    file_root: PathBuf,
}

impl Router {
    /// `authenticator` verifies credentials for `authRequired` routes.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            authenticator,
            file_root: PathBuf::from("."),
        }
    }

    /// Directory `file` responses are served from; nothing outside it is.
    pub fn with_file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.file_root = root.into();
        self
    }

    /// Compiles and appends a route.
    ///
    /// A descriptor missing its method, path, or response, or carrying an
    /// invalid pattern, is logged and skipped; the error is returned for
    /// callers that count failures, and nothing else is affected.
    pub fn register_route(&self, descriptor: RouteDescriptor) -> Result<(), Error> {
        let label = format!("[{}] {}", descriptor.method, descriptor.path);
        let route = match self.compile(descriptor) {
            Ok(route) => Arc::new(route),
            Err(e) => {
                error!(route = %label, error = %e, "route skipped");
                return Err(e);
            }
        };

        let mut shadowed = false;
        self.table.rcu(|table| {
            let mut next = RouteTable::clone(table);
            shadowed = next.push(Arc::clone(&route));
            next
        });

        if shadowed {
            warn!(route = %label, source = %route.source(), "route shadowed by an earlier registration");
        }
        info!(route = %label, auth_required = route.auth_required, source = %route.source(), "route registered");
        Ok(())
    }

    /// Registers a code-defined handler.
    pub fn on(&self, method: Method, path: &str, handler: impl Handler) -> Result<(), Error> {
        self.register_route(RouteDescriptor::new(method.as_str(), path).handler(handler))
    }

    pub fn len(&self) -> usize { self.table.load().routes.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Registered routes in registration order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.table
            .load()
            .routes
            .iter()
            .map(|r| RouteInfo {
                method: r.method,
                path: r.path.clone(),
                params: r.pattern.as_ref().map(|p| p.param_names().to_vec()).unwrap_or_default(),
                auth_required: r.auth_required,
                provenance: r.provenance.clone(),
                layers: r.handler.layers(),
            })
            .collect()
    }

    fn compile(&self, descriptor: RouteDescriptor) -> Result<Route, Error> {
        let RouteDescriptor { method, path, response, auth_required, provenance } = descriptor;
        if method.trim().is_empty() {
            return Err(Error::configuration("route is missing `method`"));
        }
        if path.is_empty() {
            return Err(Error::configuration("route is missing `path`"));
        }
        let method: Method = method.parse().map_err(|e| Error::configuration(format!("{e}")))?;
        let response = response
            .ok_or_else(|| Error::configuration(format!("{method} {path} has no response")))?;

        let pattern = if PathPattern::is_pattern(&path) {
            Some(PathPattern::compile(&path)?)
        } else {
            None
        };

        let mut handler = RouteHandler::new(responder::synthesize(response, &self.file_root)?);
        if auth_required {
            handler = handler.wrap(Authenticate::new(Arc::clone(&self.authenticator)));
        }

        Ok(Route { method, path, pattern, handler, auth_required, provenance })
    }

    fn lookup(&self, method: Method, path: &str) -> Option<(Arc<Route>, HashMap<String, String>)> {
        let table = self.table.load();
        if let Some(route) = table.literals.get(&(method, path.to_owned())) {
            return Some((Arc::clone(route), HashMap::new()));
        }
        table
            .routes
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| {
                let params = r.pattern.as_ref()?.matches(path)?;
                Some((Arc::clone(r), params))
            })
    }
}

/// Dispatch. No match advances the chain untouched: the router never answers
/// 404 itself.
impl Interceptor for Router {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let Some((route, params)) = self.lookup(req.method(), req.path()) else {
            return next.run(req, res);
        };

        Box::pin(async move {
            req.set_params(params);
            let source = route.source();
            let span = info_span!("route", method = %route.method, path = %route.path, source = %source);
            if let Err(e) = route.handler.call(req, res).instrument(span).await {
                error!(method = %route.method, path = %route.path, source = %source, error = %e, "handler fault");
                res.send(
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .text("Internal Server Error"),
                );
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "router"
    }
}
