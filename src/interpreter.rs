//! Descriptor documents: YAML that wires routes, websockets, databases and
//! plugins into a running app.
//!
//! ```yaml
//! routes:
//!   - method: GET
//!     path: /public
//!     response: { kind: json, data: { ok: true } }
//!   - method: POST
//!     path: /login
//!     response: { import: { module: ./handlers/login, function: login } }
//! websockets:
//!   - path: /ws
//!     import: { module: ./handlers/ws }
//! databases:
//!   - name: main
//!     type: memory
//!     connection: ":memory:"
//!     migrations: [{ version: 1, script: "SET greeting hello" }]
//! plugins:
//!   - import: { module: ./plugins/sample, function: sample }
//!     options: { prefix: /shop }
//! ```
//!
//! The four sections are processed in that order and independently: a broken
//! entry is logged, recorded in the [`LoadReport`], and skipped, and the rest
//! of the document still loads.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::database::{DatabaseEntry, DatabaseManager};
use crate::error::Error;
use crate::modules::{ModuleRef, Modules};
use crate::plugin::PluginContext;
use crate::router::{ResponseSpec, RouteDescriptor, Router};
use crate::websocket::{WebSocketRegistry, WebSocketRoute};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteEntry {
    #[serde(default)]
    method: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    auth_required: bool,
    response: Option<ResponseEntry>,
}

#[derive(Deserialize)]
struct ResponseEntry {
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
    import: Option<ModuleRef>,
}

#[derive(Deserialize)]
struct WebSocketEntry {
    path: String,
    import: Option<ModuleRef>,
}

#[derive(Deserialize)]
struct PluginEntry {
    import: Option<ModuleRef>,
    options: Option<Value>,
}

/// Outcome of one document load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub source: PathBuf,
    pub routes: usize,
    pub websockets: usize,
    pub databases: usize,
    pub plugins: usize,
    /// One entry per skipped descriptor, in document order.
    pub errors: Vec<Error>,
}

impl LoadReport {
    /// `true` when every entry of the document loaded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies descriptor documents to the router, websocket registry, database
/// manager and plugins.
///
/// Loads are additive and independent: interpreting the same document twice
/// registers everything twice.
pub struct Interpreter {
    router: Arc<Router>,
    websockets: Arc<WebSocketRegistry>,
    databases: Arc<dyn DatabaseManager>,
    modules: Arc<Modules>,
}

impl Interpreter {
    pub fn new(
        router: Arc<Router>,
        websockets: Arc<WebSocketRegistry>,
        databases: Arc<dyn DatabaseManager>,
        modules: Arc<Modules>,
    ) -> Self {
        Self { router, websockets, databases, modules }
    }

    /// Reads and applies the document at `path`.
    ///
    /// Fails only when the document cannot be read or parsed; entry-level
    /// failures land in [`LoadReport::errors`].
    pub async fn interpret(&self, path: impl AsRef<Path>) -> Result<LoadReport, Error> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await?;
        self.interpret_str(&source, path).await
    }

    /// Applies `source` as though it were read from `origin`.
    ///
    /// `origin` stamps provenance on every route and anchors module
    /// references, which resolve against its directory.
    pub async fn interpret_str(&self, source: &str, origin: &Path) -> Result<LoadReport, Error> {
        let document: serde_yaml::Value = serde_yaml::from_str(source)?;
        if !(document.is_mapping() || document.is_null()) {
            return Err(Error::configuration(format!(
                "{}: top level must be a mapping",
                origin.display()
            )));
        }
        let doc_dir = match origin.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        info!(source = %origin.display(), "interpreting descriptor document");

        let mut report = LoadReport { source: origin.to_path_buf(), ..LoadReport::default() };
        let ctx = Load { origin, doc_dir: &doc_dir };

        for (i, entry) in section(&document, "routes").iter().enumerate() {
            match self.load_route(&ctx, i, entry) {
                Ok(()) => report.routes += 1,
                Err(e) => report.errors.push(e),
            }
        }
        for (i, entry) in section(&document, "websockets").iter().enumerate() {
            match self.load_websocket(&ctx, i, entry) {
                Ok(()) => report.websockets += 1,
                Err(e) => report.errors.push(e),
            }
        }
        // One at a time, in document order.
        for (i, entry) in section(&document, "databases").iter().enumerate() {
            match self.load_database(i, entry).await {
                Ok(()) => report.databases += 1,
                Err(e) => {
                    error!(source = %origin.display(), entry = i, error = %e, "database skipped");
                    report.errors.push(e);
                }
            }
        }
        for (i, entry) in section(&document, "plugins").iter().enumerate() {
            match self.load_plugin(&ctx, i, entry).await {
                Ok(()) => report.plugins += 1,
                Err(e) => {
                    error!(source = %origin.display(), entry = i, error = %e, "plugin failed");
                    report.errors.push(e);
                }
            }
        }

        info!(
            source = %origin.display(),
            routes = report.routes,
            websockets = report.websockets,
            databases = report.databases,
            plugins = report.plugins,
            errors = report.errors.len(),
            "descriptor document loaded"
        );
        Ok(report)
    }

    fn load_route(&self, ctx: &Load<'_>, index: usize, raw: &serde_yaml::Value) -> Result<(), Error> {
        let entry: RouteEntry = ctx.entry("routes", index, raw)?;
        let mut descriptor = RouteDescriptor::new(entry.method, entry.path).provenance(ctx.origin);
        if entry.auth_required {
            descriptor = descriptor.require_auth();
        }
        if let Some(response) = entry.response {
            let spec = self.response_spec(ctx, response).inspect_err(|e| {
                error!(source = %ctx.origin.display(), entry = index, error = %e, "route skipped");
            })?;
            descriptor = descriptor.respond(spec);
        }
        // The router logs its own rejections.
        self.router.register_route(descriptor)
    }

    fn response_spec(&self, ctx: &Load<'_>, response: ResponseEntry) -> Result<ResponseSpec, Error> {
        if let Some(reference) = response.import {
            let handler = self.modules.resolve_handler(ctx.doc_dir, &reference)?;
            return Ok(ResponseSpec::Handler(handler));
        }
        let ResponseEntry { kind, data, .. } = response;
        let spec = match kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("json") => ResponseSpec::Json(data),
            Some("html") => ResponseSpec::Html(text(data, "html")?),
            Some("file") => ResponseSpec::File(text(data, "file")?.into()),
            None | Some("raw") => ResponseSpec::Raw(raw_body(data)),
            Some(other) => {
                warn!(kind = other, "unknown response kind, answering raw");
                ResponseSpec::Raw(raw_body(data))
            }
        };
        Ok(spec)
    }

    fn load_websocket(&self, ctx: &Load<'_>, index: usize, raw: &serde_yaml::Value) -> Result<(), Error> {
        let entry: WebSocketEntry = ctx.entry("websockets", index, raw)?;
        let resolved = entry
            .import
            .ok_or_else(|| Error::configuration(format!("websocket `{}` has no `import`", entry.path)))
            .and_then(|reference| self.modules.resolve_websocket(ctx.doc_dir, &reference))
            .inspect_err(|e| {
                error!(source = %ctx.origin.display(), entry = index, error = %e, "websocket skipped");
            })?;
        self.websockets
            .register(WebSocketRoute::from_boxed(entry.path, resolved).provenance(ctx.origin))
    }

    async fn load_database(&self, index: usize, raw: &serde_yaml::Value) -> Result<(), Error> {
        let entry: DatabaseEntry = parse("databases", index, raw)?;
        self.databases.register_database(entry).await
    }

    async fn load_plugin(&self, ctx: &Load<'_>, index: usize, raw: &serde_yaml::Value) -> Result<(), Error> {
        let entry: PluginEntry = parse("plugins", index, raw)?;
        let reference = entry
            .import
            .ok_or_else(|| Error::configuration("plugin has no `import`"))?;
        let plugin = self.modules.resolve_plugin(ctx.doc_dir, &reference)?;
        let plugin_ctx = PluginContext {
            router: Arc::clone(&self.router),
            websockets: Arc::clone(&self.websockets),
            databases: Arc::clone(&self.databases),
            options: entry.options.unwrap_or_else(|| Value::Object(Default::default())),
        };
        let fut = panic::catch_unwind(AssertUnwindSafe(|| plugin.call(plugin_ctx))).map_err(Error::from_panic)?;
        AssertUnwindSafe(fut).catch_unwind().await.map_err(Error::from_panic)??;
        info!(module = %reference, "plugin loaded");
        Ok(())
    }
}

/// Where the document being loaded lives.
struct Load<'a> {
    origin: &'a Path,
    doc_dir: &'a Path,
}

impl Load<'_> {
    fn entry<T: DeserializeOwned>(&self, section: &str, index: usize, raw: &serde_yaml::Value) -> Result<T, Error> {
        parse(section, index, raw).inspect_err(|e| {
            error!(source = %self.origin.display(), section, entry = index, error = %e, "entry skipped");
        })
    }
}

fn parse<T: DeserializeOwned>(section: &str, index: usize, raw: &serde_yaml::Value) -> Result<T, Error> {
    serde_yaml::from_value(raw.clone()).map_err(|e| Error::configuration(format!("{section}[{index}]: {e}")))
}

/// Entries of `name`, or none when it is absent or not a sequence.
fn section<'d>(document: &'d serde_yaml::Value, name: &str) -> &'d [serde_yaml::Value] {
    match document.get(name) {
        None | Some(serde_yaml::Value::Null) => {
            debug!(section = name, "section absent");
            &[]
        }
        Some(serde_yaml::Value::Sequence(entries)) => entries,
        Some(_) => {
            warn!(section = name, "section is not a sequence, skipped");
            &[]
        }
    }
}

fn text(data: Value, kind: &str) -> Result<String, Error> {
    match data {
        Value::String(s) => Ok(s),
        other => Err(Error::configuration(format!("`{kind}` response data must be a string, got {other}"))),
    }
}

fn raw_body(data: Value) -> bytes::Bytes {
    match data {
        Value::Null => bytes::Bytes::new(),
        Value::String(s) => s.into(),
        other => other.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::auth::JwtAuthenticator;
    use crate::database::Databases;
    use crate::method::Method;
    use crate::modules::DEFAULT_EXPORT;
    use crate::pipeline::Pipeline;
    use crate::request::Request;
    use crate::response::Response;
    use crate::websocket::WebSocket;

    static PLUGIN_CALLS: AtomicUsize = AtomicUsize::new(0);

    async fn login(_req: Request) -> &'static str {
        "token"
    }

    async fn ws(_socket: WebSocket, _req: Request) {}

    async fn add_route(ctx: PluginContext) -> Result<(), Error> {
        PLUGIN_CALLS.fetch_add(1, Ordering::SeqCst);
        let prefix = ctx.options["prefix"].as_str().unwrap_or("").to_owned();
        ctx.router.on(Method::Get, &format!("{prefix}/plugin-route"), |_req: Request| async {
            "from plugin"
        })
    }

    async fn broken(_ctx: PluginContext) -> Result<(), Error> {
        panic!("plugin exploded")
    }

    struct Harness {
        interpreter: Interpreter,
        router: Arc<Router>,
        websockets: Arc<WebSocketRegistry>,
        databases: Arc<Databases>,
    }

    fn harness() -> Harness {
        let router = Arc::new(Router::new(Arc::new(JwtAuthenticator::new(b"test"))));
        let websockets = Arc::new(WebSocketRegistry::new());
        let databases = Arc::new(Databases::new());
        let modules = Modules::new("/srv/app")
            .handler("handlers/login", "login", login)
            .websocket("handlers/ws", DEFAULT_EXPORT, ws)
            .plugin("plugins/sample", "addRoute", add_route)
            .plugin("plugins/broken", DEFAULT_EXPORT, broken);
        let interpreter = Interpreter::new(
            Arc::clone(&router),
            Arc::clone(&websockets),
            Arc::clone(&databases) as Arc<dyn DatabaseManager>,
            Arc::new(modules),
        );
        Harness { interpreter, router, websockets, databases }
    }

    async fn get(router: &Arc<Router>, path: &str) -> Response {
        let pipeline = Pipeline::new().with(Arc::clone(router));
        let mut req = Request::new(Method::Get, path);
        let mut res = Response::new();
        pipeline.dispatch(&mut req, &mut res).await;
        res
    }

    fn origin() -> &'static Path {
        Path::new("/srv/app/setting.yaml")
    }

    #[tokio::test]
    async fn one_malformed_route_does_not_block_the_others() {
        let h = harness();
        let doc = r#"
routes:
  - method: GET
    path: /public
    response: { kind: json, data: { ok: true } }
  - method: GET
    path: [not, a, path]
    response: { kind: raw, data: nope }
  - method: get
    path: /greeting
    response: { type: html, data: "<h1>hi</h1>" }
"#;
        let report = h.interpreter.interpret_str(doc, origin()).await.unwrap();
        assert_eq!(report.routes, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(h.router.len(), 2);

        let res = get(&h.router, "/public").await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.header("content-type"), Some("application/json"));
        assert_eq!(res.body(), br#"{"ok":true}"#);

        let route = &h.router.routes()[0];
        assert_eq!(route.provenance.as_deref(), Some(origin()));
    }

    #[tokio::test]
    async fn imports_resolve_against_the_document_directory() {
        let h = harness();
        let doc = r#"
routes:
  - method: POST
    path: /login
    response: { import: { module: ./handlers/login.js, function: login } }
  - method: POST
    path: /missing
    response: { import: { module: ./handlers/login, function: nope } }
websockets:
  - path: /ws
    import: { module: ./handlers/ws }
  - path: /ws2
    import: { module: ./handlers/login, function: login }
"#;
        let report = h.interpreter.interpret_str(doc, origin()).await.unwrap();
        assert_eq!((report.routes, report.websockets), (1, 1));
        assert!(report.errors.iter().all(|e| matches!(e, Error::Resolution { .. })));
        assert!(h.websockets.resolve("/ws").is_some());

        // The same document under another directory resolves nothing.
        let elsewhere = h
            .interpreter
            .interpret_str(doc, Path::new("/srv/other/setting.yaml"))
            .await
            .unwrap();
        assert_eq!(elsewhere.routes + elsewhere.websockets, 0);
    }

    #[tokio::test]
    async fn plugins_extend_the_router_and_failures_are_isolated() {
        let h = harness();
        let doc = r#"
plugins:
  - import: { module: ./plugins/broken }
  - import: { module: ./plugins/sample, function: addRoute }
    options: { prefix: /shop }
  - options: {}
"#;
        let before = PLUGIN_CALLS.load(Ordering::SeqCst);
        let report = h.interpreter.interpret_str(doc, origin()).await.unwrap();
        assert_eq!(report.plugins, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(report.errors[0], Error::Handler(_)));
        assert!(PLUGIN_CALLS.load(Ordering::SeqCst) > before);

        let res = get(&h.router, "/shop/plugin-route").await;
        assert_eq!(res.body(), b"from plugin");
    }

    #[tokio::test]
    async fn databases_register_in_order_and_failures_do_not_block() {
        let h = harness();
        let doc = r#"
databases:
  - name: first
    type: memory
    connection: ":memory:"
    migrations: [{ version: 1, up: "SET greeting hello" }]
  - name: second
    type: cassandra
    connection: "cass://"
  - name: third
    backendType: memory
    connection: ":memory:"
"#;
        let report = h.interpreter.interpret_str(doc, origin()).await.unwrap();
        assert_eq!(report.databases, 2);
        assert_eq!(h.databases.names(), ["first", "third"]);

        h.databases.migrate_all().await.unwrap();
        let first = h.databases.get("first").unwrap();
        assert_eq!(first.query("GET greeting").await.unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn odd_sections_and_documents() {
        let h = harness();
        let report = h
            .interpreter
            .interpret_str("routes: {method: GET}\nplugins: ~\n", origin())
            .await
            .unwrap();
        assert_eq!(report.routes, 0);
        assert!(report.is_clean());

        let empty = h.interpreter.interpret_str("", origin()).await.unwrap();
        assert!(empty.is_clean());

        assert!(h.interpreter.interpret_str("- a\n- b\n", origin()).await.is_err());
        assert!(matches!(
            h.interpreter.interpret_str("routes: [", origin()).await,
            Err(Error::Document(_))
        ));
    }

    #[tokio::test]
    async fn reading_a_document_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setting.yaml");
        std::fs::write(&path, "routes:\n  - {method: GET, path: /x, response: {data: plain}}\n").unwrap();

        let h = harness();
        let report = h.interpreter.interpret(&path).await.unwrap();
        assert_eq!(report.routes, 1);
        assert_eq!(get(&h.router, "/x").await.body(), b"plain");

        assert!(matches!(
            h.interpreter.interpret(dir.path().join("absent.yaml")).await,
            Err(Error::Io(_))
        ));
    }
}
