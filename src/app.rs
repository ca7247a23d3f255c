//! The application: one pipeline, router, websocket registry, database
//! manager and interpreter, wired together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::{Authenticator, JwtAuthenticator};
use crate::config::Settings;
use crate::database::{DatabaseManager, Databases};
use crate::error::Error;
use crate::interpreter::{Interpreter, LoadReport};
use crate::middleware::{JsonBody, NotFound, RateLimiter, RequestLog, SecurityHeaders, Sessions};
use crate::modules::Modules;
use crate::pipeline::{Interceptor, Pipeline};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::server::Server;
use crate::websocket::WebSocketRegistry;

/// A configured application, ready to load documents and serve.
///
/// ```rust,no_run
/// use neon::{App, Server, Settings};
///
/// # async fn run() -> Result<(), neon::Error> {
/// let settings = Settings::default().with_env_overrides();
/// let server = Server::bind(&settings.bind)?;
/// App::builder(settings).build().start(server).await
/// # }
/// ```
pub struct App {
    settings: Settings,
    pipeline: Pipeline,
    router: Arc<Router>,
    websockets: Arc<WebSocketRegistry>,
    databases: Arc<dyn DatabaseManager>,
    interpreter: Interpreter,
}

impl App {
    pub fn builder(settings: Settings) -> AppBuilder {
        AppBuilder {
            settings,
            modules: None,
            databases: None,
            authenticator: None,
            interceptors: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn router(&self) -> &Arc<Router> { &self.router }
    pub fn websockets(&self) -> &Arc<WebSocketRegistry> { &self.websockets }
    pub fn databases(&self) -> &Arc<dyn DatabaseManager> { &self.databases }
    pub fn pipeline(&self) -> &Pipeline { &self.pipeline }

    /// Interprets a document, or every `*.yaml` / `*.yml` document of a
    /// directory in file-name order.
    ///
    /// Safe while serving: new routes appear atomically. In a directory, a
    /// document that fails to parse is logged and the rest still load.
    pub async fn load_script(&self, path: impl AsRef<Path>) -> Result<Vec<LoadReport>, Error> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "descriptor path not found");
        })?;
        if !metadata.is_dir() {
            return Ok(vec![self.interpreter.interpret(path).await?]);
        }

        let mut reports = Vec::new();
        for document in documents_in(path).await? {
            match self.interpreter.interpret(&document).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(path = %document.display(), error = %e, "descriptor document failed"),
            }
        }
        Ok(reports)
    }

    /// Auto-loads `config_path` (when enabled) and applies pending migrations.
    ///
    /// Neither step is fatal: failures are logged and the app stays usable.
    pub async fn initialize(&self) {
        if self.settings.auto_load {
            match self.load_script(&self.settings.config_path).await {
                Ok(reports) => {
                    let failed = reports.iter().map(|r| r.errors.len()).sum::<usize>();
                    info!(documents = reports.len(), failed_entries = failed, "auto-load finished");
                }
                Err(e) => warn!(error = %e, "auto-load skipped"),
            }
        }
        if let Err(e) = self.databases.migrate_all().await {
            error!(error = %e, "migrations incomplete");
        }
    }

    /// [`initialize`](App::initialize), then serve until a shutdown signal.
    pub async fn start(self, server: Server) -> Result<(), Error> {
        self.initialize().await;
        server.serve(self).await
    }

    /// Runs `req` through the pipeline in-process.
    pub async fn handle(&self, mut req: Request) -> Response {
        let mut res = Response::new();
        self.pipeline.dispatch(&mut req, &mut res).await;
        res
    }
}

async fn documents_in(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut documents = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        if is_yaml && entry.file_type().await?.is_file() {
            documents.push(path);
        }
    }
    documents.sort();
    Ok(documents)
}

/// Builder for [`App`].
pub struct AppBuilder {
    settings: Settings,
    modules: Option<Modules>,
    databases: Option<Arc<dyn DatabaseManager>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl AppBuilder {
    /// Code that documents may `import`.
    pub fn modules(mut self, modules: Modules) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Replaces the stock [`Databases`] manager.
    pub fn databases(mut self, databases: impl DatabaseManager) -> Self {
        self.databases = Some(Arc::new(databases));
        self
    }

    /// Verifies bearer tokens for `authRequired` routes. Defaults to HS256
    /// with `auth_secret`.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Adds an interceptor right before the router.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> App {
        let AppBuilder { settings, modules, databases, authenticator, interceptors } = self;

        let authenticator = authenticator.unwrap_or_else(|| {
            Arc::new(JwtAuthenticator::new(settings.auth_secret.as_bytes()).with_ttl(settings.token_ttl_secs))
        });
        let router = Arc::new(Router::new(authenticator).with_file_root(settings.file_root.clone()));
        let websockets = Arc::new(WebSocketRegistry::new());
        let databases = databases.unwrap_or_else(|| Arc::new(Databases::new()));
        let modules = Arc::new(modules.unwrap_or_default());

        let mut pipeline = Pipeline::new();
        pipeline
            .register(RequestLog)
            .register(
                RateLimiter::new(settings.rate_limit.window(), settings.rate_limit.max_requests)
                    .with_message(settings.rate_limit.message.clone()),
            )
            .register(
                Sessions::new(settings.session.cookie_name.clone())
                    .with_idle_timeout(settings.session.idle_timeout()),
            )
            .register(SecurityHeaders)
            .register(JsonBody);
        for interceptor in interceptors {
            pipeline.register(interceptor);
        }
        pipeline.register(Arc::clone(&router)).register(NotFound);

        let interpreter = Interpreter::new(
            Arc::clone(&router),
            Arc::clone(&websockets),
            Arc::clone(&databases),
            modules,
        );
        App { settings, pipeline, router, websockets, databases, interpreter }
    }
}
