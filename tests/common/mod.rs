//! Shared helpers: a real server on an ephemeral port, wired from a
//! descriptor document written to a temporary directory.

use std::net::SocketAddr;
use std::sync::Arc;

use neon::{
    App, Error, JwtAuthenticator, Message, Modules, PluginContext, Request, Response,
    RouteDescriptor, Server, Settings, WebSocket,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const SECRET: &[u8] = b"integration-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub app: Arc<App>,
    pub tokens: Arc<JwtAuthenticator>,
    pub dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<(), Error>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Stops accepting, drains, and returns the server's result.
    pub async fn stop(mut self) -> Result<(), Error> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.expect("server task panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `document` as `setting.yaml`, builds the app with the test
/// modules, runs `initialize`, and serves on `127.0.0.1:0`.
pub async fn start(document: &str) -> TestServer {
    start_with(document, |settings| settings).await
}

pub async fn start_with(document: &str, tweak: impl FnOnce(Settings) -> Settings) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("setting.yaml");
    std::fs::write(&config_path, document).unwrap();

    let settings = tweak(Settings {
        config_path,
        file_root: dir.path().to_path_buf(),
        ..Settings::default()
    });

    let tokens = Arc::new(JwtAuthenticator::new(SECRET));
    let app = Arc::new(
        App::builder(settings)
            .modules(modules(dir.path(), Arc::clone(&tokens)))
            .authenticator(Arc::clone(&tokens) as Arc<dyn neon::Authenticator>)
            .build(),
    );
    app.initialize().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let server_app = Arc::clone(&app);
    let handle = tokio::spawn(async move {
        Server::from_listener(listener)
            .serve_with_shutdown(server_app, async {
                let _ = rx.await;
            })
            .await
    });

    TestServer { addr, app, tokens, dir, shutdown: Some(tx), handle: Some(handle) }
}

fn modules(root: &std::path::Path, tokens: Arc<JwtAuthenticator>) -> Modules {
    Modules::new(root)
        .handler("handlers/login", "login", move |req: Request| {
            let tokens = Arc::clone(&tokens);
            async move { login(&tokens, req) }
        })
        .handler("handlers/profile", "profile", profile)
        .handler("handlers/products", "show", show_product)
        .websocket("handlers/ws", neon::DEFAULT_EXPORT, echo)
        .plugin("plugins/sample", "initPlugin", init_plugin)
}

fn login(tokens: &JwtAuthenticator, req: Request) -> Result<Response, Error> {
    let body: serde_json::Value = req.json().unwrap_or_default();
    match (body["username"].as_str(), body["password"].as_str()) {
        (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
            let token = tokens.issue(json!({ "username": user }))?;
            Ok(Response::json(json!({ "token": token }).to_string()))
        }
        _ => Ok(Response::builder()
            .status(http::StatusCode::BAD_REQUEST)
            .text("Missing credentials")),
    }
}

async fn profile(req: Request) -> serde_json::Value {
    json!({ "user": req.identity().and_then(|id| id.get("username")).cloned() })
}

async fn show_product(req: Request) -> serde_json::Value {
    json!({ "id": req.param("id") })
}

async fn echo(mut socket: WebSocket, _req: Request) {
    if socket.send(json!({ "message": "welcome" }).to_string()).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                if socket.send(format!("Echo: {}", text.as_str())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn init_plugin(ctx: PluginContext) -> Result<(), Error> {
    ctx.router.register_route(
        RouteDescriptor::new("GET", "/plugin-route")
            .json(json!({ "message": "This route was registered by a plugin!", "options": ctx.options })),
    )
}
