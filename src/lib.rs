//! # neon
//!
//! A descriptor-driven HTTP and WebSocket serving core.
//!
//! Requests walk one ordered chain of interceptors that ends in a pattern
//! router. Routes, WebSocket endpoints, databases and plugins come either
//! from code or from YAML descriptor documents, which can be loaded at
//! startup or at any time while serving.
//!
//! ```text
//! request → RequestLog → RateLimiter → Sessions → SecurityHeaders → JsonBody → Router → NotFound
//!                                                                                │
//!                                          literal (method, path) → pattern routes in order
//!                                                                                │
//!                                                      [Authenticate] → handler → response
//! ```
//!
//! What's in the box:
//!
//! - Interceptor pipeline: advance, abort with an error, or answer early
//! - Router: literal routes first, then `:param` patterns; first match wins
//! - Declarative responses: `json`, `html`, `file` (streamed), `raw`
//! - Bearer-token authentication per route (HS256 via `jsonwebtoken`)
//! - WebSocket endpoints on exact paths
//! - Databases with ordered, versioned migrations behind a pluggable backend
//! - Graceful shutdown: SIGTERM / Ctrl-C, drains in-flight requests
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use neon::{App, Method, Modules, Request, Response, Server, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), neon::Error> {
//!     let settings = Settings::default().with_env_overrides();
//!     let server = Server::bind(&settings.bind)?;
//!
//!     // Documents in ./config may `import: {module: ./handlers/user, function: get}`.
//!     let modules = Modules::new("config").handler("handlers/user", "get", get_user);
//!     let app = App::builder(settings).modules(modules).build();
//!     app.router().on(Method::Get, "/users/:id", get_user)?;
//!
//!     app.start(server).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

mod app;
mod auth;
mod config;
mod database;
mod error;
mod interpreter;
mod method;
mod modules;
mod paths;
mod pipeline;
mod plugin;
mod request;
mod response;
mod router;
mod server;
mod websocket;

pub mod handler;
pub mod middleware;

pub use app::{App, AppBuilder};
pub use auth::{Authenticate, Authenticator, Identity, JwtAuthenticator};
pub use config::{RateLimitSettings, SessionSettings, Settings};
pub use database::{
    Backend, Connector, Database, DatabaseEntry, DatabaseManager, Databases, MemoryBackend,
    MemoryConnector, Migration,
};
pub use error::Error;
pub use handler::Handler;
pub use interpreter::{Interpreter, LoadReport};
pub use method::{Method, UnknownMethod};
pub use modules::{DEFAULT_EXPORT, ModuleRef, Modules};
pub use pipeline::{Interceptor, Next, Pipeline};
pub use plugin::{Plugin, PluginContext};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{PathPattern, ResponseSpec, RouteDescriptor, RouteHandler, RouteInfo, Router};
pub use server::Server;
pub use websocket::{Message, WebSocket, WebSocketRegistry, WebSocketRoute, WsHandler};
