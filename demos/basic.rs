//! neon demo: descriptor-driven routes, auth, websockets and plugins.
//!
//! Run from the repository root with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/public
//!   curl -OJ http://localhost:3000/manual
//!   TOKEN=$(curl -s -X POST http://localhost:3000/login \
//!        -H 'content-type: application/json' \
//!        -d '{"username":"alice","password":"pw"}' | jq -r .token)
//!   curl -H "authorization: Bearer $TOKEN" http://localhost:3000/profile
//!   curl http://localhost:3000/products/7
//!   websocat ws://localhost:3000/ws

use std::sync::Arc;

use neon::{
    App, Error, JwtAuthenticator, Message, Method, Modules, PluginContext, Request, Response,
    RouteDescriptor, Server, Settings, WebSocket,
};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = Settings {
        config_path: "demos/config/setting.yaml".into(),
        ..Settings::default()
    }
    .with_env_overrides();

    // One authenticator issues tokens at /login and verifies them on
    // `authRequired` routes.
    let tokens = Arc::new(
        JwtAuthenticator::new(settings.auth_secret.as_bytes()).with_ttl(settings.token_ttl_secs),
    );

    let login_tokens = Arc::clone(&tokens);
    let modules = Modules::new("demos/config")
        .handler("handlers/login", "login", move |req: Request| {
            let tokens = Arc::clone(&login_tokens);
            async move { login(&tokens, req) }
        })
        .handler("handlers/profile", "profile", profile)
        .websocket("handlers/ws", neon::DEFAULT_EXPORT, echo)
        .plugin("plugins/sample", "initPlugin", init_plugin)
        .plugin("plugins/shop", "initShoppingMall", init_shopping_mall);

    let server = Server::bind(&settings.bind)?;
    App::builder(settings)
        .modules(modules)
        .authenticator(tokens)
        .build()
        .start(server)
        .await
}

#[derive(Deserialize)]
struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

// POST /login
fn login(tokens: &JwtAuthenticator, req: Request) -> Result<Response, Error> {
    let creds: Option<Credentials> = req.json().ok();
    let Some(creds) = creds.filter(|c| !c.username.is_empty() && !c.password.is_empty()) else {
        return Ok(Response::builder()
            .status(http::StatusCode::BAD_REQUEST)
            .text("Missing credentials"));
    };
    let token = tokens.issue(json!({ "username": creds.username }))?;
    Ok(Response::json(json!({ "token": token }).to_string()))
}

// GET /profile (authRequired)
async fn profile(req: Request) -> serde_json::Value {
    json!({ "user": req.identity().and_then(|id| id.get("username")).cloned() })
}

// WS /ws
async fn echo(mut socket: WebSocket, _req: Request) {
    let welcome = json!({ "message": "Welcome to the neon WebSocket!" }).to_string();
    if socket.send(welcome).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => format!("Echo: {}", text.as_str()),
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

async fn init_plugin(ctx: PluginContext) -> Result<(), Error> {
    ctx.router.register_route(
        RouteDescriptor::new("GET", "/plugin-route")
            .json(json!({ "message": "This route was registered by a plugin!", "options": ctx.options })),
    )
}

async fn init_shopping_mall(ctx: PluginContext) -> Result<(), Error> {
    let router = &ctx.router;
    router.register_route(RouteDescriptor::new("GET", "/products").json(json!({
        "products": [
            { "id": 1, "name": "Product A", "price": 10.0 },
            { "id": 2, "name": "Product B", "price": 20.0 }
        ]
    })))?;
    router.on(Method::Get, "/products/:id", |req: Request| async move {
        let id = req.param("id").unwrap_or_default().to_owned();
        let price = id.parse::<f64>().map(|n| n * 10.0).ok();
        json!({ "id": id, "name": format!("Product {id}"), "price": price })
    })?;
    router.register_route(RouteDescriptor::new("POST", "/cart").json(json!({ "message": "Item added to cart" })))?;
    router.register_route(RouteDescriptor::new("GET", "/cart").json(json!({ "items": [] })))?;
    router.register_route(RouteDescriptor::new("POST", "/checkout").json(json!({ "message": "Checkout successful" })))
}
