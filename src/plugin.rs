//! Plugins: code that extends a running app at load time.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::database::DatabaseManager;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::router::Router;
use crate::websocket::WebSocketRegistry;

/// Everything a plugin may extend, plus the `options` of its descriptor entry.
#[derive(Clone)]
pub struct PluginContext {
    pub router: Arc<Router>,
    pub websockets: Arc<WebSocketRegistry>,
    pub databases: Arc<dyn DatabaseManager>,
    pub options: Value,
}

#[doc(hidden)]
pub trait ErasedPlugin {
    fn call(&self, ctx: PluginContext) -> BoxFuture<'static, Result<(), Error>>;
}

#[doc(hidden)]
pub type BoxedPlugin = Arc<dyn ErasedPlugin + Send + Sync + 'static>;

/// Implemented for every valid plugin:
///
/// ```text
/// async fn name(ctx: PluginContext) -> Result<(), neon::Error>
/// ```
pub trait Plugin: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_plugin(self) -> BoxedPlugin;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
}

impl<F, Fut> Plugin for F
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn into_boxed_plugin(self) -> BoxedPlugin {
        Arc::new(FnPlugin(self))
    }
}

struct FnPlugin<F>(F);

impl<F, Fut> ErasedPlugin for FnPlugin<F>
where
    F: Fn(PluginContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, ctx: PluginContext) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin((self.0)(ctx))
    }
}
