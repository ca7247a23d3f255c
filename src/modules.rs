//! Registry of linked code that descriptor documents refer to by name.
//!
//! A document says `import: {module: ./handlers/login, function: login}`.
//! There is no loading of code at runtime: the application registers each
//! export up front, keyed by the module's path, and the interpreter looks the
//! reference up relative to the directory of the document that declared it.
//!
//! ```rust
//! use neon::{Modules, Request};
//!
//! async fn login(_req: Request) -> &'static str { "token" }
//!
//! let modules = Modules::new("config").handler("handlers/login", "login", login);
//! ```
//!
//! With that registry, `config/setting.yaml` may reference
//! `{module: ./handlers/login.js, function: login}`: the file extension is
//! ignored and the path is resolved against `config/`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::paths;
use crate::plugin::{BoxedPlugin, Plugin};
use crate::websocket::{BoxedWsHandler, WsHandler};

/// Export name selected when a reference omits `function`.
pub const DEFAULT_EXPORT: &str = "default";

/// A `module` + optional `function` reference from a descriptor document.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleRef {
    pub module: String,
    #[serde(default)]
    pub function: Option<String>,
}

impl ModuleRef {
    pub fn new(module: impl Into<String>, function: Option<&str>) -> Self {
        Self { module: module.into(), function: function.map(str::to_owned) }
    }

    fn export(&self) -> &str {
        self.function.as_deref().unwrap_or(DEFAULT_EXPORT)
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.module, self.export())
    }
}

enum Export {
    Handler(BoxedHandler),
    WebSocket(BoxedWsHandler),
    Plugin(BoxedPlugin),
}

impl Export {
    fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "route handler",
            Self::WebSocket(_) => "websocket handler",
            Self::Plugin(_) => "plugin",
        }
    }
}

/// Statically linked handlers, websocket handlers and plugins by module path.
pub struct Modules {
    root: PathBuf,
    exports: HashMap<PathBuf, HashMap<String, Export>>,
}

impl Default for Modules {
    fn default() -> Self {
        Self::new(".")
    }
}

impl Modules {
    /// Module paths registered later are relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: absolute(&root.into()), exports: HashMap::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a route handler as `module#function`.
    pub fn handler(self, module: &str, function: &str, handler: impl Handler) -> Self {
        self.export(module, function, Export::Handler(handler.into_boxed_handler()))
    }

    pub fn websocket(self, module: &str, function: &str, handler: impl WsHandler) -> Self {
        self.export(module, function, Export::WebSocket(handler.into_boxed_ws_handler()))
    }

    pub fn plugin(self, module: &str, function: &str, plugin: impl Plugin) -> Self {
        self.export(module, function, Export::Plugin(plugin.into_boxed_plugin()))
    }

    /// Number of registered exports across all modules.
    pub fn len(&self) -> usize {
        self.exports.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn export(mut self, module: &str, function: &str, export: Export) -> Self {
        let key = key(&self.root, module);
        self.exports.entry(key).or_default().insert(function.to_owned(), export);
        self
    }

    fn lookup(&self, doc_dir: &Path, reference: &ModuleRef) -> Result<&Export, Error> {
        let key = key(&absolute(doc_dir), &reference.module);
        let module = self.exports.get(&key).ok_or_else(|| {
            Error::resolution(reference.to_string(), format!("no module registered at `{}`", key.display()))
        })?;
        module
            .get(reference.export())
            .ok_or_else(|| Error::resolution(reference.to_string(), "module has no such export"))
    }

    pub fn resolve_handler(&self, doc_dir: &Path, reference: &ModuleRef) -> Result<BoxedHandler, Error> {
        match self.lookup(doc_dir, reference)? {
            Export::Handler(h) => Ok(h.clone()),
            other => Err(wrong_kind(reference, other, "route handler")),
        }
    }

    pub fn resolve_websocket(&self, doc_dir: &Path, reference: &ModuleRef) -> Result<BoxedWsHandler, Error> {
        match self.lookup(doc_dir, reference)? {
            Export::WebSocket(h) => Ok(h.clone()),
            other => Err(wrong_kind(reference, other, "websocket handler")),
        }
    }

    pub fn resolve_plugin(&self, doc_dir: &Path, reference: &ModuleRef) -> Result<BoxedPlugin, Error> {
        match self.lookup(doc_dir, reference)? {
            Export::Plugin(p) => Ok(p.clone()),
            other => Err(wrong_kind(reference, other, "plugin")),
        }
    }
}

fn wrong_kind(reference: &ModuleRef, found: &Export, expected: &str) -> Error {
    Error::resolution(reference.to_string(), format!("export is a {}, expected a {expected}", found.kind()))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `base/module` without a file extension, lexically normalized.
fn key(base: &Path, module: &str) -> PathBuf {
    paths::normalize(&base.join(module).with_extension(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::plugin::PluginContext;
    use crate::request::Request;
    use crate::websocket::WebSocket;

    async fn hello(_req: Request) -> &'static str {
        "hello"
    }

    async fn echo(_socket: WebSocket, _req: Request) {}

    async fn setup(_ctx: PluginContext) -> Result<(), Error> {
        Ok(())
    }

    fn modules() -> Modules {
        Modules::new("/srv/app")
            .handler("handlers/hello", "hello", hello)
            .handler("handlers/hello", DEFAULT_EXPORT, hello)
            .websocket("handlers/ws", DEFAULT_EXPORT, echo)
            .plugin("plugins/setup", "setup", setup)
    }

    #[tokio::test]
    async fn resolves_relative_to_the_document_directory() {
        let modules = modules();
        assert_eq!(modules.len(), 4);

        let reference = ModuleRef::new("./handlers/hello.js", Some("hello"));
        let handler = modules.resolve_handler(Path::new("/srv/app"), &reference).unwrap();
        let res = handler.call(Request::new(Method::Get, "/")).await;
        assert_eq!(res.body(), b"hello");

        let nested = ModuleRef::new("../handlers/hello", None);
        assert!(modules.resolve_handler(Path::new("/srv/app/routes"), &nested).is_ok());

        let elsewhere = modules.resolve_handler(Path::new("/srv/other"), &reference);
        assert!(matches!(elsewhere, Err(Error::Resolution { .. })));
    }

    #[test]
    fn missing_function_selects_the_default_export() {
        let modules = modules();
        let dir = Path::new("/srv/app");
        assert!(modules.resolve_websocket(dir, &ModuleRef::new("handlers/ws", None)).is_ok());
        assert!(modules.resolve_websocket(dir, &ModuleRef::new("handlers/ws", Some("other"))).is_err());
    }

    #[test]
    fn wrong_export_kind_is_a_resolution_error() {
        let modules = modules();
        let dir = Path::new("/srv/app");
        let err = modules
            .resolve_plugin(dir, &ModuleRef::new("handlers/hello", Some("hello")))
            .err()
            .unwrap();
        assert!(err.to_string().contains("expected a plugin"), "{err}");
        assert!(modules.resolve_plugin(dir, &ModuleRef::new("plugins/setup", Some("setup"))).is_ok());
    }

    #[test]
    fn references_deserialize_with_an_optional_function() {
        let r: ModuleRef = serde_yaml::from_str("module: ./handlers/ws").unwrap();
        assert_eq!(r.to_string(), "./handlers/ws#default");
    }
}
