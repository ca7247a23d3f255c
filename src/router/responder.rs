//! Handlers synthesized from declarative response kinds.

use std::future::ready;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::paths;
use crate::request::Request;
use crate::response::{ContentType, IntoResponse, Response};
use crate::router::ResponseSpec;

/// Builds the endpoint for a declarative response kind.
///
/// `json` is serialized once here, not per request. `file` paths are checked
/// against `file_root` lexically now and again, after symlink resolution, at
/// request time.
pub(crate) fn synthesize(spec: ResponseSpec, file_root: &Path) -> Result<BoxedHandler, Error> {
    let handler: BoxedHandler = match spec {
        ResponseSpec::Handler(handler) => handler,
        ResponseSpec::Json(value) => {
            let body = serde_json::to_vec(&value)
                .map_err(|e| Error::configuration(format!("json response data: {e}")))?;
            Arc::new(Fixed { kind: Kind::Json, body: body.into() })
        }
        ResponseSpec::Html(text) => Arc::new(Fixed { kind: Kind::Html, body: text.into() }),
        ResponseSpec::Raw(body) => Arc::new(Fixed { kind: Kind::Raw, body }),
        ResponseSpec::File(path) => {
            if !paths::is_contained(&path) {
                return Err(Error::configuration(format!(
                    "file `{}` escapes the file root",
                    path.display()
                )));
            }
            Arc::new(Download {
                root: file_root.to_path_buf(),
                path: paths::normalize(&file_root.join(path)),
            })
        }
    };
    Ok(handler)
}

enum Kind {
    Json,
    Html,
    Raw,
}

/// A body fixed at registration.
struct Fixed {
    kind: Kind,
    body: Bytes,
}

impl ErasedHandler for Fixed {
    fn call(&self, _req: Request) -> BoxFuture<'static, Response> {
        let body = self.body.clone();
        let res = match self.kind {
            Kind::Json => Response::json(body),
            Kind::Html => Response::builder().bytes(ContentType::Html, body),
            Kind::Raw => Response::raw(body),
        };
        Box::pin(ready(res))
    }
}

/// Streams a file below `root` as an attachment.
struct Download {
    root: PathBuf,
    path: PathBuf,
}

impl ErasedHandler for Download {
    fn call(&self, _req: Request) -> BoxFuture<'static, Response> {
        let root = self.root.clone();
        let path = self.path.clone();
        Box::pin(async move { open_within(&root, &path).await.into_response() })
    }
}

async fn open_within(root: &Path, path: &Path) -> Result<Response, Error> {
    let root = tokio::fs::canonicalize(root).await?;
    let real = tokio::fs::canonicalize(path).await?;
    if !real.starts_with(&root) {
        return Err(Error::handler(format!(
            "`{}` resolves outside the file root",
            path.display()
        )));
    }
    let file = tokio::fs::File::open(&real).await?;
    let name = real
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Response::attachment(file, &name))
}
