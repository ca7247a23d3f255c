//! Unified error type.

use http::StatusCode;
use thiserror::Error;

/// The error type returned by neon's fallible operations.
///
/// Every variant is contained to the request or the descriptor entry that
/// produced it: nothing here is fatal to the process. [`Error::status`] gives
/// the HTTP status each kind surfaces as when it reaches a response.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor is missing a required field or carries an invalid one.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `module` + `function` reference did not resolve.
    #[error("cannot resolve `{reference}`: {reason}")]
    Resolution { reference: String, reason: String },

    /// Missing, malformed, invalid, or expired credential.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A fault raised while a handler or interceptor was running.
    #[error("handler fault: {0}")]
    Handler(String),

    /// A route could not be compiled.
    #[error("route registration failed: {0}")]
    Registration(String),

    #[error("database `{name}`: {reason}")]
    Database { name: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid descriptor document: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("invalid settings: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("transport: {0}")]
    Transport(#[from] hyper::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resolution(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution { reference: reference.into(), reason: reason.into() }
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn database(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database { name: name.into(), reason: reason.into() }
    }

    /// The status this error surfaces as once it reaches a response.
    ///
    /// Status codes are the compatibility surface; bodies are plain text.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds an error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_owned()
        };
        Self::Handler(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_maps_to_401_everything_else_to_500() {
        assert_eq!(Error::authentication("nope").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::handler("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(Error::configuration("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn panic_payloads_become_handler_errors() {
        let err = Error::from_panic(Box::new("static message"));
        assert!(matches!(err, Error::Handler(ref m) if m == "static message"));

        let err = Error::from_panic(Box::new(String::from("owned message")));
        assert!(matches!(err, Error::Handler(ref m) if m == "owned message"));

        let err = Error::from_panic(Box::new(42_u8));
        assert!(matches!(err, Error::Handler(_)));
    }
}
