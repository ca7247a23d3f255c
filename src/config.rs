//! Application settings.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a
//! working configuration:
//!
//! ```toml
//! bind = "0.0.0.0:3000"
//! auth_secret = "change-me"
//! token_ttl_secs = 3600
//! config_path = "setting.yaml"   # a document, or a directory of them
//! auto_load = true
//! file_root = "."
//! max_body_bytes = 2097152      # larger request bodies get 413
//!
//! [rate_limit]
//! window_secs = 60
//! max_requests = 100
//! message = "Too Many Requests"
//!
//! [session]
//! cookie_name = "neon_session"
//! idle_timeout_secs = 1800
//! ```
//!
//! `PORT`, `AUTH_SECRET` and `NEON_CONFIG` override `bind`'s port,
//! `auth_secret` and `config_path` respectively.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `host:port` to listen on.
    pub bind: String,
    /// HS256 secret for issuing and verifying bearer tokens.
    pub auth_secret: String,
    pub token_ttl_secs: u64,
    /// Descriptor document, or a directory of `*.yaml` / `*.yml` documents.
    pub config_path: PathBuf,
    /// Load `config_path` when the app starts.
    pub auto_load: bool,
    /// Directory `file` routes are served from.
    pub file_root: PathBuf,
    /// Largest request body read into memory; larger ones are answered 413.
    pub max_body_bytes: usize,
    pub rate_limit: RateLimitSettings,
    pub session: SessionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_owned(),
            auth_secret: "default_secret_key".to_owned(),
            token_ttl_secs: 3600,
            config_path: PathBuf::from("setting.yaml"),
            auto_load: true,
            file_root: PathBuf::from("."),
            max_body_bytes: 2 * 1024 * 1024,
            rate_limit: RateLimitSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max_requests: usize,
    pub message: String,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { window_secs: 60, max_requests: 100, message: "Too Many Requests".to_owned() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub cookie_name: String,
    pub idle_timeout_secs: u64,
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { cookie_name: "neon_session".to_owned(), idle_timeout_secs: 1800 }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `PORT`, `AUTH_SECRET` and `NEON_CONFIG` from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    let host = self.bind.rsplit_once(':').map_or("0.0.0.0", |(host, _)| host);
                    self.bind = format!("{host}:{port}");
                }
                Err(_) => warn!(port = %port, "ignoring invalid PORT"),
            }
        }
        if let Some(secret) = var("AUTH_SECRET") {
            self.auth_secret = secret;
        }
        if let Some(path) = var("NEON_CONFIG") {
            self.config_path = path.into();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.bind, "0.0.0.0:3000");
        assert_eq!(settings.auth_secret, "default_secret_key");
        assert_eq!(settings.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(settings.rate_limit.max_requests, 100);
        assert_eq!(settings.session.cookie_name, "neon_session");
        assert_eq!(settings.session.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.max_body_bytes, 2 * 1024 * 1024);
        assert!(settings.auto_load);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let settings = Settings::from_toml(
            "bind = \"127.0.0.1:8080\"\nconfig_path = \"conf.d\"\n[rate_limit]\nmax_requests = 5\n",
        )
        .unwrap();
        assert_eq!(settings.bind, "127.0.0.1:8080");
        assert_eq!(settings.config_path, PathBuf::from("conf.d"));
        assert_eq!(settings.rate_limit.max_requests, 5);
        assert_eq!(settings.rate_limit.message, "Too Many Requests");
    }

    #[test]
    fn malformed_toml_is_a_settings_error() {
        assert!(matches!(Settings::from_toml("bind = "), Err(Error::Settings(_))));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> =
            [("PORT", "4100"), ("AUTH_SECRET", "s3cret"), ("NEON_CONFIG", "/etc/neon")].into();
        let settings = Settings::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.bind, "0.0.0.0:4100");
        assert_eq!(settings.auth_secret, "s3cret");
        assert_eq!(settings.config_path, PathBuf::from("/etc/neon"));

        let untouched = Settings::default().with_overrides(|key| (key == "PORT").then(|| "nope".into()));
        assert_eq!(untouched.bind, "0.0.0.0:3000");
    }
}
