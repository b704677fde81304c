// MIT License
// Copyright 2023--present potserve developers

//! Server configuration.
//!
//! Loaded from the `[server]` table of a TOML file; command-line flags in
//! the `potserve` binary override individual fields afterwards.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 31415
//! recv-timeout-s = 30.0
//! model = "models/he.toml"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_MAX_ATOMS: usize = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Listen backlog. Connections are still served one at a time.
    pub max_connections: u32,
    pub reuse_address: bool,
    pub recv_timeout_s: f64,
    pub send_timeout_s: f64,
    pub max_atoms: usize,
    /// How often the accept loop wakes up to look at control state.
    pub poll_interval_s: f64,
    /// Two interrupts closer than this mean shutdown.
    pub debounce_window_s: f64,
    /// Model file the handler is loaded from, and reloaded from.
    pub model: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: 1,
            reuse_address: true,
            recv_timeout_s: 15.0,
            send_timeout_s: 15.0,
            max_atoms: DEFAULT_MAX_ATOMS,
            poll_interval_s: 0.5,
            debounce_window_s: 2.0,
            model: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
}

impl ServerConfig {
    /// Parse a TOML document with a `[server]` table.
    pub fn from_toml_str(text: &str) -> Result<Self, ServerError> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        file.server.validated()
    }

    /// Load from a file. A relative `model` path is resolved against the
    /// file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let (Some(model), Some(dir)) = (config.model.as_mut(), path.parent()) {
            if model.is_relative() {
                *model = dir.join(&*model);
            }
        }
        Ok(config)
    }

    /// Check value ranges, returning the config unchanged when valid.
    pub fn validated(self) -> Result<Self, ServerError> {
        for (name, value) in [
            ("recv-timeout-s", self.recv_timeout_s),
            ("send-timeout-s", self.send_timeout_s),
            ("poll-interval-s", self.poll_interval_s),
            ("debounce-window-s", self.debounce_window_s),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ServerError::Config(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }
        if self.max_atoms == 0 {
            return Err(ServerError::Config("max-atoms must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max-connections must be at least 1".into()));
        }
        Ok(self)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recv_timeout_s)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.send_timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_window_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:12345");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.debounce_window(), Duration::from_secs(2));
        assert_eq!(config.recv_timeout(), Duration::from_secs(15));
        assert!(config.clone().validated().is_ok());
    }

    #[test]
    fn partial_server_table_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
[server]
port = 4000
max-atoms = 64
"#,
        )
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_atoms, 64);
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ServerConfig::from_toml_str("").unwrap(), ServerConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ServerConfig::from_toml_str("[server]\nbuffer-size = 1024\n").is_err());
    }

    #[test]
    fn non_positive_timeouts_are_rejected() {
        let err = ServerConfig::from_toml_str("[server]\nrecv-timeout-s = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("recv-timeout-s"));
        assert!(ServerConfig::from_toml_str("[server]\nmax-atoms = 0\n").is_err());
    }

    #[test]
    fn relative_model_path_resolves_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("potserve.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[server]\nmodel = \"he.toml\"").unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.model, Some(dir.path().join("he.toml")));
    }
}
