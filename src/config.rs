//! Server and client configuration.
//!
//! The served root is an explicit value carried by [`ServerConfig`]; nothing
//! here is process-global.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, MAX_REQUEST_BYTES};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control listener address (host:port)
    pub bind: String,
    /// Directory tree exposed to clients
    pub root: PathBuf,
    /// Deadline for every accept/read/write on either channel
    pub io_timeout_secs: u64,
    /// Largest control request accepted before the sentinel
    pub max_request_bytes: usize,
    /// Optional transfer log
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9040".to_string(),
            root: PathBuf::from("files"),
            io_timeout_secs: timeouts::IO_SECS,
            max_request_bytes: MAX_REQUEST_BYTES,
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let cfg: ServerConfig = toml::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// Validate the root and replace it with its canonical form.
    ///
    /// Sandbox checks compare against this canonical root.
    pub fn canonicalize_root(mut self) -> Result<Self> {
        if !self.root.exists() {
            bail!("Root directory does not exist: {}", self.root.display());
        }
        if !self.root.is_dir() {
            bail!("Root path is not a directory: {}", self.root.display());
        }
        self.root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", self.root.display()))?;
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub io_timeout: Duration,
    pub connect_timeout: Duration,
    pub progress: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(timeouts::IO_SECS),
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferryd.toml");
        std::fs::write(&path, "root = \"/srv/share\"\nio_timeout_secs = 3\n").unwrap();

        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/share"));
        assert_eq!(cfg.io_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.bind, ServerConfig::default().bind);
        assert_eq!(cfg.max_request_bytes, MAX_REQUEST_BYTES);
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "io_timeout_secs = \"soon\"\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn test_canonicalize_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();

        let cfg = ServerConfig::with_root(nested.join("../a/.")).canonicalize_root().unwrap();
        assert_eq!(cfg.root, nested.canonicalize().unwrap());

        assert!(ServerConfig::with_root(dir.path().join("missing"))
            .canonicalize_root()
            .is_err());

        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert!(ServerConfig::with_root(file).canonicalize_root().is_err());
    }
}
