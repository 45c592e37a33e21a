//! Shared CLI helpers and small reusable Clap fragments

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::{ClientOptions, ServerConfig};

/// Daemon options for ferryd
#[derive(Clone, Debug, Parser)]
#[command(name = "ferryd", version, about = "Serve a directory tree over the ferry protocol")]
pub struct DaemonOpts {
    /// Control port to listen on
    pub port: u16,

    /// Interface address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Root directory to serve (default: ./files)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file; command-line flags take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append transfer outcomes to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Per-operation I/O timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut cfg = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        cfg.bind = bind_addr(&self.host, self.port);
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if let Some(log_file) = &self.log_file {
            cfg.log_file = Some(log_file.clone());
        }
        if let Some(secs) = self.timeout {
            cfg.io_timeout_secs = secs;
        }
        cfg.canonicalize_root()
    }
}

fn bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Client options for ferry
#[derive(Clone, Debug, Parser)]
#[command(name = "ferry", version, about = "Put, get and list files on a ferryd server")]
pub struct ClientOpts {
    /// Server host name or address
    pub host: String,

    /// Server control port
    pub port: u16,

    #[command(subcommand)]
    pub command: ClientCommand,

    /// Per-operation I/O timeout in seconds
    #[arg(long, global = true, default_value_t = crate::protocol::timeouts::IO_SECS)]
    pub timeout: u64,

    /// Show a progress bar for transfers
    #[arg(long, global = true)]
    pub progress: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List a remote directory
    List {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Upload a local file (remote name defaults to the local file name)
    Put { local: PathBuf, remote: Option<String> },
    /// Download a remote file (local name defaults to the remote file name)
    Get { remote: String, local: Option<PathBuf> },
}

impl ClientOpts {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            io_timeout: Duration::from_secs(self.timeout.max(1)),
            progress: self.progress,
            ..Default::default()
        }
    }
}

/// Remote name for `put` when none is given.
pub fn default_remote(local: &Path) -> Result<String> {
    match local.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("cannot derive a remote name from {}", local.display()),
    }
}

/// Local name for `get` when none is given.
pub fn default_local(remote: &str) -> Result<PathBuf> {
    match Path::new(remote).file_name() {
        Some(name) => Ok(PathBuf::from(name)),
        None => bail!("cannot derive a local name from {:?}", remote),
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definitions_are_consistent() {
        DaemonOpts::command().debug_assert();
        ClientOpts::command().debug_assert();
    }

    #[test]
    fn test_client_list_defaults_to_root() {
        let opts = ClientOpts::try_parse_from(["ferry", "localhost", "9040", "list"]).unwrap();
        assert!(matches!(opts.command, ClientCommand::List { ref path } if path == "/"));
        assert_eq!(opts.client_options().io_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_client_put_and_get_args() {
        let opts = ClientOpts::try_parse_from([
            "ferry", "host", "1", "put", "local.txt", "remote.txt", "--progress",
        ])
        .unwrap();
        assert!(opts.progress);
        match opts.command {
            ClientCommand::Put { local, remote } => {
                assert_eq!(local, PathBuf::from("local.txt"));
                assert_eq!(remote.as_deref(), Some("remote.txt"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let opts = ClientOpts::try_parse_from(["ferry", "host", "1", "get", "a/b.txt"]).unwrap();
        assert!(matches!(opts.command, ClientCommand::Get { local: None, .. }));
    }

    #[test]
    fn test_malformed_client_input_is_rejected() {
        assert!(ClientOpts::try_parse_from(["ferry", "host", "notaport", "list"]).is_err());
        assert!(ClientOpts::try_parse_from(["ferry", "host", "1", "delete", "x"]).is_err());
        assert!(ClientOpts::try_parse_from(["ferry", "host", "1", "put"]).is_err());
        assert!(ClientOpts::try_parse_from(["ferry", "host"]).is_err());
    }

    #[test]
    fn test_daemon_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("ferryd.toml");
        std::fs::write(&cfg_path, "io_timeout_secs = 30\nmax_request_bytes = 512\n").unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let cfg_arg = cfg_path.to_string_lossy().into_owned();

        let opts = DaemonOpts::try_parse_from([
            "ferryd", "7000", "--root", &root, "--config", &cfg_arg, "--timeout", "4",
        ])
        .unwrap();
        let cfg = opts.server_config().unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:7000");
        assert_eq!(cfg.io_timeout_secs, 4);
        assert_eq!(cfg.max_request_bytes, 512);
        assert_eq!(cfg.root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_bind_addr_brackets_ipv6() {
        assert_eq!(bind_addr("::", 9), "[::]:9");
        assert_eq!(bind_addr("127.0.0.1", 9), "127.0.0.1:9");
    }

    #[test]
    fn test_default_names() {
        assert_eq!(default_remote(Path::new("dir/report.pdf")).unwrap(), "report.pdf");
        assert_eq!(default_local("a/b.txt").unwrap(), PathBuf::from("b.txt"));
        assert!(default_local("a/..").is_err());
        assert!(default_remote(Path::new("/")).is_err());
    }
}
