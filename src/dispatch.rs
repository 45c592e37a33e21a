//! Server-side command handlers: `list`, `put`, `get`.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::checksum::{checksum_file, Checksum};
use crate::config::ServerConfig;
use crate::data_channel::DataChannel;
use crate::error::RequestError;
use crate::protocol::{ControlResponse, Request};
use crate::protocol_core::{normalize_under_root, SandboxedPath};
use crate::staging::{is_staging_name, open_source};

/// A handled request: the response to send, plus the data channel to run
/// for transfers. The channel is already listening on the reported port.
pub struct Dispatched {
    pub response: ControlResponse,
    pub channel: Option<DataChannel>,
}

impl Dispatched {
    fn reply(response: ControlResponse) -> Self {
        Self { response, channel: None }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<ServerConfig>,
}

impl Dispatcher {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn resolve(&self, path: &str) -> Result<SandboxedPath, RequestError> {
        normalize_under_root(&self.config.root, path)
    }

    pub async fn dispatch(&self, peer: IpAddr, request: &Request) -> Result<Dispatched, RequestError> {
        match request {
            Request::List { path } => self.list(path).await.map(Dispatched::reply),
            Request::Put { path, checksum, size } => {
                let channel = self.put(peer, path, *checksum, *size).await?;
                Ok(Dispatched {
                    response: ControlResponse::upload_ready(channel.port()),
                    channel: Some(channel),
                })
            }
            Request::Get { path } => {
                let (channel, checksum) = self.get(peer, path).await?;
                let size = channel.descriptor().expected_size;
                Ok(Dispatched {
                    response: ControlResponse::download_ready(channel.port(), size, checksum),
                    channel: Some(channel),
                })
            }
        }
    }

    /// Immediate children split into directories and files. Entries that
    /// are neither (dangling links, sockets) and staged uploads are omitted.
    async fn list(&self, path: &str) -> Result<ControlResponse, RequestError> {
        let dir = self.resolve(path)?;
        let not_found = |_| RequestError::NotFound("No such directory.".into());

        let mut rd = tokio::fs::read_dir(dir.as_path()).await.map_err(not_found)?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(not_found)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_staging_name(&name) {
                continue;
            }
            match tokio::fs::metadata(entry.path()).await {
                Ok(md) if md.is_dir() => dirs.push(name),
                Ok(md) if md.is_file() => files.push(name),
                _ => {}
            }
        }
        debug!(path = %dir.as_path().display(), dirs = dirs.len(), files = files.len(), "listed");
        Ok(ControlResponse::listing(dirs, files))
    }

    async fn put(
        &self,
        peer: IpAddr,
        path: &str,
        checksum: Checksum,
        size: u64,
    ) -> Result<DataChannel, RequestError> {
        let target = self.resolve(path)?;
        let reserved = target
            .as_path()
            .file_name()
            .map(|name| is_staging_name(&name.to_string_lossy()))
            .unwrap_or(false);
        if reserved {
            return Err(RequestError::Conflict("That file name is reserved.".into()));
        }
        if target.is_root() || tokio::fs::symlink_metadata(target.as_path()).await.is_ok() {
            return Err(RequestError::Conflict("A file with that name already exists.".into()));
        }
        let parent_is_dir = match target.as_path().parent() {
            Some(parent) => tokio::fs::metadata(parent).await.map(|m| m.is_dir()).unwrap_or(false),
            None => false,
        };
        if !parent_is_dir {
            return Err(RequestError::NotFound("No such directory.".into()));
        }

        DataChannel::open_upload(peer, &target, size, checksum, self.config.io_timeout())
            .await
            .map_err(|e| RequestError::Internal(format!("Could not open data channel: {e}")))
    }

    async fn get(&self, peer: IpAddr, path: &str) -> Result<(DataChannel, Checksum), RequestError> {
        let source = self.resolve(path)?;
        let is_file = tokio::fs::metadata(source.as_path())
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(RequestError::NotFound("No such file.".into()));
        }

        let internal = |e: std::io::Error| RequestError::Internal(format!("Could not read file: {e}"));
        let (checksum, size) = checksum_file(source.as_path()).await.map_err(internal)?;
        let (file, _) = open_source(source.as_path()).await.map_err(internal)?;

        let channel =
            DataChannel::open_download(peer, &source, file, size, self.config.io_timeout())
                .await
                .map_err(|e| RequestError::Internal(format!("Could not open data channel: {e}")))?;
        Ok((channel, checksum))
    }
}
