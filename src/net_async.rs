//! Async (Tokio) transport for the ferry daemon and client.
//!
//! The server side accepts control connections and runs one task per
//! session; each authorized transfer gets its own data channel task. The
//! client side mirrors the protocol from the initiating end.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tracing::{debug, info, warn};

    use crate::config::ServerConfig;
    use crate::dispatch::{Dispatched, Dispatcher};
    use crate::error::{CodecError, RequestError};
    use crate::logger::Logger;
    use crate::protocol::{ControlRequest, ControlResponse, Request};
    use crate::protocol_core::{read_message, write_message};

    pub async fn serve(config: ServerConfig, logger: Arc<dyn Logger>) -> Result<()> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        info!(
            bind = %config.bind,
            root = %config.root.display(),
            "ferryd listening"
        );
        serve_listener(listener, Arc::new(config), logger).await
    }

    /// Accept loop over an already bound listener. Never returns on its own;
    /// accept errors are logged and the loop continues.
    pub async fn serve_listener(
        listener: TcpListener,
        config: Arc<ServerConfig>,
        logger: Arc<dyn Logger>,
    ) -> Result<()> {
        let dispatcher = Dispatcher::new(config);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            debug!(%peer, "control connection accepted");

            // Spawn per-connection task.
            let dispatcher = dispatcher.clone();
            let logger = logger.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_session(stream, peer, &dispatcher, logger).await {
                    warn!(%peer, error = %e, "session failed");
                }
            });
        }
    }

    fn parse_request(bytes: &[u8]) -> Result<Request, RequestError> {
        let raw: ControlRequest = serde_json::from_slice(bytes)
            .map_err(|_| RequestError::Malformed("Your request could not be parsed.".into()))?;
        Request::try_from(raw)
    }

    /// One control connection: read a request, answer it, close.
    ///
    /// Returns once the response is sent; any data channel keeps running
    /// on its own task.
    pub async fn handle_session(
        mut stream: TcpStream,
        peer: SocketAddr,
        dispatcher: &Dispatcher,
        logger: Arc<dyn Logger>,
    ) -> Result<()> {
        let io_timeout = dispatcher.config().io_timeout();
        let max_len = dispatcher.config().max_request_bytes;

        let request = match read_message(&mut stream, io_timeout, max_len).await {
            Ok(bytes) => parse_request(&bytes),
            Err(CodecError::TooLarge(max)) => Err(RequestError::Malformed(format!(
                "Request exceeds {max} bytes."
            ))),
            Err(e) => {
                debug!(%peer, reason = %e, "request abandoned");
                return Ok(());
            }
        };

        let (command, path) = match &request {
            Ok(req) => (req.command(), req.path().to_string()),
            Err(_) => ("-", String::new()),
        };
        let outcome = match request {
            Ok(req) => dispatcher.dispatch(peer.ip(), &req).await,
            Err(e) => Err(e),
        };
        let response = match outcome {
            Ok(Dispatched { response, channel }) => {
                if let Some(channel) = channel {
                    channel.spawn(logger.clone());
                }
                response
            }
            Err(e) => ControlResponse::from(&e),
        };

        logger.request(peer.ip(), command, &path, response.status);
        if response.is_ok() {
            info!(%peer, command, path = %path, port = ?response.port, "request served");
        } else {
            info!(
                %peer,
                command,
                status = response.status,
                error = response.error.as_deref().unwrap_or(""),
                "request refused"
            );
        }

        write_message(&mut stream, &response, io_timeout)
            .await
            .context("send response")?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

pub mod client {
    use super::*;
    use anyhow::bail;
    use std::net::{IpAddr, SocketAddr};
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::checksum::{checksum_file, Checksum};
    use crate::config::ClientOptions;
    use crate::data_channel::{receive_verified, send_all};
    use crate::error::{ServerError, TransferError};
    use crate::progress::transfer_bar;
    use crate::protocol::{ControlRequest, ControlResponse, Request, MAX_RESPONSE_BYTES};
    use crate::protocol_core::{read_document, write_message};
    use crate::staging::{open_source, StagedFile};

    /// Directory listing as returned by the server. Order is not meaningful.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Listing {
        pub dirs: Vec<String>,
        pub files: Vec<String>,
    }

    pub async fn connect(host: &str, port: u16, opts: &ClientOptions) -> Result<TcpStream> {
        match timeout(opts.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("connect {}:{}", host, port)),
            Err(_) => bail!("connect {}:{} timed out", host, port),
        }
    }

    async fn connect_data(addr: SocketAddr, opts: &ClientOptions) -> Result<TcpStream> {
        match timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("connect data channel {}", addr)),
            Err(_) => bail!("connect data channel {} timed out", addr),
        }
    }

    /// Send one request and return the response with the server address
    /// the control connection actually reached. Non-200 becomes `ServerError`.
    async fn exchange(
        host: &str,
        port: u16,
        req: &Request,
        opts: &ClientOptions,
    ) -> Result<(ControlResponse, IpAddr)> {
        let mut stream = connect(host, port, opts).await?;
        let server = stream.peer_addr()?.ip();
        write_message(&mut stream, &ControlRequest::from(req), opts.io_timeout)
            .await
            .context("send request")?;
        let resp: ControlResponse = read_document(&mut stream, opts.io_timeout, MAX_RESPONSE_BYTES)
            .await
            .context("read response")?;
        if !resp.is_ok() {
            return Err(ServerError {
                status: resp.status,
                message: resp.error.unwrap_or_else(|| "Bad Request".to_string()),
            }
            .into());
        }
        Ok((resp, server))
    }

    pub async fn request(
        host: &str,
        port: u16,
        req: &Request,
        opts: &ClientOptions,
    ) -> Result<ControlResponse> {
        exchange(host, port, req, opts).await.map(|(resp, _)| resp)
    }

    pub async fn list(host: &str, port: u16, path: &str, opts: &ClientOptions) -> Result<Listing> {
        let req = Request::List { path: path.to_string() };
        let resp = request(host, port, &req, opts).await?;
        Ok(Listing {
            dirs: resp.dirs.unwrap_or_default(),
            files: resp.files.unwrap_or_default(),
        })
    }

    /// Upload `local` to `remote`. Returns the bytes sent.
    ///
    /// The server reports nothing after the data phase; this waits for it
    /// to close the data connection, which it does once the upload has
    /// been committed or discarded.
    pub async fn put(
        host: &str,
        port: u16,
        local: &Path,
        remote: &str,
        opts: &ClientOptions,
    ) -> Result<u64> {
        let (checksum, size) = checksum_file(local)
            .await
            .with_context(|| format!("read {}", local.display()))?;
        let (mut file, _) = open_source(local)
            .await
            .with_context(|| format!("open {}", local.display()))?;

        let req = Request::Put {
            path: remote.to_string(),
            checksum,
            size,
        };
        let (resp, server) = exchange(host, port, &req, opts).await?;
        let data_port = resp.port.context("response is missing a port")?;

        let mut data = connect_data(SocketAddr::new(server, data_port), opts).await?;
        let bar = transfer_bar(size, remote, opts.progress);
        let sent = send_all(&mut file, &mut data, opts.io_timeout, Some(&bar)).await;
        bar.finish_and_clear();
        let sent = sent.context("upload aborted")?;
        data.shutdown().await.context("close data channel")?;

        let mut buf = [0u8; 1];
        let _ = timeout(opts.io_timeout, data.read(&mut buf)).await;

        if sent != size {
            bail!(
                "{} changed during upload ({} of {} bytes sent)",
                local.display(),
                sent,
                size
            );
        }
        Ok(sent)
    }

    /// Download `remote` into `local`. Nothing is written at `local`
    /// unless the declared size and checksum match.
    pub async fn get(
        host: &str,
        port: u16,
        remote: &str,
        local: &Path,
        opts: &ClientOptions,
    ) -> Result<u64> {
        if tokio::fs::symlink_metadata(local).await.is_ok() {
            bail!("{} already exists", local.display());
        }

        let req = Request::Get { path: remote.to_string() };
        let (resp, server) = exchange(host, port, &req, opts).await?;
        let data_port = resp.port.context("response is missing a port")?;
        let size = resp.size.context("response is missing a size")?;
        let expected: Checksum = resp
            .checksum
            .as_deref()
            .context("response is missing a checksum")?
            .parse()
            .context("response checksum is not hex")?;

        let mut staged = StagedFile::create_for(local)
            .with_context(|| format!("create {}", local.display()))?;
        let mut data = connect_data(SocketAddr::new(server, data_port), opts).await?;
        let bar = transfer_bar(size, remote, opts.progress);
        let received =
            receive_verified(&mut data, staged.writer(), size, opts.io_timeout, Some(&bar)).await;
        bar.finish_and_clear();
        let actual = received.context("download aborted")?;

        if actual != expected {
            return Err(TransferError::ChecksumMismatch { expected, actual }.into());
        }
        staged
            .commit()
            .await
            .with_context(|| format!("write {}", local.display()))?;
        Ok(size)
    }
}
