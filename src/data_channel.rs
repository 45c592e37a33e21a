//! Single-use data channels for bulk transfers.
//!
//! The server binds an ephemeral listener per authorized `put`/`get`,
//! reports the port in the control response, then accepts exactly one
//! connection from the peer that made the request. Sources other than that
//! peer are closed and the channel keeps waiting. States:
//!
//! ```text
//! Listening -> Awaiting-Peer -> Transferring -> Committed | Aborted
//! ```
//!
//! The chunk loops ([`receive_verified`], [`send_all`]) are shared with the
//! client, which runs the opposite end of each transfer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::checksum::{Checksum, RollingChecksum};
use crate::error::TransferError;
use crate::logger::Logger;
use crate::protocol::CHUNK_SIZE;
use crate::protocol_core::SandboxedPath;
use crate::staging::StagedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Everything the server knows about one authorized transfer.
#[derive(Debug, Clone)]
pub struct DataChannelDescriptor {
    pub id: Uuid,
    pub bound_port: u16,
    /// Only connections from this address may use the channel
    pub peer: IpAddr,
    pub direction: Direction,
    pub expected_size: u64,
    /// Declared by the uploader; unused for downloads
    pub expected_checksum: Option<Checksum>,
    pub target: PathBuf,
}

enum Payload {
    Upload { staged: StagedFile, expected: Checksum },
    Download { source: File },
}

pub struct DataChannel {
    descriptor: DataChannelDescriptor,
    listener: TcpListener,
    payload: Payload,
    io_timeout: Duration,
}

impl DataChannel {
    /// Listen for an upload to `target`. The staging file is created now so
    /// an unwritable destination fails the request instead of the transfer.
    pub async fn open_upload(
        peer: IpAddr,
        target: &SandboxedPath,
        size: u64,
        checksum: Checksum,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let staged = StagedFile::create_for(target.as_path())?;
        let (listener, port) = bind_for(peer).await?;
        debug!(port, staged = %staged.staged_path().display(), "upload staged");
        Ok(Self {
            descriptor: DataChannelDescriptor {
                id: Uuid::new_v4(),
                bound_port: port,
                peer,
                direction: Direction::Upload,
                expected_size: size,
                expected_checksum: Some(checksum),
                target: target.as_path().to_path_buf(),
            },
            listener,
            payload: Payload::Upload { staged, expected: checksum },
            io_timeout,
        })
    }

    /// Listen for a download of an already opened source file.
    pub async fn open_download(
        peer: IpAddr,
        source_path: &SandboxedPath,
        source: File,
        size: u64,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let (listener, port) = bind_for(peer).await?;
        Ok(Self {
            descriptor: DataChannelDescriptor {
                id: Uuid::new_v4(),
                bound_port: port,
                peer,
                direction: Direction::Download,
                expected_size: size,
                expected_checksum: None,
                target: source_path.as_path().to_path_buf(),
            },
            listener,
            payload: Payload::Download { source },
            io_timeout,
        })
    }

    pub fn descriptor(&self) -> &DataChannelDescriptor {
        &self.descriptor
    }

    pub fn port(&self) -> u16 {
        self.descriptor.bound_port
    }

    /// Drive the channel to completion. Returns the bytes transferred.
    ///
    /// An upload is committed only after exactly `expected_size` bytes and
    /// a matching checksum; every error path drops the staged data.
    pub async fn run(self) -> Result<u64, TransferError> {
        let DataChannel {
            descriptor,
            listener,
            payload,
            io_timeout,
        } = self;

        debug!(state = "awaiting-peer", "data channel listening");
        let mut stream = accept_from(&listener, descriptor.peer, io_timeout).await?;
        drop(listener);
        debug!(state = "transferring", "data channel peer connected");

        match payload {
            Payload::Upload { mut staged, expected } => {
                let actual = receive_verified(
                    &mut stream,
                    staged.writer(),
                    descriptor.expected_size,
                    io_timeout,
                    None,
                )
                .await?;
                if actual != expected {
                    return Err(TransferError::ChecksumMismatch { expected, actual });
                }
                staged.commit().await.map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        TransferError::Exists(descriptor.target.display().to_string())
                    } else {
                        TransferError::Io(e)
                    }
                })?;
                Ok(descriptor.expected_size)
            }
            Payload::Download { mut source } => {
                let sent = send_all(&mut source, &mut stream, io_timeout, None).await?;
                let _ = timeout(io_timeout, stream.shutdown()).await;
                Ok(sent)
            }
        }
    }

    /// Run the channel on its own task, recording the outcome.
    pub fn spawn(self, logger: Arc<dyn Logger>) -> JoinHandle<Result<u64, TransferError>> {
        let d = self.descriptor.clone();
        let span = tracing::info_span!(
            "data_channel",
            id = %d.id,
            port = d.bound_port,
            peer = %d.peer,
            direction = ?d.direction,
        );
        tokio::spawn(
            async move {
                let result = self.run().await;
                match (&result, d.direction) {
                    (Ok(bytes), Direction::Upload) => {
                        info!(path = %d.target.display(), bytes, "upload committed");
                        logger.committed(d.id, d.peer, &d.target, *bytes);
                    }
                    (Ok(bytes), Direction::Download) => {
                        info!(path = %d.target.display(), bytes, "download sent");
                        logger.sent(d.id, d.peer, &d.target, *bytes);
                    }
                    (Err(e), _) => {
                        warn!(path = %d.target.display(), error = %e, "transfer aborted");
                        logger.aborted(d.id, d.peer, &d.target, &e.to_string());
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Ephemeral listener on all interfaces of the peer's address family.
async fn bind_for(peer: IpAddr) -> io::Result<(TcpListener, u16)> {
    let any: IpAddr = match peer {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let listener = TcpListener::bind(SocketAddr::new(any, 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

/// Accept until a connection from `peer` arrives, closing any other.
///
/// The deadline covers the whole wait; rejected sources do not extend it.
pub async fn accept_from(
    listener: &TcpListener,
    peer: IpAddr,
    io_timeout: Duration,
) -> Result<TcpStream, TransferError> {
    let deadline = Instant::now() + io_timeout;
    loop {
        let (stream, addr) = match timeout_at(deadline, listener.accept()).await {
            Ok(res) => res?,
            Err(_) => return Err(TransferError::Timeout(io_timeout)),
        };
        if same_host(addr.ip(), peer) {
            let _ = stream.set_nodelay(true);
            return Ok(stream);
        }
        warn!(expected = %peer, actual = %addr, "data channel used by another host, closing");
        drop(stream);
    }
}

async fn read_timed<R>(reader: &mut R, buf: &mut [u8], io_timeout: Duration) -> Result<usize, TransferError>
where
    R: AsyncRead + Unpin,
{
    match timeout(io_timeout, reader.read(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TransferError::Timeout(io_timeout)),
    }
}

async fn write_timed<W>(writer: &mut W, buf: &[u8], io_timeout: Duration) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(io_timeout, writer.write_all(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TransferError::Timeout(io_timeout)),
    }
}

/// Receive exactly `expected_size` bytes into `sink`, then require end of
/// stream. Returns the checksum of what was received.
///
/// Aborts if the peer closes early, sends more than declared, or stalls
/// past `io_timeout` on any read.
pub async fn receive_verified<R, W>(
    reader: &mut R,
    sink: &mut W,
    expected_size: u64,
    io_timeout: Duration,
    progress: Option<&ProgressBar>,
) -> Result<Checksum, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = expected_size;
    let mut rolling = RollingChecksum::new();

    while remaining > 0 {
        let n = read_timed(reader, &mut buf, io_timeout).await?;
        if n == 0 {
            return Err(TransferError::PeerDropped {
                received: expected_size - remaining,
                expected: expected_size,
            });
        }
        if n as u64 > remaining {
            return Err(TransferError::Overrun { expected: expected_size });
        }
        rolling.update(&buf[..n]);
        write_timed(sink, &buf[..n], io_timeout).await?;
        remaining -= n as u64;
        if let Some(pb) = progress {
            pb.inc(n as u64);
        }
    }

    // Declared size reached: the sender must now close.
    if read_timed(reader, &mut buf[..1], io_timeout).await? != 0 {
        return Err(TransferError::Overrun { expected: expected_size });
    }

    sink.flush().await?;
    Ok(rolling.value())
}

/// Copy `source` to `sink` in chunks until end of file.
pub async fn send_all<R, W>(
    source: &mut R,
    sink: &mut W,
    io_timeout: Duration,
    progress: Option<&ProgressBar>,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_timed(sink, &buf[..n], io_timeout).await?;
        sent += n as u64;
        if let Some(pb) = progress {
            pb.inc(n as u64);
        }
    }
    match timeout(io_timeout, sink.flush()).await {
        Ok(res) => res?,
        Err(_) => return Err(TransferError::Timeout(io_timeout)),
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::protocol_core::normalize_under_root;
    use std::path::Path;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    async fn upload_channel(
        root: &Path,
        name: &str,
        size: u64,
        checksum: Checksum,
    ) -> (DataChannel, PathBuf) {
        let target = normalize_under_root(root, name).unwrap();
        let path = target.as_path().to_path_buf();
        let channel = DataChannel::open_upload(LOCALHOST, &target, size, checksum, TIMEOUT)
            .await
            .unwrap();
        (channel, path)
    }

    async fn send_raw(port: u16, bytes: &[u8]) {
        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // The server may reset the connection once it has seen enough
        let _ = s.write_all(bytes).await;
        let _ = s.shutdown().await;
        // Hold the socket until the server side closes it
        let mut sink = Vec::new();
        let _ = s.read_to_end(&mut sink).await;
    }

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_upload_commits_exact_bytes() {
        let (_dir, root) = root();
        let data = payload(5000);
        let (channel, target) =
            upload_channel(&root, "up.bin", data.len() as u64, checksum_bytes(&data)).await;
        assert_eq!(channel.descriptor().direction, Direction::Upload);
        assert_ne!(channel.port(), 0);

        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, &data).await;

        assert_eq!(task.await.unwrap().unwrap(), 5000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        // No staging leftovers
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let (_dir, root) = root();
        let (channel, target) = upload_channel(&root, "empty", 0, checksum_bytes(b"")).await;
        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, b"").await;

        task.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_upload_one_byte_short_is_aborted() {
        let (_dir, root) = root();
        let data = payload(3000);
        let (channel, target) =
            upload_channel(&root, "short.bin", data.len() as u64, checksum_bytes(&data)).await;
        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, &data[..data.len() - 1]).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::PeerDropped { received: 2999, expected: 3000 }));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_one_byte_long_is_aborted() {
        let (_dir, root) = root();
        let data = payload(2048);
        let declared = &data[..2047];
        let (channel, target) =
            upload_channel(&root, "long.bin", 2047, checksum_bytes(declared)).await;
        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, &data).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Overrun { expected: 2047 }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_upload_checksum_mismatch_is_aborted() {
        let (_dir, root) = root();
        let data = payload(1500);
        let wrong = Checksum::from_value(checksum_bytes(&data).value() ^ 1);
        let (channel, target) = upload_channel(&root, "bad.bin", data.len() as u64, wrong).await;
        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, &data).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_loses_race_without_clobbering() {
        let (_dir, root) = root();
        let data = payload(10);
        let (channel, target) =
            upload_channel(&root, "race.txt", 10, checksum_bytes(&data)).await;
        std::fs::write(&target, b"winner").unwrap();

        let port = channel.port();
        let task = tokio::spawn(channel.run());
        send_raw(port, &data).await;

        assert!(matches!(task.await.unwrap(), Err(TransferError::Exists(_))));
        assert_eq!(std::fs::read(&target).unwrap(), b"winner");
    }

    #[tokio::test]
    async fn test_no_peer_times_out() {
        let (_dir, root) = root();
        let target = normalize_under_root(&root, "never").unwrap();
        let channel = DataChannel::open_upload(
            LOCALHOST,
            &target,
            1,
            Checksum::from_value(0),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = channel.run().await.unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
        assert!(!target.as_path().exists());
    }

    #[tokio::test]
    async fn test_download_streams_file_then_closes() {
        let (_dir, root) = root();
        let data = payload(4097);
        std::fs::write(root.join("src.bin"), &data).unwrap();
        let source_path = normalize_under_root(&root, "src.bin").unwrap();
        let (source, len) = crate::staging::open_source(source_path.as_path()).await.unwrap();

        let channel = DataChannel::open_download(LOCALHOST, &source_path, source, len, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(channel.descriptor().expected_checksum, None);
        let port = channel.port();
        let task = tokio::spawn(channel.run());

        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut received = Vec::new();
        let checksum = receive_verified(&mut s, &mut received, len, TIMEOUT, None)
            .await
            .unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 4097);
        assert_eq!(received, data);
        assert_eq!(checksum, checksum_bytes(&data));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_foreign_peer_is_refused_and_channel_stays_open() {
        let (_dir, root) = root();
        let data = payload(100);
        let (channel, target) =
            upload_channel(&root, "guarded.bin", 100, checksum_bytes(&data)).await;
        let port = channel.port();
        let task = tokio::spawn(channel.run());

        // Same machine, different loopback source address
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
        let mut intruder = socket
            .connect(SocketAddr::new(LOCALHOST, port))
            .await
            .unwrap();
        let _ = intruder.write_all(b"junk").await;
        let mut buf = [0u8; 8];
        let n = intruder.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "intruder connection must be closed");
        assert!(!task.is_finished());

        send_raw(port, &data).await;
        assert_eq!(task.await.unwrap().unwrap(), 100);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_receive_verified_stalled_sender_times_out() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(b"abc").await.unwrap();
        let mut sink = Vec::new();
        let err = receive_verified(&mut rx, &mut sink, 10, Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
        drop(tx);
    }

    #[test]
    fn test_same_host_canonicalizes_mapped_v4() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert!(same_host(mapped, LOCALHOST));
        assert!(!same_host("127.0.0.2".parse().unwrap(), LOCALHOST));
    }
}
