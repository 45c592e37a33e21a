//! Shared protocol logic for both the server and the client
//!
//! Path sandboxing and control-message framing. Both are independent of
//! the socket type so they can be driven from tests over in-memory pipes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{CodecError, RequestError};
use crate::protocol::SENTINEL;

/// A path proven to lie under the served root (or to be the root itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxedPath {
    path: PathBuf,
    is_root: bool,
}

impl SandboxedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }
}

impl AsRef<Path> for SandboxedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Symlinks followed while resolving one request before it is refused
const MAX_LINK_HOPS: usize = 40;

enum Step {
    Up,
    Name(OsString),
}

/// Queue the components of `path` so that popping yields them in order.
fn push_steps(pending: &mut Vec<Step>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::ParentDir => pending.push(Step::Up),
            Component::Normal(name) => pending.push(Step::Name(name.to_os_string())),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
}

/// Resolve a client-supplied path under `root`.
///
/// `root` must already be canonical. The request is lower-cased, leading
/// separators are stripped so it is always root-relative, and the result
/// is resolved like realpath(3): every symlink met along the way is
/// expanded (its target need not exist), `..` is applied to what has been
/// resolved so far, and any missing tail is appended lexically. The result
/// must equal `root` or lie beneath it, compared component-wise.
pub fn normalize_under_root(root: &Path, requested: &str) -> Result<SandboxedPath, RequestError> {
    if requested.contains('\0') {
        return Err(RequestError::Sandbox("path contains NUL byte".into()));
    }

    let lowered = requested.to_lowercase();
    let relative = Path::new(
        lowered.trim_start_matches(|c| c == '/' || c == std::path::MAIN_SEPARATOR),
    );
    // Only reachable for a Windows drive prefix after stripping
    if relative.has_root() || relative.is_absolute() {
        return Err(RequestError::Sandbox(format!(
            "path {requested:?} is not root-relative"
        )));
    }

    let mut pending = Vec::new();
    push_steps(&mut pending, relative);

    let mut resolved = root.to_path_buf();
    let mut hops = 0;
    while let Some(step) = pending.pop() {
        let name = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Name(name) => name,
        };
        resolved.push(&name);
        let is_link = std::fs::symlink_metadata(&resolved)
            .map(|md| md.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            continue;
        }

        hops += 1;
        if hops > MAX_LINK_HOPS {
            return Err(RequestError::Sandbox(format!(
                "too many levels of symbolic links in {requested:?}"
            )));
        }
        let target = std::fs::read_link(&resolved).map_err(|e| {
            RequestError::Sandbox(format!("cannot resolve {requested:?}: {e}"))
        })?;
        resolved.pop();
        if target.has_root() {
            resolved = target
                .components()
                .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
                .collect();
        }
        push_steps(&mut pending, &target);
    }

    if !resolved.starts_with(root) {
        return Err(RequestError::Sandbox(
            "I do not take kindly to your jailbreak attempt.".into(),
        ));
    }

    let is_root = resolved == root;
    Ok(SandboxedPath { path: resolved, is_root })
}

/// Serialize one message followed by the sentinel byte.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = serde_json::to_vec(msg)?;
    out.push(SENTINEL);
    Ok(out)
}

/// Accumulate bytes until the sentinel and return everything before it.
///
/// Each read is bounded by `io_timeout`. Bytes after the sentinel are
/// discarded: a control connection carries exactly one message each way.
pub async fn read_message<R>(
    reader: &mut R,
    io_timeout: Duration,
    max_len: usize,
) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut msg = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match timeout(io_timeout, reader.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => return Err(CodecError::Timeout(io_timeout)),
        };
        if n == 0 {
            return Err(CodecError::Closed);
        }
        if let Some(pos) = buf[..n].iter().position(|&b| b == SENTINEL) {
            if msg.len() + pos > max_len {
                return Err(CodecError::TooLarge(max_len));
            }
            msg.extend_from_slice(&buf[..pos]);
            return Ok(msg);
        }
        msg.extend_from_slice(&buf[..n]);
        if msg.len() > max_len {
            return Err(CodecError::TooLarge(max_len));
        }
    }
}

/// Read one message and parse it as `T`.
pub async fn read_document<R, T>(
    reader: &mut R,
    io_timeout: Duration,
    max_len: usize,
) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let bytes = read_message(reader, io_timeout, max_len).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write one framed message and flush it.
pub async fn write_message<W, T>(writer: &mut W, msg: &T, io_timeout: Duration) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_message(msg)?;
    match timeout(io_timeout, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    {
        Ok(res) => Ok(res?),
        Err(_) => Err(CodecError::Timeout(io_timeout)),
    }
}
