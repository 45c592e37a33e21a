//! Shared protocol constants and control-channel documents for ferry

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::RequestError;

/// End-of-message marker on the control channel. JSON never emits a raw NUL.
pub const SENTINEL: u8 = 0;

/// Data channel read/write chunk size
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound on an unterminated control request (64KB)
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Upper bound on a response as read by the client; listings can be long
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

// Response status codes
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL: u16 = 500;
}

// Centralized timeout defaults shared by server and client
pub mod timeouts {
    // Per-read/accept deadline on both channels (secs)
    pub const IO_SECS: u64 = 10;

    // Client connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;
}

/// Wire form of a request. Every field is optional here so that missing
/// fields surface as a 400 naming the field rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A validated request. The command set is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List { path: String },
    Put { path: String, checksum: Checksum, size: u64 },
    Get { path: String },
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Request::List { .. } => "list",
            Request::Put { .. } => "put",
            Request::Get { .. } => "get",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Request::List { path } | Request::Put { path, .. } | Request::Get { path } => path,
        }
    }
}

fn required<T>(field: Option<T>, name: &str) -> Result<T, RequestError> {
    field.ok_or_else(|| RequestError::Malformed(format!("a {name} must be supplied")))
}

impl TryFrom<ControlRequest> for Request {
    type Error = RequestError;

    fn try_from(raw: ControlRequest) -> Result<Self, Self::Error> {
        let command = required(raw.command, "command")?.to_lowercase();
        match command.as_str() {
            "list" => Ok(Request::List { path: required(raw.path, "path")? }),
            "get" => Ok(Request::Get { path: required(raw.path, "path")? }),
            "put" => {
                let path = required(raw.path, "path")?;
                let checksum = required(raw.checksum, "checksum")?;
                let size = required(raw.size, "size")?;
                let checksum = checksum.parse::<Checksum>().map_err(|_| {
                    RequestError::Malformed(format!("checksum {checksum:?} is not a hex CRC-32"))
                })?;
                Ok(Request::Put { path, checksum, size })
            }
            _ => Err(RequestError::UnknownCommand(command)),
        }
    }
}

impl From<&Request> for ControlRequest {
    fn from(req: &Request) -> Self {
        let mut raw = ControlRequest {
            command: Some(req.command().to_string()),
            path: Some(req.path().to_string()),
            ..Default::default()
        };
        if let Request::Put { checksum, size, .. } = req {
            raw.checksum = Some(checksum.to_string());
            raw.size = Some(*size);
        }
        raw
    }
}

/// Wire form of a response. Exactly one is sent per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn listing(dirs: Vec<String>, files: Vec<String>) -> Self {
        Self {
            status: status::OK,
            dirs: Some(dirs),
            files: Some(files),
            ..Default::default()
        }
    }

    pub fn upload_ready(port: u16) -> Self {
        Self {
            status: status::OK,
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn download_ready(port: u16, size: u64, checksum: Checksum) -> Self {
        Self {
            status: status::OK,
            port: Some(port),
            size: Some(size),
            checksum: Some(checksum.to_string()),
            ..Default::default()
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

impl From<&RequestError> for ControlResponse {
    fn from(err: &RequestError) -> Self {
        ControlResponse::error(err.status(), err.to_string())
    }
}
