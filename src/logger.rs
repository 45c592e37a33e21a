use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use uuid::Uuid;

/// Transfer log sink. Data channel failures are never reported to the
/// peer, so this is where they stay observable.
pub trait Logger: Send + Sync {
    fn request(&self, _peer: IpAddr, _command: &str, _path: &str, _status: u16) {}
    fn committed(&self, _id: Uuid, _peer: IpAddr, _path: &Path, _bytes: u64) {}
    fn sent(&self, _id: Uuid, _peer: IpAddr, _path: &Path, _bytes: u64) {}
    fn aborted(&self, _id: Uuid, _peer: IpAddr, _path: &Path, _reason: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn request(&self, peer: IpAddr, command: &str, path: &str, status: u16) {
        self.line(&format!("REQUEST peer={peer} cmd={command} path={path:?} status={status}"));
    }
    fn committed(&self, id: Uuid, peer: IpAddr, path: &Path, bytes: u64) {
        self.line(&format!(
            "COMMIT id={id} peer={peer} path={} bytes={bytes}",
            path.display()
        ));
    }
    fn sent(&self, id: Uuid, peer: IpAddr, path: &Path, bytes: u64) {
        self.line(&format!(
            "SENT id={id} peer={peer} path={} bytes={bytes}",
            path.display()
        ));
    }
    fn aborted(&self, id: Uuid, peer: IpAddr, path: &Path, reason: &str) {
        self.line(&format!(
            "ABORT id={id} peer={peer} path={} reason={reason}",
            path.display()
        ));
    }
}
