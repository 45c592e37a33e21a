//! Transfer integrity checksum (CRC-32, zlib polynomial, seeded at 0)

use std::fmt;
use std::num::ParseIntError;
use std::path::Path;
use std::str::FromStr;

use tokio::io::AsyncReadExt;

use crate::protocol::CHUNK_SIZE;

/// A finalized CRC-32 value.
///
/// Rendered as lowercase hex without padding. Parsing accepts either case,
/// so comparison by value is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u32);

impl Checksum {
    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s.trim(), 16).map(Checksum)
    }
}

/// Incremental checksum over a byte stream, fed chunk by chunk in arrival order.
/// Chunk boundaries do not affect the result.
#[derive(Clone, Default)]
pub struct RollingChecksum {
    hasher: crc32fast::Hasher,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn value(&self) -> Checksum {
        Checksum(self.hasher.clone().finalize())
    }
}

/// Compute checksum for a whole buffer
#[cfg(test)]
pub(crate) fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut c = RollingChecksum::new();
    c.update(data);
    c.value()
}

/// Checksum and length of a local file, read in protocol-sized chunks.
pub async fn checksum_file(path: &Path) -> std::io::Result<(Checksum, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE * 64];
    let mut rolling = RollingChecksum::new();
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        rolling.update(&buf[..n]);
        len += n as u64;
    }
    Ok((rolling.value(), len))
}
