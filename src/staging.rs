//! Local file access for transfers: sized reads and staged, atomic writes.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Prefix of in-flight upload files inside the destination directory.
pub const STAGING_PREFIX: &str = ".ferry-";

/// Whether a directory entry is an in-flight staged upload.
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(".part")
}

/// Open a regular file for reading and report its length.
pub async fn open_source(path: &Path) -> io::Result<(File, u64)> {
    let file = File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ));
    }
    Ok((file, meta.len()))
}

/// A file being written next to its final destination.
///
/// Dropping it without calling [`StagedFile::commit`] deletes the staged
/// data, so nothing ever appears at the target path unless committed.
pub struct StagedFile {
    file: File,
    temp: tempfile::TempPath,
    target: PathBuf,
}

impl StagedFile {
    /// Stage in the target's parent directory so the commit is a rename.
    pub fn create_for(target: &Path) -> io::Result<Self> {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let named = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".part")
            .tempfile_in(parent)?;
        let (file, temp) = named.into_parts();
        Ok(Self {
            file: File::from_std(file),
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn staged_path(&self) -> &Path {
        &self.temp
    }

    pub fn writer(&mut self) -> &mut File {
        &mut self.file
    }

    /// Publish the staged data at the target path.
    ///
    /// Fails with `AlreadyExists` if something was created at the target
    /// since staging began; the staged data is discarded in that case.
    pub async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        let target = self.target;
        self.temp
            .persist_noclobber(&target)
            .map_err(|e| e.error)
    }
}
