//! Disk I/O for in-progress transfers.
//!
//! Transfers write into a `.part` file next to the final destination and are
//! atomically renamed on completion. Writes are offset-addressed
//! (pwrite-style) so a resumed transfer continues where the file left off and
//! the stitch phase can copy chunk files sequentially without seeking games.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::TransferError;

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the in-progress file: appends `.part` to the final path.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

/// Writer for an in-progress transfer file. Cheap to clone; each `write_at`
/// is independent and safe for concurrent use. The worker renames the file
/// onto its final path once the transfer completes.
#[derive(Clone)]
pub struct PartFile {
    file: Arc<File>,
}

impl PartFile {
    /// Create (truncate) a part file. If `size` is known, preallocate it:
    /// `posix_fallocate` on Unix for real block allocation, else `set_len`.
    pub fn create(path: &Path, size: Option<u64>) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::filesystem(&e))?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| TransferError::Filesystem(format!("create {}: {}", path.display(), e)))?;
        if let Some(size) = size {
            preallocate(&file, size)?;
        }
        Ok(PartFile {
            file: Arc::new(file),
        })
    }

    /// Open an existing part file for resume (no truncation).
    pub fn open_existing(path: &Path) -> Result<Self, TransferError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TransferError::Filesystem(format!("open {}: {}", path.display(), e)))?;
        Ok(PartFile {
            file: Arc::new(file),
        })
    }

    /// Write `data` at `offset` without moving a shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let n = self
            .file
            .write_at(data, offset)
            .map_err(|e| TransferError::filesystem(&e))?;
        if n != data.len() {
            return Err(TransferError::Filesystem(format!(
                "short write: {} of {}",
                n,
                data.len()
            )));
        }
        Ok(())
    }

    /// Non-Unix fallback: seek + write on a cloned handle. Not safe for
    /// concurrent writers.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file)
            .try_clone()
            .map_err(|e| TransferError::filesystem(&e))?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| TransferError::filesystem(&e))?;
        f.write_all(data).map_err(|e| TransferError::filesystem(&e))?;
        Ok(())
    }

    /// Bytes currently on disk (used when building resume data).
    pub fn len(&self) -> Result<u64, TransferError> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| TransferError::filesystem(&e))?
            .len())
    }

    /// Sync file data to disk. Call before the finishing rename for
    /// durability.
    pub fn sync(&self) -> Result<(), TransferError> {
        self.file.sync_all().map_err(|e| TransferError::filesystem(&e))
    }
}

fn preallocate(file: &File, size: u64) -> Result<(), TransferError> {
    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size).map_err(|e| TransferError::filesystem(&e))
}
