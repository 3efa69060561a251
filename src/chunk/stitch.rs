//! Reassembly of completed chunk spool files into the final destination.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::TransferError;
use crate::storage;

/// Concatenate `chunk_paths` (already sorted by starting byte) into `dest`
/// through a `.part` file and an atomic rename. A missing or unreadable chunk
/// file fails the stitch.
pub fn stitch(chunk_paths: &[PathBuf], dest: &Path) -> Result<(), TransferError> {
    let part = storage::part_path(dest);
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TransferError::Filesystem(format!("create {}: {}", parent.display(), e)))?;
    }
    let mut out = File::create(&part)
        .map_err(|e| TransferError::Filesystem(format!("create {}: {}", part.display(), e)))?;

    for path in chunk_paths {
        let mut input = File::open(path)
            .map_err(|e| TransferError::Filesystem(format!("open chunk {}: {}", path.display(), e)))?;
        io::copy(&mut input, &mut out)
            .map_err(|e| TransferError::Filesystem(format!("copy chunk {}: {}", path.display(), e)))?;
    }

    out.sync_all()
        .map_err(|e| TransferError::Filesystem(format!("sync {}: {}", part.display(), e)))?;
    drop(out);
    fs::rename(&part, dest).map_err(|e| {
        TransferError::Filesystem(format!("rename {} to {}: {}", part.display(), dest.display(), e))
    })
}

/// Delete chunk spool files and their directory. Cleanup never fails; leftover
/// files are only logged.
pub fn remove_spool_files(chunk_paths: &[PathBuf]) {
    let mut dirs: Vec<&Path> = Vec::new();
    for path in chunk_paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "spool cleanup failed: {}", e);
            }
        }
        if let Some(dir) = path.parent() {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    for dir in dirs {
        // Only removes the directory once it is empty.
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stitch_reassembles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("out.bin.chunks");
        fs::create_dir_all(&spool).unwrap();
        let paths = vec![
            spool.join("0000.chunk"),
            spool.join("0001.chunk"),
            spool.join("0002.chunk"),
        ];
        fs::write(&paths[0], b"hello ").unwrap();
        fs::write(&paths[1], b"chunked ").unwrap();
        fs::write(&paths[2], b"world").unwrap();

        let dest = dir.path().join("out.bin");
        stitch(&paths, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello chunked world");
        assert!(!storage::part_path(&dest).exists());
    }

    #[test]
    fn missing_chunk_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("absent.chunk")];
        let dest = dir.path().join("out.bin");
        let err = stitch(&paths, &dest).unwrap_err();
        assert!(matches!(err, TransferError::Filesystem(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn cleanup_tolerates_missing_files_and_removes_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("x.chunks");
        fs::create_dir_all(&spool).unwrap();
        let existing = spool.join("0000.chunk");
        fs::write(&existing, b"data").unwrap();
        let missing = spool.join("0001.chunk");

        remove_spool_files(&[existing.clone(), missing]);
        assert!(!existing.exists());
        assert!(!spool.exists());
    }
}
