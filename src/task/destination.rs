//! Destination addressing: a symbolic base directory plus a relative path.
//!
//! Tasks never carry absolute paths; they name one of a few well-known base
//! directories and a relative directory/filename under it. Resolution to an
//! absolute path is a capability (`BaseDirResolver`) so tests and embedders
//! can redirect everything under a sandbox root. The default resolver maps to
//! XDG directories, same as the rest of the crate's on-disk state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TransferError;

/// Symbolic base directory tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseDir {
    /// Final download artifacts.
    Downloads,
    /// Long-lived crate state.
    State,
    /// Rebuildable data; chunk spool files live here.
    Cache,
    /// Scratch space, may be cleared by the OS.
    Temp,
}

/// Where a task's final file lands: base tag + relative directory + filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub base_dir: BaseDir,
    /// Relative directory under the base; empty means the base itself.
    #[serde(default)]
    pub directory: String,
    pub filename: String,
}

impl Destination {
    pub fn new(base_dir: BaseDir, directory: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            base_dir,
            directory: directory.into(),
            filename: filename.into(),
        }
    }
}

/// Capability that turns a symbolic base directory into an absolute path.
pub trait BaseDirResolver: Send + Sync {
    fn resolve_base(&self, base: BaseDir) -> Result<PathBuf, TransferError>;

    /// Absolute path for a destination: base / directory / filename.
    fn resolve(&self, dest: &Destination) -> Result<PathBuf, TransferError> {
        let mut path = self.resolve_base(dest.base_dir)?;
        if !dest.directory.is_empty() {
            path.push(&dest.directory);
        }
        path.push(&dest.filename);
        Ok(path)
    }
}

/// Default resolver: XDG data/state/cache homes under the `fetchq` prefix,
/// and the system temp dir for `Temp`.
pub struct XdgResolver;

impl BaseDirResolver for XdgResolver {
    fn resolve_base(&self, base: BaseDir) -> Result<PathBuf, TransferError> {
        let dirs = xdg::BaseDirectories::with_prefix("fetchq")
            .map_err(|e| TransferError::Filesystem(e.to_string()))?;
        Ok(match base {
            BaseDir::Downloads => dirs.get_data_home().join("downloads"),
            BaseDir::State => dirs.get_state_home(),
            BaseDir::Cache => dirs.get_cache_home(),
            BaseDir::Temp => std::env::temp_dir().join("fetchq"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(PathBuf);

    impl BaseDirResolver for FixedResolver {
        fn resolve_base(&self, base: BaseDir) -> Result<PathBuf, TransferError> {
            Ok(match base {
                BaseDir::Downloads => self.0.join("downloads"),
                BaseDir::State => self.0.join("state"),
                BaseDir::Cache => self.0.join("cache"),
                BaseDir::Temp => self.0.join("tmp"),
            })
        }
    }

    #[test]
    fn resolve_joins_directory_and_filename() {
        let r = FixedResolver(PathBuf::from("/sandbox"));
        let d = Destination::new(BaseDir::Downloads, "isos", "debian.iso");
        assert_eq!(
            r.resolve(&d).unwrap(),
            PathBuf::from("/sandbox/downloads/isos/debian.iso")
        );
    }

    #[test]
    fn empty_directory_uses_base_directly() {
        let r = FixedResolver(PathBuf::from("/sandbox"));
        let d = Destination::new(BaseDir::Cache, "", "chunk.bin");
        assert_eq!(r.resolve(&d).unwrap(), PathBuf::from("/sandbox/cache/chunk.bin"));
    }

    #[test]
    fn destination_serde_roundtrip() {
        let d = Destination::new(BaseDir::Downloads, "a/b", "f.bin");
        let json = serde_json::to_string(&d).unwrap();
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
