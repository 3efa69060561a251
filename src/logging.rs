//! Logging init: file under the XDG state dir, or stderr.
//!
//! Embedders that already own a `tracing` subscriber should skip this module
//! entirely; the `_with` variants exist for hosts that want the file layout
//! but their own filter.

use anyhow::Result;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Writer that is either a file or stderr (used when file clone fails).
enum FileOrStderr {
    File(std::fs::File),
    Stderr,
}

impl io::Write for FileOrStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileOrStderr::File(f) => f.write(buf),
            FileOrStderr::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileOrStderr::File(f) => f.flush(),
            FileOrStderr::Stderr => io::stderr().lock().flush(),
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fetchq=debug"))
}

fn open_log_file() -> Result<(std::fs::File, PathBuf)> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchq")?;
    let log_dir = xdg_dirs.get_state_home();
    fs::create_dir_all(&log_dir)?;
    let path = log_dir.join("fetchq.log");
    let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Initialize structured logging to `~/.local/state/fetchq/fetchq.log` with
/// the default filter (`RUST_LOG` wins). On failure (e.g. log dir
/// unwritable), returns Err so the caller can fall back to
/// `init_logging_stderr`.
pub fn init_logging() -> Result<()> {
    init_logging_with(default_filter())
}

/// Same as `init_logging` but with a caller-supplied filter.
pub fn init_logging_with(filter: EnvFilter) -> Result<()> {
    let (file, path) = open_log_file()?;

    struct FileMakeWriter(std::fs::File);

    impl<'a> MakeWriter<'a> for FileMakeWriter {
        type Writer = FileOrStderr;

        fn make_writer(&'a self) -> Self::Writer {
            self.0
                .try_clone()
                .map(FileOrStderr::File)
                .unwrap_or(FileOrStderr::Stderr)
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(FileMakeWriter(file)))
        .with_ansi(false)
        .init();

    tracing::info!("fetchq logging initialized at {}", path.display());
    Ok(())
}

/// Initialize logging to stderr only (no file). Use when `init_logging`
/// fails so the host process doesn't crash over an unwritable log directory.
pub fn init_logging_stderr() {
    init_logging_stderr_with(default_filter());
}

/// Same as `init_logging_stderr` but with a caller-supplied filter.
pub fn init_logging_stderr_with(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
