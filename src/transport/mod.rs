//! Transport capability: perform one HTTP exchange on behalf of a worker unit.
//!
//! The scheduler never talks HTTP itself; it calls through this trait. The
//! default implementation (`HttpTransport`) drives libcurl and must be called
//! from a blocking context (`spawn_blocking`), same as the probe/fetch split
//! the rest of the crate assumes. Tests substitute an in-memory transport.

mod http;
mod parse;

pub use http::HttpTransport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransferError;

/// Result of a header-only probe: the fields chunking and resume need.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status_code: u32,
    pub content_length: Option<u64>,
    /// True if the server sent `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// One transfer to execute. `dest` is the exact file written (a `.part` path
/// for plain tasks, a spool file for chunks); renaming is the caller's job.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub dest: PathBuf,
    /// Bytes already present in `dest`; the transfer continues from here and
    /// writes at this file offset.
    pub start_byte: u64,
    /// Absolute server byte range (inclusive) for chunk transfers; `None`
    /// fetches the remainder of the resource from `start_byte`.
    pub range: Option<(u64, u64)>,
    /// `If-Range` validator from resume data, when known.
    pub validator: Option<String>,
    pub allow_pause: bool,
}

/// How a fetch ended when it did not error.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Complete {
        response_headers: HashMap<String, String>,
        response_body: Option<String>,
    },
    NotFound {
        response_body: Option<String>,
    },
    /// Stopped cooperatively with resumable state left on disk.
    Paused {
        token: String,
        start_byte: u64,
        validator: Option<String>,
    },
    /// Stopped cooperatively; partial state was discarded.
    Canceled,
}

/// Control signals from the scheduler to one in-flight fetch. Cooperative:
/// the transport polls the flags between writes; cancel wins over pause.
#[derive(Clone)]
pub struct FetchControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl FetchControl {
    pub fn new(cancel: Arc<AtomicBool>, pause: Arc<AtomicBool>) -> Self {
        Self { cancel, pause }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }
}

/// Progress callback: (bytes transferred this session, expected session total).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// The "do one HTTP transfer" capability consumed by worker units and the
/// chunk coordinator's probe.
pub trait Transport: Send + Sync {
    /// Header-only request. Follows redirects; non-2xx is an error (404 maps
    /// to `TransferError::NotFound`).
    fn probe(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ProbeResult, TransferError>;

    /// Execute one transfer, writing into `request.dest` and honoring
    /// `control`. Blocking; run under `spawn_blocking`.
    fn fetch(
        &self,
        request: &FetchRequest,
        control: &FetchControl,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome, TransferError>;
}
