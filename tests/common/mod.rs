//! In-memory mock transport and sandboxed resolver for integration tests.
//!
//! The mock serves a single static body, supports ranges, and can inject
//! failures, 404s, and mid-transfer holds (so tests can pause or cancel a
//! transfer that is genuinely in flight). It also tracks the peak number of
//! concurrent fetches for the ceiling tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fetchq::error::TransferError;
use fetchq::message::TaskUpdate;
use fetchq::task::{BaseDir, BaseDirResolver, Destination, Task, TaskStatus};
use fetchq::transport::{FetchControl, FetchOutcome, FetchRequest, ProbeResult, ProgressFn, Transport};

pub struct MockTransport {
    body: Vec<u8>,
    etag: Option<String>,
    accept_ranges: bool,
    /// Per-URL count of injected network failures before success.
    fail_remaining: Mutex<HashMap<String, u32>>,
    not_found: Mutex<HashSet<String>>,
    /// Per-URL absolute byte offset at which a fetch blocks until a cancel or
    /// pause flag arrives.
    hold_at: Mutex<HashMap<String, u64>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub fn new(body: Vec<u8>) -> Self {
        MockTransport {
            body,
            etag: Some("\"mock-etag-1\"".into()),
            accept_ranges: true,
            fail_remaining: Mutex::new(HashMap::new()),
            not_found: Mutex::new(HashSet::new()),
            hold_at: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The next `count` fetches of `url` fail with a network error.
    pub fn fail_next(&self, url: &str, count: u32) {
        self.fail_remaining.lock().unwrap().insert(url.to_string(), count);
    }

    pub fn set_not_found(&self, url: &str) {
        self.not_found.lock().unwrap().insert(url.to_string());
    }

    /// Block the fetch of `url` once it has written `offset` absolute bytes,
    /// until the worker signals pause or cancel.
    pub fn hold_at(&self, url: &str, offset: u64) {
        self.hold_at.lock().unwrap().insert(url.to_string(), offset);
    }

    pub fn clear_hold(&self, url: &str) {
        self.hold_at.lock().unwrap().remove(url);
    }

    /// Peak number of fetches that were in flight at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a MockTransport);

impl<'a> ActiveGuard<'a> {
    fn enter(t: &'a MockTransport) -> Self {
        let now = t.active.fetch_add(1, Ordering::SeqCst) + 1;
        t.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(t)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn probe(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<ProbeResult, TransferError> {
        if self.not_found.lock().unwrap().contains(url) {
            return Err(TransferError::NotFound);
        }
        Ok(ProbeResult {
            status_code: 200,
            content_length: Some(self.body.len() as u64),
            accept_ranges: self.accept_ranges,
            etag: self.etag.clone(),
            last_modified: None,
        })
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        control: &FetchControl,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome, TransferError> {
        if self.not_found.lock().unwrap().contains(&request.url) {
            return Ok(FetchOutcome::NotFound { response_body: None });
        }
        {
            let mut fails = self.fail_remaining.lock().unwrap();
            if let Some(n) = fails.get_mut(&request.url) {
                if *n > 0 {
                    *n -= 1;
                    return Err(TransferError::Network("injected failure".into()));
                }
            }
        }

        let _guard = ActiveGuard::enter(self);

        let (from, to_excl) = match request.range {
            Some((f, t)) => (f, t + 1),
            None => (request.start_byte, self.body.len() as u64),
        };
        let data = &self.body[from as usize..to_excl as usize];
        let session_total = data.len() as u64;

        let mut file = if request.start_byte > 0 {
            OpenOptions::new()
                .write(true)
                .open(&request.dest)
                .map_err(|e| TransferError::filesystem(&e))?
        } else {
            if let Some(parent) = request.dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| TransferError::filesystem(&e))?;
            }
            File::create(&request.dest).map_err(|e| TransferError::filesystem(&e))?
        };

        let hold = self.hold_at.lock().unwrap().get(&request.url).copied();
        let mut written: u64 = 0;
        for slice in data.chunks(1024) {
            if let Some(h) = hold {
                if request.start_byte + written >= h {
                    // Wait for the scheduler to react.
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while !control.cancel_requested() && !control.pause_requested() {
                        if Instant::now() > deadline {
                            return Err(TransferError::Network("hold timed out".into()));
                        }
                        std::thread::sleep(Duration::from_millis(2));
                    }
                }
            }
            if control.cancel_requested() {
                drop(file);
                let _ = std::fs::remove_file(&request.dest);
                return Ok(FetchOutcome::Canceled);
            }
            if control.pause_requested() {
                if request.allow_pause {
                    file.sync_all().map_err(|e| TransferError::filesystem(&e))?;
                    return Ok(FetchOutcome::Paused {
                        token: request.dest.to_string_lossy().to_string(),
                        start_byte: request.start_byte + written,
                        validator: self.etag.clone(),
                    });
                }
                drop(file);
                let _ = std::fs::remove_file(&request.dest);
                return Ok(FetchOutcome::Canceled);
            }

            file.seek(SeekFrom::Start(request.start_byte + written))
                .map_err(|e| TransferError::filesystem(&e))?;
            file.write_all(slice).map_err(|e| TransferError::filesystem(&e))?;
            written += slice.len() as u64;
            progress(written, Some(session_total));
        }

        file.sync_all().map_err(|e| TransferError::filesystem(&e))?;
        let mut headers = HashMap::new();
        if let Some(etag) = &self.etag {
            headers.insert("etag".to_string(), etag.trim_matches('"').to_string());
        }
        Ok(FetchOutcome::Complete {
            response_headers: headers,
            response_body: None,
        })
    }
}

/// Resolver that puts every base directory under one sandbox root.
pub struct TestResolver {
    root: PathBuf,
}

impl TestResolver {
    pub fn new(root: &Path) -> Self {
        TestResolver {
            root: root.to_path_buf(),
        }
    }
}

impl BaseDirResolver for TestResolver {
    fn resolve_base(&self, base: BaseDir) -> Result<PathBuf, TransferError> {
        Ok(match base {
            BaseDir::Downloads => self.root.join("downloads"),
            BaseDir::State => self.root.join("state"),
            BaseDir::Cache => self.root.join("cache"),
            BaseDir::Temp => self.root.join("tmp"),
        })
    }
}

pub fn download_task(id: &str, url: &str, filename: &str) -> Task {
    Task::new(id, url, Destination::new(BaseDir::Downloads, "", filename))
}

/// Scheduler over the mock transport, sandboxed under `root`, with an
/// in-memory store.
pub async fn scheduler_with(
    transport: Arc<MockTransport>,
    root: &Path,
    config: fetchq::config::SchedulerConfig,
) -> fetchq::TransferScheduler {
    let store = fetchq::updates::UpdateStore::open_memory()
        .await
        .expect("in-memory store");
    fetchq::TransferScheduler::new(config, transport, Arc::new(TestResolver::new(root)), store)
}

/// Receive updates until `id` reaches `status` or the timeout elapses,
/// returning everything seen for that task (statuses and progress).
pub async fn wait_for_status(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<TaskUpdate>,
    id: &str,
    status: TaskStatus,
    timeout: Duration,
) -> Vec<TaskUpdate> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let update = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} to reach {}", id, status))
            .expect("update channel closed");
        if update.task().id != id {
            continue;
        }
        let done = matches!(&update, TaskUpdate::Status(s) if s.status == status);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

/// The status transitions observed for one task, in order.
pub fn statuses_of(updates: &[TaskUpdate]) -> Vec<TaskStatus> {
    updates
        .iter()
        .filter_map(|u| match u {
            TaskUpdate::Status(s) => Some(s.status),
            TaskUpdate::Progress(_) => None,
        })
        .collect()
}
