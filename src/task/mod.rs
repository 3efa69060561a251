//! The task record: one logical transfer.
//!
//! Tasks are plain, explicitly-typed data with a versioned serialization
//! schema (unknown fields are rejected, not silently ignored). Immutable once
//! created except `retries_remaining`, which only ever decreases.

mod destination;
mod status;

pub use destination::{BaseDir, BaseDirResolver, Destination, XdgResolver};
pub use status::TaskStatus;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque unique task identifier.
pub type TaskId = String;

/// Group assigned when the caller does not pick one.
pub const DEFAULT_GROUP: &str = "default";

/// Reserved group for chunk sub-tasks. Updates for this group are routed to
/// the owning chunk coordinator and never reach external consumers.
pub const CHUNK_GROUP: &str = "chunk";

/// Current task serialization schema version.
pub const TASK_SCHEMA: u32 = 1;

/// Which updates the caller wants delivered for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    None,
    Status,
    Progress,
    #[default]
    Both,
}

impl UpdateMode {
    pub fn wants_status(self) -> bool {
        matches!(self, UpdateMode::Status | UpdateMode::Both)
    }

    pub fn wants_progress(self) -> bool {
        matches!(self, UpdateMode::Progress | UpdateMode::Both)
    }
}

/// One logical transfer. `priority` sorts ascending: **lower value = more
/// urgent**; ties are broken by `creation_time` (earlier first).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Serialization schema version; legacy payloads are rejected on mismatch.
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub id: TaskId,
    /// One or more URLs; chunked downloads round-robin across them, plain
    /// transfers use the first.
    pub urls: Vec<String>,
    pub destination: Destination,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Unix milliseconds at creation; second ordering key after priority.
    pub creation_time: i64,
    #[serde(default)]
    pub retries_total: u32,
    #[serde(default)]
    pub retries_remaining: u32,
    /// Carried for callers that gate transfers on network type; admission does
    /// not enforce it (no connectivity capability in this crate).
    #[serde(default)]
    pub requires_unmetered: bool,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default = "default_group")]
    pub group: String,
    /// 1 = plain transfer; >1 requests a chunked download with this many
    /// ranges per URL.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
    #[serde(default)]
    pub allow_pause: bool,
    /// Opaque caller data; never interpreted (chunk sub-tasks use it to carry
    /// their parent linkage).
    #[serde(default)]
    pub metadata: String,
}

fn default_schema() -> u32 {
    TASK_SCHEMA
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_chunk_count() -> usize {
    1
}

/// Current time as Unix milliseconds (task creation timestamps).
pub fn unix_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Task {
    /// New GET download task with defaults (default group, no retries, no
    /// chunking, status+progress updates).
    pub fn new(id: impl Into<TaskId>, url: impl Into<String>, destination: Destination) -> Self {
        Task {
            schema: TASK_SCHEMA,
            id: id.into(),
            urls: vec![url.into()],
            destination,
            method: default_method(),
            headers: HashMap::new(),
            body: None,
            priority: 0,
            creation_time: unix_time_millis(),
            retries_total: 0,
            retries_remaining: 0,
            requires_unmetered: false,
            update_mode: UpdateMode::Both,
            group: default_group(),
            chunk_count: 1,
            allow_pause: false,
            metadata: String::new(),
        }
    }

    /// Set the retry budget (total and remaining together).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_total = retries;
        self.retries_remaining = retries;
        self
    }

    pub fn primary_url(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }

    /// Host of the primary URL, for the per-host admission counter.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(self.primary_url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_count > 1
    }

    /// Whether this is a chunk sub-task owned by a chunk coordinator.
    pub fn is_chunk(&self) -> bool {
        self.group == CHUNK_GROUP
    }
}
