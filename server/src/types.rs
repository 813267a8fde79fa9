//! Core data model: archive entries, sparse-index offsets, per-archive
//! configuration, and the shared axum application context.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::archive::ArchiveHandle;
use crate::error::ArchiveError;
use crate::session::SessionManager;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Archive file rotation interval: an entry's first-record timestamp can be
/// up to this much earlier than the last record in the same file.
pub const ROTATION_INTERVAL_SECS: i64 = 15 * 60;

/// Hard cap on the span of a single range query.
pub const MAX_QUERY_SPAN_SECS: i64 = 24 * 60 * 60;

/// Maximum live continuous-pull sessions per client IP.
pub const CONT_SESSIONS_PER_IP: usize = 100;

/// Idle continuous-pull sessions expire after this long.
pub const SESSION_TTL_SECS: u64 = 30 * 60;

/// Default period between incremental catalog refreshes.
pub const DEFAULT_REFRESH_MINS: u64 = 30;

/// Wire format for timestamps in query parameters: `YYYYMMDDHHMMSS`, UTC.
pub const COMPACT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

// ---------------------------------------------------------------------------
// Catalog entry types
// ---------------------------------------------------------------------------

/// One sampled offset inside an archive file: the record's decoded timestamp
/// (UNIX seconds) and the byte position just past the end of that record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOffset {
    pub value: i64,
    pub offset: u64,
}

/// Catalog entry for one indexed archive file.
///
/// Two entries are equal iff their paths are equal; within a catalog, paths
/// are unique.
#[derive(Clone, Debug)]
pub struct ArchEntry {
    pub path: PathBuf,
    /// Timestamp of the file's first record, second precision, UTC.
    pub sdate: DateTime<Utc>,
    pub size: u64,
    /// Sparse index built by the offline tool; `None` until generated.
    pub offsets: Option<Vec<Option<EntryOffset>>>,
}

impl ArchEntry {
    pub fn new(path: PathBuf, sdate: DateTime<Utc>, size: u64) -> Self {
        Self { path, sdate, size, offsets: None }
    }
}

impl PartialEq for ArchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for ArchEntry {}

// ---------------------------------------------------------------------------
// Compact timestamp parsing
// ---------------------------------------------------------------------------

/// Parse a `YYYYMMDDHHMMSS` query timestamp as a UTC instant.
pub fn parse_compact_time(s: &str) -> Result<DateTime<Utc>, ArchiveError> {
    NaiveDateTime::parse_from_str(s, COMPACT_TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|_| ArchiveError::BadDate(format!("unparseable timestamp: {s}")))
}

/// Render a UTC instant in the compact `YYYYMMDDHHMMSS` form.
pub fn format_compact_time(t: DateTime<Utc>) -> String {
    t.format(COMPACT_TIME_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Archive configuration (archives.toml or --archive flags)
// ---------------------------------------------------------------------------

/// Configuration for one archive: a collector's capture tree filtered by a
/// path discriminator (e.g. "updates" vs "ribs").
#[derive(Clone, Debug, Deserialize)]
pub struct ArchiveConfig {
    /// Logical name of the data source, e.g. "routeviews2".
    pub collector: String,
    /// Root of the capture tree on disk.
    pub path: PathBuf,
    /// Substring a file path must contain to be indexed.
    pub discriminator: String,
    /// Directory for persisted catalog blobs. No persistence when absent.
    #[serde(default)]
    pub savepath: Option<PathBuf>,
    /// Minutes between incremental refreshes.
    #[serde(default)]
    pub refresh_mins: Option<u64>,
}

impl ArchiveConfig {
    /// Key under which this archive is routed: `{collector}/{discriminator}`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.collector, self.discriminator)
    }
}

#[derive(Deserialize)]
struct ArchivesFile {
    #[serde(default)]
    archive: Vec<ArchiveConfig>,
}

/// Parse an archives.toml config file into archive specs.
pub fn parse_archives_toml(path: &std::path::Path) -> Result<Vec<ArchiveConfig>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read {}: {e}", path.display()))?;
    let parsed: ArchivesFile =
        toml::from_str(&raw).map_err(|e| format!("could not parse {}: {e}", path.display()))?;
    Ok(parsed.archive)
}

// ---------------------------------------------------------------------------
// Axum application state
// ---------------------------------------------------------------------------

/// Shared state for the HTTP surface: archive handles keyed by
/// `{collector}/{discriminator}`, the session manager, and shutdown plumbing.
#[derive(Clone)]
pub struct AppContext {
    pub archives: Arc<BTreeMap<String, ArchiveHandle>>,
    pub sessions: SessionManager,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppContext {
    /// Look up an archive by collector and discriminator kind.
    pub fn archive(&self, collector: &str, kind: &str) -> Result<&ArchiveHandle, ArchiveError> {
        let key = format!("{collector}/{kind}");
        self.archives.get(&key).ok_or(ArchiveError::NotFound(key))
    }
}
