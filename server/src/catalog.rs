//! Time-sorted catalog of archive entries.
//!
//! A catalog maps a time range to the contiguous span of files that may hold
//! records in that range, via two binary searches over first-record
//! timestamps. Catalogs persist as self-describing JSON blobs under
//! `{savepath}/{discriminator}-{collector}` and are restored on startup.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ArchiveError;
use crate::types::{ArchEntry, EntryOffset, ROTATION_INTERVAL_SECS};

/// Ordered sequence of [`ArchEntry`] sorted by first-record timestamp,
/// ties broken by path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeEntrySlice {
    entries: Vec<ArchEntry>,
}

impl TimeEntrySlice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from unsorted entries.
    pub fn from_entries(entries: Vec<ArchEntry>) -> Self {
        let mut slice = Self { entries };
        slice.sort();
        slice
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ArchEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: ArchEntry) {
        self.entries.push(entry);
    }

    /// Restore the sort order after appends.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.sdate.cmp(&b.sdate).then_with(|| a.path.cmp(&b.path)));
    }

    pub fn first_date(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.sdate)
    }

    /// Timestamp of the newest entry; the incremental-rescan watermark.
    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.sdate)
    }

    /// Resolve `[t_a, t_b]` to the half-open entry span `[i, j)` that may
    /// contain records in the range.
    ///
    /// The lower bound backs off by the rotation interval plus one second:
    /// an entry's timestamp is its FIRST record's, so later records in the
    /// same file extend up to one rotation later, and the cushion absorbs
    /// sub-second truncation. The scan engine re-filters record-by-record,
    /// so including adjacent files is safe.
    pub fn range(
        &self,
        t_a: DateTime<Utc>,
        t_b: DateTime<Utc>,
    ) -> Result<(usize, usize), ArchiveError> {
        let first = self.first_date().ok_or(ArchiveError::Empty)?;
        let last = self.last_date().ok_or(ArchiveError::Empty)?;

        let rotation = Duration::seconds(ROTATION_INTERVAL_SECS);
        if t_b < first || t_a > last + rotation {
            return Err(ArchiveError::OutOfRange);
        }

        let lower = t_a - rotation - Duration::seconds(1);
        let i = self.entries.partition_point(|e| e.sdate <= lower);
        let j = self.entries.partition_point(|e| e.sdate <= t_b);
        Ok((i, j))
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Canonical blob location for an archive.
    pub fn blob_path(savepath: &Path, discriminator: &str, collector: &str) -> PathBuf {
        savepath.join(format!("{discriminator}-{collector}"))
    }

    /// Serialize the catalog to a blob file, creating parent directories.
    pub fn to_blob(&self, path: &Path) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records: Vec<EntryRecord> = self.entries.iter().map(EntryRecord::from).collect();
        let raw = serde_json::to_vec(&records)
            .map_err(|e| ArchiveError::Decode(format!("catalog encode failed: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Restore a catalog from a blob file.
    pub fn from_blob(path: &Path) -> Result<Self, ArchiveError> {
        let raw = std::fs::read(path)?;
        let records: Vec<EntryRecord> = serde_json::from_slice(&raw)
            .map_err(|e| ArchiveError::Decode(format!("catalog decode failed: {e}")))?;
        let entries = records
            .into_iter()
            .map(ArchEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_entries(entries))
    }
}

// ---------------------------------------------------------------------------
// Blob wire format
// ---------------------------------------------------------------------------

/// On-disk form of an entry: the timestamp is split into explicit seconds and
/// nanoseconds so the blob stays readable across ports.
#[derive(Serialize, Deserialize)]
struct EntryRecord {
    path: PathBuf,
    secs: i64,
    nanos: u32,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offsets: Option<Vec<Option<EntryOffset>>>,
}

impl From<&ArchEntry> for EntryRecord {
    fn from(e: &ArchEntry) -> Self {
        Self {
            path: e.path.clone(),
            secs: e.sdate.timestamp(),
            nanos: e.sdate.timestamp_subsec_nanos(),
            size: e.size,
            offsets: e.offsets.clone(),
        }
    }
}

impl TryFrom<EntryRecord> for ArchEntry {
    type Error = ArchiveError;

    fn try_from(r: EntryRecord) -> Result<Self, ArchiveError> {
        let sdate = Utc
            .timestamp_opt(r.secs, r.nanos)
            .single()
            .ok_or_else(|| ArchiveError::Decode(format!("invalid timestamp in blob: {}", r.secs)))?;
        Ok(ArchEntry { path: r.path, sdate, size: r.size, offsets: r.offsets })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
