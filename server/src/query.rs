//! Streaming range-query engine.
//!
//! A query resolves its time range to a span of catalog entries, then walks
//! each file in catalog order, decoding framed records and handing every one
//! with a readable header to a [`RecordSink`]. Raw mode and stats mode differ
//! only in their sink; the file-iteration driver is shared.
//!
//! Producers run on blocking tasks (file I/O) registered with the shared
//! [`TaskTracker`], send replies through a bounded channel (the HTTP drain
//! applies backpressure by reading slowly), and stop early when the consumer
//! disappears or the cancellation token fires.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::catalog::TimeEntrySlice;
use crate::error::ArchiveError;
use crate::mrt::CommonHeader;
use crate::scan::open_records;

/// One reply: a copied raw record (or one JSON blob in stats mode), or an
/// error. User-facing errors arrive as a single `Err` before the channel
/// closes; decode errors arrive mid-stream and the scan continues.
pub type Reply = Result<Vec<u8>, ArchiveError>;

/// Reply channel capacity.
pub const REPLY_CHANNEL_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Sink seam
// ---------------------------------------------------------------------------

/// Per-record behavior of a range scan. Implementations must not hold the
/// record slice past the call: the framing iterator reuses its buffer.
pub trait RecordSink: Send {
    /// Handle one framed record. Returns false when the consumer is gone and
    /// the scan should stop.
    fn on_record(&mut self, header: &CommonHeader, raw: &[u8], out: &mpsc::Sender<Reply>) -> bool;

    /// Called once after the last file of the span.
    fn finish(&mut self, out: &mpsc::Sender<Reply>);
}

/// Raw mode: emit a fresh copy of every record whose embedded timestamp lies
/// within one second of the requested range. The widened window tolerates the
/// catalog's coarse second-precision index without over-delivering.
pub struct RawSink {
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
}

impl RawSink {
    pub fn new(t_a: DateTime<Utc>, t_b: DateTime<Utc>) -> Self {
        Self { lower: t_a - Duration::seconds(1), upper: t_b + Duration::seconds(1) }
    }
}

impl RecordSink for RawSink {
    fn on_record(&mut self, header: &CommonHeader, raw: &[u8], out: &mpsc::Sender<Reply>) -> bool {
        let t = header.time();
        if self.lower < t && t < self.upper {
            return out.blocking_send(Ok(raw.to_vec())).is_ok();
        }
        true
    }

    fn finish(&mut self, _out: &mpsc::Sender<Reply>) {}
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Spawn a producer task scanning `[t_a, t_b]` over a catalog snapshot.
pub fn spawn_query<S: RecordSink + 'static>(
    snapshot: Arc<TimeEntrySlice>,
    t_a: DateTime<Utc>,
    t_b: DateTime<Utc>,
    out: mpsc::Sender<Reply>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
    sink: S,
) {
    tracker.spawn_blocking(move || scan_range(&snapshot, t_a, t_b, &out, &cancel, sink));
}

/// The shared file-iteration driver. Emits records in catalog order and, per
/// file, in stream order; file `k+1` is not opened before file `k` finishes.
pub fn scan_range<S: RecordSink>(
    entries: &TimeEntrySlice,
    t_a: DateTime<Utc>,
    t_b: DateTime<Utc>,
    out: &mpsc::Sender<Reply>,
    cancel: &CancellationToken,
    mut sink: S,
) {
    let (i, j) = match entries.range(t_a, t_b) {
        Ok(span) => span,
        Err(e) => {
            let _ = out.blocking_send(Err(e));
            return;
        }
    };

    for entry in &entries.entries()[i..j] {
        if cancel.is_cancelled() {
            return;
        }
        let mut records = match open_records(&entry.path) {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %entry.path.display(), error = %e, "cannot open archive file, skipping");
                continue;
            }
        };
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match records.next_record() {
                Ok(None) => break,
                Ok(Some(raw)) => {
                    let header = match CommonHeader::parse(raw) {
                        Ok(h) => h,
                        Err(e) => {
                            if out.blocking_send(Err(e)).is_err() {
                                return;
                            }
                            continue;
                        }
                    };
                    if !sink.on_record(&header, raw, out) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(file = %entry.path.display(), error = %e, "record framing error, moving to next file");
                    break;
                }
            }
        }
    }

    sink.finish(out);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TimeEntrySlice;
    use crate::testutil::bgp4mp_update;
    use crate::types::ArchEntry;
    use chrono::TimeZone;
    use std::path::Path;

    // 2013-01-01T00:00:00Z
    const T0: u32 = 1356998400;

    fn at(ts: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(ts), 0).unwrap()
    }

    fn write_file(path: &Path, timestamps: &[u32]) -> ArchEntry {
        let mut raw = Vec::new();
        for &ts in timestamps {
            raw.extend_from_slice(&bgp4mp_update(ts, 1, 1, &[]));
        }
        std::fs::write(path, &raw).unwrap();
        ArchEntry::new(path.to_path_buf(), at(timestamps[0]), raw.len() as u64)
    }

    fn drain(rx: &mut mpsc::Receiver<Reply>) -> Vec<Reply> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn fixture(dir: &Path) -> TimeEntrySlice {
        let a = write_file(&dir.join("updates.0000"), &[T0, T0 + 10, T0 + 600]);
        let b = write_file(&dir.join("updates.0015"), &[T0 + 900, T0 + 910]);
        TimeEntrySlice::from_entries(vec![a, b])
    }

    #[test]
    fn raw_query_emits_matching_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = fixture(dir.path());

        let (tx, mut rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        scan_range(&catalog, at(T0), at(T0 + 900), &tx, &cancel, RawSink::new(at(T0), at(T0 + 900)));
        drop(tx);

        let replies = drain(&mut rx);
        let stamps: Vec<u32> = replies
            .iter()
            .map(|r| CommonHeader::parse(r.as_ref().unwrap()).unwrap().timestamp)
            .collect();
        assert_eq!(stamps, vec![T0, T0 + 10, T0 + 600, T0 + 900]);
    }

    #[test]
    fn emitted_payload_is_a_copy_of_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates.one");
        let entry = write_file(&path, &[T0]);
        let expected = std::fs::read(&path).unwrap();
        let catalog = TimeEntrySlice::from_entries(vec![entry]);

        let (tx, mut rx) = mpsc::channel(16);
        scan_range(
            &catalog,
            at(T0),
            at(T0 + 60),
            &tx,
            &CancellationToken::new(),
            RawSink::new(at(T0), at(T0 + 60)),
        );
        drop(tx);

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].as_ref().unwrap(), &expected);
    }

    #[test]
    fn records_outside_the_window_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = fixture(dir.path());

        // Only the two records in the first 20 seconds pass the filter; the
        // later records in the same file are decoded but dropped.
        let (tx, mut rx) = mpsc::channel(1024);
        scan_range(
            &catalog,
            at(T0),
            at(T0 + 20),
            &tx,
            &CancellationToken::new(),
            RawSink::new(at(T0), at(T0 + 20)),
        );
        drop(tx);

        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn range_failure_emits_single_error_then_closes() {
        let catalog = TimeEntrySlice::new();
        let (tx, mut rx) = mpsc::channel(16);
        scan_range(
            &catalog,
            at(T0),
            at(T0 + 60),
            &tx,
            &CancellationToken::new(),
            RawSink::new(at(T0), at(T0 + 60)),
        );
        drop(tx);

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], Err(ArchiveError::Empty)));
    }

    #[test]
    fn missing_file_is_skipped_and_scan_continues() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(&dir.path().join("updates.good"), &[T0 + 30]);
        let ghost = ArchEntry::new(dir.path().join("updates.ghost"), at(T0), 512);
        let catalog = TimeEntrySlice::from_entries(vec![ghost, good]);

        let (tx, mut rx) = mpsc::channel(16);
        scan_range(
            &catalog,
            at(T0),
            at(T0 + 60),
            &tx,
            &CancellationToken::new(),
            RawSink::new(at(T0), at(T0 + 60)),
        );
        drop(tx);

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ok());
    }

    #[test]
    fn cancellation_stops_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = fixture(dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);
        scan_range(&catalog, at(T0), at(T0 + 900), &tx, &cancel, RawSink::new(at(T0), at(T0 + 900)));
        drop(tx);

        assert!(drain(&mut rx).is_empty());
    }
}
