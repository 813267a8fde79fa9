//! Archive service: one long-lived task per archive owns the catalog.
//!
//! All catalog mutation happens inside the command loop, so there are no
//! locks: readers grab an immutable snapshot (`Arc`) from a watch channel at
//! query start and hold it for the query's duration. Scans run synchronously
//! inside the loop, so at most one scan per archive exists at any time;
//! redundant scan commands that queued up behind a running scan are dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::catalog::TimeEntrySlice;
use crate::scan::{scan_archive, ScanOptions};
use crate::types::{ArchiveConfig, DEFAULT_REFRESH_MINS};

/// Commands accepted by an archive's command loop.
#[derive(Debug)]
pub enum ArchiveCmd {
    /// Full walk from an empty staging catalog.
    Scan,
    /// Incremental walk from the current watermark.
    Rescan,
    /// Log the current catalog entries.
    DumpEntries,
    /// Stop the ticker and exit the loop.
    Stop,
}

/// Cheap cloneable handle to one archive's command loop and catalog.
#[derive(Clone)]
pub struct ArchiveHandle {
    pub collector: String,
    pub discriminator: String,
    cmd_tx: mpsc::Sender<ArchiveCmd>,
    catalog_rx: watch::Receiver<Arc<TimeEntrySlice>>,
}

impl ArchiveHandle {
    /// Immutable catalog snapshot, valid for the lifetime of a query.
    pub fn snapshot(&self) -> Arc<TimeEntrySlice> {
        self.catalog_rx.borrow().clone()
    }

    pub async fn send(&self, cmd: ArchiveCmd) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }
}

/// Spawn the command loop for one archive on the shared tracker.
pub fn spawn_archive(
    cfg: ArchiveConfig,
    tracker: &TaskTracker,
    debug_scan: bool,
    shutdown: CancellationToken,
) -> ArchiveHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (catalog_tx, catalog_rx) = watch::channel(Arc::new(TimeEntrySlice::new()));
    let handle = ArchiveHandle {
        collector: cfg.collector.clone(),
        discriminator: cfg.discriminator.clone(),
        cmd_tx,
        catalog_rx,
    };
    tracker.spawn(run(cfg, catalog_tx, cmd_rx, debug_scan, shutdown));
    handle
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

async fn run(
    cfg: ArchiveConfig,
    catalog_tx: watch::Sender<Arc<TimeEntrySlice>>,
    mut cmd_rx: mpsc::Receiver<ArchiveCmd>,
    debug_scan: bool,
    shutdown: CancellationToken,
) {
    let key = cfg.key();
    let opts = ScanOptions {
        root: cfg.path.clone(),
        discriminator: cfg.discriminator.clone(),
        debug: debug_scan,
    };
    let blob = cfg
        .savepath
        .as_ref()
        .map(|sp| TimeEntrySlice::blob_path(sp, &cfg.discriminator, &cfg.collector));

    // Warm start from the persisted blob when possible, else a full scan.
    let restored = blob.as_ref().and_then(|path| match TimeEntrySlice::from_blob(path) {
        Ok(c) => {
            info!(archive = key.as_str(), entries = c.len(), "catalog restored from blob");
            Some(c)
        }
        Err(e) => {
            debug!(archive = key.as_str(), error = %e, "no usable catalog blob, scanning");
            None
        }
    });
    match restored {
        Some(c) => {
            catalog_tx.send_replace(Arc::new(c));
        }
        None => {
            let fresh = run_scan(&opts, &catalog_tx, None).await;
            persist(&key, blob.as_deref(), fresh.as_ref());
        }
    }

    let period = Duration::from_secs(cfg.refresh_mins.unwrap_or(DEFAULT_REFRESH_MINS) * 60);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the first tick is immediate

    loop {
        let scanned = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let merged = rescan(&opts, &catalog_tx, &key).await;
                persist(&key, blob.as_deref(), merged.as_ref());
                true
            }
            cmd = cmd_rx.recv() => match cmd {
                None | Some(ArchiveCmd::Stop) => break,
                Some(ArchiveCmd::Scan) => {
                    run_scan(&opts, &catalog_tx, None).await;
                    true
                }
                Some(ArchiveCmd::Rescan) => {
                    rescan(&opts, &catalog_tx, &key).await;
                    true
                }
                Some(ArchiveCmd::DumpEntries) => {
                    dump_entries(&key, &catalog_tx);
                    false
                }
            }
        };

        // Scan commands that queued while a scan ran are redundant.
        if scanned && drain_queued(&key, &mut cmd_rx, &catalog_tx) {
            break;
        }
    }

    info!(archive = key.as_str(), "archive service stopped");
}

/// Full or incremental walk on a blocking thread; publishes and returns the
/// resulting catalog.
async fn run_scan(
    opts: &ScanOptions,
    catalog_tx: &watch::Sender<Arc<TimeEntrySlice>>,
    last: Option<chrono::DateTime<chrono::Utc>>,
) -> Arc<TimeEntrySlice> {
    let scan_opts = opts.clone();
    let result = tokio::task::spawn_blocking(move || scan_archive(&scan_opts, last)).await;
    match result {
        Ok(fresh) => {
            let fresh = Arc::new(fresh);
            info!(root = %opts.root.display(), entries = fresh.len(), "scan complete");
            catalog_tx.send_replace(fresh.clone());
            fresh
        }
        Err(e) => {
            warn!(root = %opts.root.display(), error = %e, "scan task failed");
            catalog_tx.borrow().clone()
        }
    }
}

/// Incremental refresh: scan past the watermark and fold new entries into
/// the live catalog.
async fn rescan(
    opts: &ScanOptions,
    catalog_tx: &watch::Sender<Arc<TimeEntrySlice>>,
    key: &str,
) -> Arc<TimeEntrySlice> {
    let current = catalog_tx.borrow().clone();
    let last = current.last_date();
    if last.is_none() {
        // Nothing indexed yet; a rescan degenerates to a full scan.
        return run_scan(opts, catalog_tx, None).await;
    }

    let scan_opts = opts.clone();
    let result = tokio::task::spawn_blocking(move || scan_archive(&scan_opts, last)).await;
    match result {
        Ok(additions) if additions.is_empty() => current,
        Ok(additions) => {
            let mut entries = current.entries().to_vec();
            entries.extend(additions.entries().iter().cloned());
            let merged = Arc::new(TimeEntrySlice::from_entries(entries));
            info!(
                archive = key,
                added = additions.len(),
                entries = merged.len(),
                "incremental rescan complete"
            );
            catalog_tx.send_replace(merged.clone());
            merged
        }
        Err(e) => {
            warn!(archive = key, error = %e, "rescan task failed");
            current
        }
    }
}

fn persist(key: &str, blob: Option<&std::path::Path>, catalog: &TimeEntrySlice) {
    let Some(path) = blob else { return };
    match catalog.to_blob(path) {
        Ok(()) => debug!(archive = key, blob = %path.display(), "catalog persisted"),
        Err(e) => warn!(archive = key, blob = %path.display(), error = %e, "catalog persist failed"),
    }
}

fn dump_entries(key: &str, catalog_tx: &watch::Sender<Arc<TimeEntrySlice>>) {
    let catalog = catalog_tx.borrow().clone();
    info!(archive = key, entries = catalog.len(), "catalog dump");
    for entry in catalog.entries() {
        info!(
            archive = key,
            file = %entry.path.display(),
            sdate = %entry.sdate,
            size = entry.size,
            "entry"
        );
    }
}

/// Drop scan commands that piled up behind a completed scan. Returns true
/// when a queued Stop was seen.
fn drain_queued(
    key: &str,
    cmd_rx: &mut mpsc::Receiver<ArchiveCmd>,
    catalog_tx: &watch::Sender<Arc<TimeEntrySlice>>,
) -> bool {
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            ArchiveCmd::Scan | ArchiveCmd::Rescan => {
                debug!(archive = key, ?cmd, "scan already in flight, dropping command");
            }
            ArchiveCmd::DumpEntries => dump_entries(key, catalog_tx),
            ArchiveCmd::Stop => return true,
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::bgp4mp_update;
    use std::path::Path;

    // 2013-01-01T00:00:00Z
    const T0: u32 = 1356998400;

    fn write_records(path: &Path, timestamps: &[u32]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut out = Vec::new();
        for &ts in timestamps {
            out.extend_from_slice(&bgp4mp_update(ts, 1, 1, &[]));
        }
        std::fs::write(path, out).unwrap();
    }

    fn config(root: &Path, savepath: Option<&Path>) -> ArchiveConfig {
        ArchiveConfig {
            collector: "routeviews2".into(),
            path: root.to_path_buf(),
            discriminator: "updates".into(),
            savepath: savepath.map(Path::to_path_buf),
            refresh_mins: None,
        }
    }

    async fn wait_for_len(handle: &ArchiveHandle, want: usize) {
        for _ in 0..200 {
            if handle.snapshot().len() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("catalog never reached {want} entries (have {})", handle.snapshot().len());
    }

    #[tokio::test]
    async fn initial_scan_populates_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        write_records(&dir.path().join("2013.01/updates.20130101.0000"), &[T0]);
        write_records(&dir.path().join("2013.01/updates.20130101.0015"), &[T0 + 900]);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_archive(config(dir.path(), None), &tracker, false, shutdown.clone());

        wait_for_len(&handle, 2).await;
        assert_eq!(handle.snapshot().first_date().unwrap().timestamp(), i64::from(T0));
    }

    #[tokio::test]
    async fn rescan_folds_in_new_files() {
        let dir = tempfile::tempdir().unwrap();
        write_records(&dir.path().join("2013.01/updates.20130101.0000"), &[T0]);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_archive(config(dir.path(), None), &tracker, false, shutdown.clone());
        wait_for_len(&handle, 1).await;

        write_records(&dir.path().join("2013.01/updates.20130101.0015"), &[T0 + 900]);
        assert!(handle.send(ArchiveCmd::Rescan).await);
        wait_for_len(&handle, 2).await;

        // Readers holding the old snapshot were never disturbed
        let dates: Vec<i64> =
            handle.snapshot().entries().iter().map(|e| e.sdate.timestamp()).collect();
        assert_eq!(dates, vec![i64::from(T0), i64::from(T0 + 900)]);
    }

    #[tokio::test]
    async fn catalog_persists_and_restores_across_restarts() {
        let data = tempfile::tempdir().unwrap();
        let save = tempfile::tempdir().unwrap();
        write_records(&data.path().join("2013.01/updates.20130101.0000"), &[T0]);

        {
            let tracker = TaskTracker::new();
            let shutdown = CancellationToken::new();
            let handle = spawn_archive(
                config(data.path(), Some(save.path())),
                &tracker,
                false,
                shutdown.clone(),
            );
            wait_for_len(&handle, 1).await;
            assert!(handle.send(ArchiveCmd::Stop).await);
            tracker.close();
            tracker.wait().await;
        }

        let blob = TimeEntrySlice::blob_path(save.path(), "updates", "routeviews2");
        assert!(blob.exists());

        // A fresh service over an EMPTY tree restores the persisted catalog
        let empty = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_archive(
            config(empty.path(), Some(save.path())),
            &tracker,
            false,
            shutdown.clone(),
        );
        wait_for_len(&handle, 1).await;
    }

    #[tokio::test]
    async fn stop_ends_the_command_loop() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_archive(config(dir.path(), None), &tracker, false, shutdown.clone());

        assert!(handle.send(ArchiveCmd::Stop).await);
        tracker.close();
        tracker.wait().await;
        assert!(!handle.send(ArchiveCmd::Rescan).await);
    }
}
