//! Test harness for HTTP integration tests.
//!
//! Builds an archive tree of synthetic MRT records in a temp dir, spawns the
//! real archive service over it, and dispatches requests through the real
//! router with `tower::ServiceExt::oneshot` (no subprocess, no socket).

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use mrtscope_server::api;
use mrtscope_server::archive::{spawn_archive, ArchiveHandle};
use mrtscope_server::session::SessionManager;
use mrtscope_server::types::{AppContext, ArchiveConfig};

// 2013-01-01T00:00:00Z
pub const T0: u32 = 1356998400;

// ---------------------------------------------------------------------------
// Synthetic MRT records
// ---------------------------------------------------------------------------

/// A framed record: 12-byte common header plus an arbitrary body.
pub fn raw_record(ts: u32, mrt_type: u16, subtype: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(&mrt_type.to_be_bytes());
    out.extend_from_slice(&subtype.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A complete BGP4MP MESSAGE record carrying an UPDATE with one withdrawn
/// /24 and one announced /24.
pub fn bgp4mp_update(ts: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u16.to_be_bytes()); // withdrawn length
    payload.extend_from_slice(&[24, 10, 0, 1]);
    payload.extend_from_slice(&0u16.to_be_bytes()); // no path attributes
    payload.extend_from_slice(&[24, 192, 0, 1]); // NLRI

    let mut bgp = Vec::new();
    bgp.extend_from_slice(&[0xff; 16]);
    bgp.extend_from_slice(&((19 + payload.len()) as u16).to_be_bytes());
    bgp.push(2); // UPDATE
    bgp.extend_from_slice(&payload);

    let mut body = Vec::new();
    body.extend_from_slice(&100u16.to_be_bytes()); // peer AS
    body.extend_from_slice(&200u16.to_be_bytes()); // local AS
    body.extend_from_slice(&0u16.to_be_bytes()); // interface index
    body.extend_from_slice(&1u16.to_be_bytes()); // AFI = IPv4
    body.extend_from_slice(&[10, 0, 0, 1]);
    body.extend_from_slice(&[10, 0, 0, 2]);
    body.extend_from_slice(&bgp);

    raw_record(ts, 16, 1, &body)
}

/// Write a file of UPDATE records, creating parent directories.
pub fn write_records(path: &Path, timestamps: &[u32]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut out = Vec::new();
    for &ts in timestamps {
        out.extend_from_slice(&bgp4mp_update(ts));
    }
    std::fs::write(path, out).unwrap();
}

/// Split a raw reply body back into record timestamps.
pub fn record_timestamps(body: &[u8]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 12 <= body.len() {
        let ts = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
        let len =
            u32::from_be_bytes([body[pos + 8], body[pos + 9], body[pos + 10], body[pos + 11]])
                as usize;
        out.push(ts);
        pos += 12 + len;
    }
    assert_eq!(pos, body.len(), "reply body is not a whole number of records");
    out
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub router: Router,
    pub ctx: AppContext,
    _data_dir: TempDir,
}

impl TestHarness {
    /// Build a harness over one "routeviews2/updates" archive holding the
    /// given files (`(relative path, record timestamps)`); waits until the
    /// initial scan has indexed every admitted file.
    pub async fn with_files(files: &[(&str, &[u32])]) -> Self {
        let data_dir = TempDir::new().expect("temp dir");
        let mut expected = 0usize;
        for (rel, stamps) in files {
            write_records(&data_dir.path().join(rel), stamps);
            if rel.contains("updates") {
                expected += 1;
            }
        }

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let cfg = ArchiveConfig {
            collector: "routeviews2".into(),
            path: data_dir.path().to_path_buf(),
            discriminator: "updates".into(),
            savepath: None,
            refresh_mins: None,
        };
        let handle = spawn_archive(cfg, &tracker, true, shutdown.child_token());
        wait_for_len(&handle, expected).await;

        let mut archives = BTreeMap::new();
        archives.insert("routeviews2/updates".to_string(), handle);

        let sessions =
            SessionManager::spawn(&tracker, Duration::from_secs(60), shutdown.child_token());
        let ctx = AppContext {
            archives: Arc::new(archives),
            sessions,
            tracker: tracker.clone(),
            shutdown,
            start_time: Instant::now(),
        };
        let router = api::router(ctx.clone())
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 54321))));

        TestHarness { router, ctx, _data_dir: data_dir }
    }

    /// Dispatch a GET request, returning status, headers, and collected body.
    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).expect("request");
        let resp = self.router.clone().oneshot(req).await.expect("router response");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes().to_vec();
        (status, headers, body)
    }
}

async fn wait_for_len(handle: &ArchiveHandle, want: usize) {
    for _ in 0..300 {
        if handle.snapshot().len() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("catalog never reached {want} entries (have {})", handle.snapshot().len());
}
