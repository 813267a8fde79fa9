//! HTTP API handlers for the archive query surface.
//!
//! One route per archive: `/archive/{collector}/{kind}` serves raw range
//! queries, catalog info modes (`?range`, `?files`), and continuous-pull
//! sessions; `/archive/{collector}/{kind}/stats` serves per-second JSON
//! statistics. Reply records stream straight from the producer channel to
//! the socket, so a slow client applies backpressure to the scan.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::archive::ArchiveHandle;
use crate::error::ArchiveError;
use crate::query::{spawn_query, RawSink, RecordSink, Reply, REPLY_CHANNEL_CAP};
use crate::stats::StatsSink;
use crate::types::{
    format_compact_time, parse_compact_time, AppContext, MAX_QUERY_SPAN_SECS,
};

/// Response header carrying the (rotated) continuous-pull session ID.
pub const SESSION_HEADER: &str = "x-session-id";

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ArchiveParams {
    start: Option<String>,
    end: Option<String>,
    /// "begin" to open a session, or a session ID to resume one.
    continuous: Option<String>,
    /// Presence-only: report the catalog's first and last timestamps.
    range: Option<String>,
    /// Presence-only: list indexed file basenames.
    files: Option<String>,
}

/// Parse and validate an explicit `[start, end]` window.
fn parse_window(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(chrono::DateTime<Utc>, chrono::DateTime<Utc>), ArchiveError> {
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => return Err(ArchiveError::BadRequest("start and end are required".into())),
    };
    let t_a = parse_compact_time(start)?;
    let t_b = parse_compact_time(end)?;
    if t_b < t_a {
        return Err(ArchiveError::BadDate(format!("end {end} precedes start {start}")));
    }
    if (t_b - t_a).num_seconds() > MAX_QUERY_SPAN_SECS {
        return Err(ArchiveError::TooLarge);
    }
    Ok((t_a, t_b))
}

// ---------------------------------------------------------------------------
// Archive endpoint
// ---------------------------------------------------------------------------

/// Raw range queries, info modes, and continuous pull for one archive.
pub async fn api_archive(
    State(ctx): State<AppContext>,
    Path((collector, kind)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ArchiveParams>,
) -> Result<Response, ArchiveError> {
    let handle = ctx.archive(&collector, &kind)?.clone();

    if params.range.is_some() {
        return range_info(&handle);
    }
    if params.files.is_some() {
        return files_info(&handle);
    }
    if let Some(token) = params.continuous.as_deref() {
        return continuous(&ctx, &handle, addr.ip().to_string(), token, params.start.as_deref())
            .await;
    }

    let (t_a, t_b) = parse_window(params.start.as_deref(), params.end.as_deref())?;
    let sink = RawSink::new(t_a, t_b);
    Ok(stream_query(&ctx, &handle, t_a, t_b, sink, "application/octet-stream").await)
}

/// Per-second statistics for one archive, as a single JSON blob.
pub async fn api_archive_stats(
    State(ctx): State<AppContext>,
    Path((collector, kind)): Path<(String, String)>,
    Query(params): Query<ArchiveParams>,
) -> Result<Response, ArchiveError> {
    let handle = ctx.archive(&collector, &kind)?.clone();
    let (t_a, t_b) = parse_window(params.start.as_deref(), params.end.as_deref())?;
    let sink = StatsSink::new(t_a, t_b);
    Ok(stream_query(&ctx, &handle, t_a, t_b, sink, "application/json").await)
}

// ---------------------------------------------------------------------------
// Info modes
// ---------------------------------------------------------------------------

/// `?range`: `"first - last\n"` over the catalog bounds.
fn range_info(handle: &ArchiveHandle) -> Result<Response, ArchiveError> {
    let snapshot = handle.snapshot();
    let first = snapshot.first_date().ok_or(ArchiveError::Empty)?;
    let last = snapshot.last_date().ok_or(ArchiveError::Empty)?;
    let body = format!("{} - {}\n", format_compact_time(first), format_compact_time(last));
    Ok(body.into_response())
}

/// `?files`: one indexed basename per line.
fn files_info(handle: &ArchiveHandle) -> Result<Response, ArchiveError> {
    let snapshot = handle.snapshot();
    let mut body = String::new();
    for entry in snapshot.entries() {
        if let Some(name) = entry.path.file_name() {
            body.push_str(&name.to_string_lossy());
            body.push('\n');
        }
    }
    Ok(body.into_response())
}

// ---------------------------------------------------------------------------
// Continuous pull
// ---------------------------------------------------------------------------

async fn continuous(
    ctx: &AppContext,
    handle: &ArchiveHandle,
    ip: String,
    token: &str,
    start: Option<&str>,
) -> Result<Response, ArchiveError> {
    if token == "begin" {
        let session = ctx.sessions.begin(&ip).await?;
        let Some(start) = start else {
            // No backfill requested: just hand out the session ID.
            return with_session_header(StatusCode::OK.into_response(), &session.id);
        };
        let t_a = parse_compact_time(start)?;
        let t_b = Utc::now();
        if t_b < t_a {
            return Err(ArchiveError::BadDate(format!("start {start} lies in the future")));
        }
        let sink = RawSink::new(t_a, t_b);
        let resp = stream_query(ctx, handle, t_a, t_b, sink, "application/octet-stream").await;
        return with_session_header(resp, &session.id);
    }

    // Resume: the rotated session covers [t1, t2 = now]; the previous ID is
    // already invalid.
    let session = ctx.sessions.resume(&ip, token).await?;
    let t_a = session.t1;
    let t_b = session.t2.unwrap_or_else(Utc::now);
    let sink = RawSink::new(t_a, t_b);
    let resp = stream_query(ctx, handle, t_a, t_b, sink, "application/octet-stream").await;
    with_session_header(resp, &session.id)
}

fn with_session_header(mut resp: Response, id: &str) -> Result<Response, ArchiveError> {
    let value = id
        .parse()
        .map_err(|_| ArchiveError::BadRequest("malformed session ID".into()))?;
    resp.headers_mut().insert(SESSION_HEADER, value);
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Channel-to-body streaming
// ---------------------------------------------------------------------------

/// Spawn a producer and stream its reply channel as the response body.
///
/// The first reply is awaited before committing to a status code: a query
/// whose very first reply is an error (empty catalog, out of range) becomes a
/// proper error response instead of a broken stream. Later decode errors are
/// logged and skipped; the binary stream has no way to carry them.
async fn stream_query<S: RecordSink + 'static>(
    ctx: &AppContext,
    handle: &ArchiveHandle,
    t_a: chrono::DateTime<Utc>,
    t_b: chrono::DateTime<Utc>,
    sink: S,
    content_type: &'static str,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Reply>(REPLY_CHANNEL_CAP);
    let cancel = ctx.shutdown.child_token();
    spawn_query(handle.snapshot(), t_a, t_b, tx, &ctx.tracker, cancel, sink);

    match rx.recv().await {
        None => StatusCode::OK.into_response(),
        Some(Err(e)) => e.into_response(),
        Some(Ok(first)) => {
            let rest = ReceiverStream::new(rx).filter_map(|item| match item {
                Ok(bytes) => Some(Ok::<Vec<u8>, std::io::Error>(bytes)),
                Err(e) => {
                    warn!(error = %e, "mid-stream decode error, record dropped from reply");
                    None
                }
            });
            let body = Body::from_stream(
                tokio_stream::once(Ok::<Vec<u8>, std::io::Error>(first)).chain(rest),
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Assemble the API routes over shared state. Transport layers (trace, CORS)
/// are added by the binary.
pub fn router(ctx: AppContext) -> axum::Router {
    use axum::routing::get;
    axum::Router::new()
        .route("/health", get(api_health))
        .route("/archives", get(api_archives))
        .route("/archive/{collector}/{kind}", get(api_archive))
        .route("/archive/{collector}/{kind}/stats", get(api_archive_stats))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Service endpoints
// ---------------------------------------------------------------------------

/// List configured archives with their current entry counts.
pub async fn api_archives(State(ctx): State<AppContext>) -> impl IntoResponse {
    let list: Vec<serde_json::Value> = ctx
        .archives
        .iter()
        .map(|(key, handle)| {
            serde_json::json!({
                "archive": key,
                "collector": handle.collector,
                "kind": handle.discriminator,
                "entries": handle.snapshot().len(),
            })
        })
        .collect();
    Json(serde_json::json!({ "archives": list }))
}

/// Health check: status, version, archive count, uptime.
pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "archives": ctx.archives.len(),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}
