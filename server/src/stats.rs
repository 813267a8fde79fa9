//! Per-second UPDATE statistics over a time range.
//!
//! Runs on the same file-iteration driver as the raw engine; only the sink
//! differs. Every record with a readable header inside the widened window is
//! counted; BGP4MP / BGP4MP_ET UPDATE messages additionally contribute to
//! per-second buckets of withdrawn-route, NLRI, and MP reach/unreach tallies.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ArchiveError;
use crate::mrt::{parse_body, BgpMessage, BgpUpdate, CommonHeader, MrtBody, MP_REACH_NLRI, MP_UNREACH_NLRI};
use crate::query::{RecordSink, Reply};
use crate::types::format_compact_time;

// ---------------------------------------------------------------------------
// Aggregation record
// ---------------------------------------------------------------------------

/// The JSON reply of a stats query. The five arrays are parallel, indexed by
/// one-second bucket.
#[derive(Debug, Serialize)]
pub struct BgpStats {
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "End")]
    pub end: String,
    /// Bucket width in seconds; always 1.
    #[serde(rename = "Delta")]
    pub delta: u64,
    #[serde(rename = "TotalMessages")]
    pub total_messages: u64,
    #[serde(rename = "TotalPerDelta")]
    pub total_per_delta: Vec<u64>,
    #[serde(rename = "Withdrawn")]
    pub withdrawn: Vec<u64>,
    #[serde(rename = "NLRI")]
    pub nlri: Vec<u64>,
    #[serde(rename = "MPReach")]
    pub mp_reach: Vec<u64>,
    #[serde(rename = "MPUnreach")]
    pub mp_unreach: Vec<u64>,
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    total: u64,
    withdrawn: u64,
    nlri: u64,
    reach: u64,
    unreach: u64,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Accumulates per-second buckets and emits one JSON blob at the end of the
/// scan. The bucket still accumulating when the last file ends is NOT folded
/// into the arrays; it stays buffered, matching the long-standing behavior
/// of this service's consumers.
pub struct StatsSink {
    t_a: DateTime<Utc>,
    t_b: DateTime<Utc>,
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
    /// Second the current bucket covers; starts at the query's lower bound.
    last_time: i64,
    total_messages: u64,
    bucket: Bucket,
    total_per_delta: Vec<u64>,
    withdrawn: Vec<u64>,
    nlri: Vec<u64>,
    mp_reach: Vec<u64>,
    mp_unreach: Vec<u64>,
}

impl StatsSink {
    pub fn new(t_a: DateTime<Utc>, t_b: DateTime<Utc>) -> Self {
        Self {
            t_a,
            t_b,
            lower: t_a - Duration::seconds(1),
            upper: t_b + Duration::seconds(1),
            last_time: t_a.timestamp(),
            total_messages: 0,
            bucket: Bucket::default(),
            total_per_delta: Vec::new(),
            withdrawn: Vec::new(),
            nlri: Vec::new(),
            mp_reach: Vec::new(),
            mp_unreach: Vec::new(),
        }
    }

    fn push(&mut self, b: Bucket) {
        self.total_per_delta.push(b.total);
        self.withdrawn.push(b.withdrawn);
        self.nlri.push(b.nlri);
        self.mp_reach.push(b.reach);
        self.mp_unreach.push(b.unreach);
    }

    fn accumulate(&mut self, update: &BgpUpdate) {
        self.bucket.total += 1;
        self.bucket.withdrawn += update.withdrawn_routes.len() as u64;
        self.bucket.nlri += update.nlri.len() as u64;
        for attr in &update.path_attributes {
            match attr.type_code {
                MP_REACH_NLRI => self.bucket.reach += 1,
                MP_UNREACH_NLRI => self.bucket.unreach += 1,
                _ => {}
            }
        }
    }

    fn into_stats(self) -> BgpStats {
        BgpStats {
            start: format_compact_time(self.t_a),
            end: format_compact_time(self.t_b),
            delta: 1,
            total_messages: self.total_messages,
            total_per_delta: self.total_per_delta,
            withdrawn: self.withdrawn,
            nlri: self.nlri,
            mp_reach: self.mp_reach,
            mp_unreach: self.mp_unreach,
        }
    }
}

impl RecordSink for StatsSink {
    fn on_record(&mut self, header: &CommonHeader, raw: &[u8], _out: &mpsc::Sender<Reply>) -> bool {
        let t = header.time();
        if t < self.lower || t > self.upper {
            return true;
        }
        self.total_messages += 1;

        let update = match parse_body(header, raw) {
            Ok(MrtBody::Bgp4mp(m)) => match m.message {
                BgpMessage::Update(u) => u,
                BgpMessage::Other(msg_type) => {
                    debug!(msg_type, "non-UPDATE BGP message, skipping analysis");
                    return true;
                }
            },
            // Header already counted; only BGP4MP bodies are analyzed.
            Ok(MrtBody::Other { .. }) => return true,
            Err(e) => {
                debug!(error = %e, "unparseable record body, skipping analysis");
                return true;
            }
        };

        let ds = i64::from(header.timestamp) - self.last_time;
        if ds < 0 {
            warn!(delta = ds, "record timestamp before current bucket, ignoring");
            return true;
        }
        if ds > 0 {
            let full = std::mem::take(&mut self.bucket);
            self.push(full);
            for _ in 1..ds {
                self.push(Bucket::default());
            }
            self.last_time = i64::from(header.timestamp);
        }
        self.accumulate(&update);
        true
    }

    fn finish(&mut self, out: &mpsc::Sender<Reply>) {
        let (t_a, t_b) = (self.t_a, self.t_b);
        let sink = std::mem::replace(self, StatsSink::new(t_a, t_b));
        let reply = serde_json::to_vec(&sink.into_stats())
            .map_err(|e| ArchiveError::Decode(format!("stats encode failed: {e}")));
        let _ = out.blocking_send(reply);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
