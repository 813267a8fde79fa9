//! Continuous-pull session manager.
//!
//! A single long-lived task owns both session tables and serializes every
//! mutation through a request channel, so there is no shared mutation
//! anywhere. Each live session holds a cancellable expiry timer; rotation
//! cancels the old timer and issues a fresh ID, so the ID a client holds is
//! always the NEXT one and the previous ID dies the moment it is used.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

use crate::error::ArchiveError;
use crate::types::CONT_SESSIONS_PER_IP;

/// A continuous-pull session as handed to the client: the window covered by
/// the next pull is `[t1, t2]`; `t2` is unset until the first resume.
#[derive(Clone, Debug)]
pub struct ContSession {
    pub ip: String,
    pub id: String,
    pub t1: DateTime<Utc>,
    pub t2: Option<DateTime<Utc>>,
}

enum SessionCmd {
    Add { ip: String, reply: oneshot::Sender<Result<ContSession, ArchiveError>> },
    Get { ip: String, id: String, reply: oneshot::Sender<Result<ContSession, ArchiveError>> },
    Expire { id: String },
}

/// Cheap cloneable handle to the manager task.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<SessionCmd>,
}

impl SessionManager {
    /// Spawn the manager task. `ttl` is the idle expiry timeout (30 minutes
    /// in production; tests inject something shorter).
    pub fn spawn(tracker: &TaskTracker, ttl: Duration, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let timer_tx = tx.clone();
        tracker.spawn(run(rx, timer_tx, ttl, shutdown));
        Self { tx }
    }

    /// Open a new session for a client IP.
    pub async fn begin(&self, ip: &str) -> Result<ContSession, ArchiveError> {
        self.request(|reply| SessionCmd::Add { ip: ip.to_string(), reply }).await
    }

    /// Resume a session: rotates the ID and advances the pull window.
    pub async fn resume(&self, ip: &str, id: &str) -> Result<ContSession, ArchiveError> {
        self.request(|reply| SessionCmd::Get { ip: ip.to_string(), id: id.to_string(), reply })
            .await
    }

    async fn request<F>(&self, make: F) -> Result<ContSession, ArchiveError>
    where
        F: FnOnce(oneshot::Sender<Result<ContSession, ArchiveError>>) -> SessionCmd,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| manager_stopped())?;
        reply_rx.await.map_err(|_| manager_stopped())?
    }
}

fn manager_stopped() -> ArchiveError {
    ArchiveError::Io(std::io::Error::other("session manager stopped"))
}

// ---------------------------------------------------------------------------
// Manager task
// ---------------------------------------------------------------------------

struct Live {
    ip: String,
    t1: DateTime<Utc>,
    t2: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

async fn run(
    mut rx: mpsc::Receiver<SessionCmd>,
    timer_tx: mpsc::Sender<SessionCmd>,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    let mut by_id: HashMap<String, Live> = HashMap::new();
    let mut by_ip: HashMap<String, Vec<String>> = HashMap::new();

    loop {
        let cmd = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(c) => c,
                None => break,
            },
        };

        match cmd {
            SessionCmd::Add { ip, reply } => {
                if by_ip.get(&ip).is_some_and(|ids| ids.len() >= CONT_SESSIONS_PER_IP) {
                    let _ = reply.send(Err(ArchiveError::SessionFull(ip)));
                    continue;
                }
                let id = fresh_id();
                let now = Utc::now();
                let cancel = start_timer(&timer_tx, &id, ttl);
                by_ip.entry(ip.clone()).or_default().push(id.clone());
                by_id.insert(id.clone(), Live { ip: ip.clone(), t1: now, t2: None, cancel });
                debug!(ip = ip.as_str(), id = id.as_str(), "continuous session opened");
                let _ = reply.send(Ok(ContSession { ip, id, t1: now, t2: None }));
            }

            SessionCmd::Get { ip, id, reply } => {
                let Some(old) = by_id.remove(&id) else {
                    let result = match by_ip.get(&ip) {
                        Some(ids) if !ids.is_empty() => Err(ArchiveError::StrayId(ids.clone())),
                        _ => Err(ArchiveError::UnknownSession),
                    };
                    let _ = reply.send(result);
                    continue;
                };

                // The cancel path makes the timer task exit quietly.
                old.cancel.cancel();
                if let Some(ids) = by_ip.get_mut(&old.ip) {
                    ids.retain(|s| s != &id);
                }

                let new_id = fresh_id();
                let now = Utc::now();
                let t1 = old.t2.unwrap_or(old.t1);
                let cancel = start_timer(&timer_tx, &new_id, ttl);
                by_ip.entry(old.ip.clone()).or_default().push(new_id.clone());
                by_id.insert(
                    new_id.clone(),
                    Live { ip: old.ip.clone(), t1, t2: Some(now), cancel },
                );
                debug!(old = id.as_str(), new = new_id.as_str(), "continuous session rotated");
                let _ = reply.send(Ok(ContSession {
                    ip: old.ip,
                    id: new_id,
                    t1,
                    t2: Some(now),
                }));
            }

            SessionCmd::Expire { id } => {
                if let Some(live) = by_id.remove(&id) {
                    if let Some(ids) = by_ip.get_mut(&live.ip) {
                        ids.retain(|s| s != &id);
                        if ids.is_empty() {
                            by_ip.remove(&live.ip);
                        }
                    }
                    debug!(id = id.as_str(), "continuous session expired");
                }
            }
        }
    }
}

/// 128-bit random session ID rendered as 32 hex characters.
fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Start a session's expiry timer. Cancelling the returned token makes the
/// timer task exit without firing.
fn start_timer(tx: &mpsc::Sender<SessionCmd>, id: &str, ttl: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let watch = token.clone();
    let tx = tx.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = watch.cancelled() => {}
            _ = tokio::time::sleep(ttl) => {
                let _ = tx.send(SessionCmd::Expire { id }).await;
            }
        }
    });
    token
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
