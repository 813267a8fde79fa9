//! Error taxonomy shared by the catalog, query engines, session manager, and
//! HTTP surface.
//!
//! User-facing errors are emitted as a single `Err` reply on a query channel
//! and then the channel closes. Mid-stream record decode errors emit a reply
//! but do not terminate the scan. Nothing in here is ever fatal to the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Missing or malformed query parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unparseable timestamp, or `end` before `start`.
    #[error("bad date: {0}")]
    BadDate(String),

    /// The archive catalog holds no entries.
    #[error("archive is empty")]
    Empty,

    /// The request window lies entirely outside the catalog.
    #[error("requested range is outside the archive")]
    OutOfRange,

    /// The request window exceeds the 24-hour cap.
    #[error("requested range exceeds 24 hours")]
    TooLarge,

    /// Named archive does not exist.
    #[error("no such archive: {0}")]
    NotFound(String),

    /// A record failed header or body decoding mid-stream. The scan continues.
    #[error("record decode failed: {0}")]
    Decode(String),

    /// The client IP already holds the maximum number of continuous sessions.
    #[error("session limit reached for {0}")]
    SessionFull(String),

    /// Session ID is unknown and the IP holds no other sessions.
    #[error("non-existent session ID")]
    UnknownSession,

    /// Session ID is unknown but the IP holds other live sessions.
    #[error("unknown ID for this address; live sessions: {}", .0.join(", "))]
    StrayId(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// HTTP status for this error when it surfaces at the request level.
    pub fn status(&self) -> StatusCode {
        match self {
            ArchiveError::BadRequest(_) | ArchiveError::BadDate(_) | ArchiveError::TooLarge => {
                StatusCode::BAD_REQUEST
            }
            ArchiveError::Empty
            | ArchiveError::OutOfRange
            | ArchiveError::NotFound(_)
            | ArchiveError::UnknownSession
            | ArchiveError::StrayId(_) => StatusCode::NOT_FOUND,
            ArchiveError::SessionFull(_) => StatusCode::TOO_MANY_REQUESTS,
            ArchiveError::Decode(_) | ArchiveError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ArchiveError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
