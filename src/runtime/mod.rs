//! Async host for sessions.
//!
//! - `supervisor` - Creates sessions, maps transport connections to seats,
//!   routes commands, restores persisted sessions, reclaims finished ones
//! - `actor` - One task per session applying commands strictly in order
//! - `timer` - Cancellable sleeps standing in for the session's deadlines
//!
//! ```text
//! transport ──▶ Supervisor ──▶ SessionHandle ──mpsc──▶ actor task
//!                                                         │
//!                         Delivery ◀── outbox ◀── Session::handle
//!                                                         │
//!                                   TimerSet ◀── pending_timers()
//!                                   SaveQueue ◀── snapshot()
//! ```

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::persistence::PersistenceError;
use crate::state::events::{Audience, ServerEvent};
use crate::state::session::{SessionError, SessionId};
use crate::state::snapshot::SnapshotError;
use crate::state::to_chrono;

pub mod actor;
pub mod supervisor;
pub mod timer;

pub use actor::SessionHandle;
pub use supervisor::{ConnectionId, Seat, Supervisor};
pub use timer::TimerSet;

/// A notification leaving a session, for the transport to fan out.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub session_id: SessionId,
    pub audience: Audience,
    pub event: ServerEvent,
}

/// Wall-clock time derived from the runtime's monotonic clock.
///
/// Follows tokio's paused clock in tests, so deadlines computed by sessions
/// line up with the sleeps armed for them.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.origin_utc + to_chrono(self.origin.elapsed())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
    #[error("Connection {0} is not seated in any session")]
    UnknownConnection(String),
    #[error("Session {0} is no longer running")]
    SessionClosed(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::SessionClosed(_) => "session_closed",
            Self::Session(err) => err.code(),
            Self::Snapshot(_) => "invalid_snapshot",
            Self::Persistence(_) => "persistence_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_runtime_time() {
        let clock = Clock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(45)).await;

        assert_eq!(clock.now() - start, chrono::Duration::seconds(45));
    }
}
