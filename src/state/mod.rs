//! Synchronous session state for MeldCast.
//!
//! This module provides the state machines that make up one session:
//!
//! - `tile` / `meld` - Tiles and meld legality (pure functions)
//! - `game` - Turn state machine: hands, board, pile, whose turn it is
//! - `connection` - Per-seat connection state and disconnect classification
//! - `pause` - Pause and grace period when the player holding the turn drops
//! - `decision` - Continuation vote once a grace period runs out
//! - `session` - The aggregate tying them together, one command at a time
//! - `snapshot` - What gets persisted and how a session is rebuilt
//! - `events` - Notifications the session queues for its participants
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Session                                  │
//! │                                                                       │
//! │   SessionCommand ──▶ handle(cmd, now) ──▶ Result<Reply, SessionError> │
//! │                          │                                            │
//! │        ┌─────────────────┼──────────────────┐                         │
//! │        ▼                 ▼                  ▼                         │
//! │  ┌───────────┐   ┌───────────────┐   ┌──────────────┐                 │
//! │  │   Game    │   │ Connection    │   │ PauseState   │                 │
//! │  │           │   │ Tracker       │   │ (+ votes)    │                 │
//! │  │ hands     │   │               │   │              │                 │
//! │  │ board     │   │ player_id →   │   │ grace period │                 │
//! │  │ pile      │   │   record      │   │ voting       │                 │
//! │  └─────┬─────┘   └───────────────┘   └──────────────┘                 │
//! │        │ is_legal_meld                                                │
//! │        ▼                                                              │
//! │     meld.rs          outbox: Vec<Outbound>   pending_timers()         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in here reads the clock, sleeps, or spawns. Every operation takes
//! `now`, and timers are requested by key and fed back as commands.
//!
//! # Usage
//!
//! ```rust
//! use chrono::Utc;
//! use meldcast_state::state::{Reply, Session, SessionCommand, SessionOptions};
//!
//! let mut session = Session::new("table-1".to_string(), SessionOptions::default(), Utc::now());
//! for name in ["Alice", "Bob"] {
//!     let join = SessionCommand::Join { name: name.to_string(), is_bot: false };
//!     session.handle(join, Utc::now()).unwrap();
//! }
//! session.handle(SessionCommand::Start, Utc::now()).unwrap();
//!
//! let reply = session.handle(SessionCommand::Draw { player_id: 1 }, Utc::now()).unwrap();
//! assert!(matches!(reply, Reply::Drew { .. }));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

pub mod connection;
pub mod decision;
pub mod events;
pub mod game;
pub mod meld;
pub mod pause;
pub mod session;
pub mod snapshot;
pub mod tile;

// Re-export commonly used types
pub use connection::{
    ConnectionQuality, ConnectionRecord, ConnectionStatus, ConnectionTracker, DisconnectReason,
    GracePolicy, InvalidTransition,
};
pub use decision::{continuation_options, tally, ContinuationChoice, ContinuationOption};
pub use events::{Audience, EndReason, Outbound, ServerEvent};
pub use game::{Game, GameError, GamePlayer, GameStatus, PlayerId, TurnAdvance};
pub use meld::{classify_meld, is_legal_meld, meld_value, Meld, MeldKind, INITIAL_MELD_MINIMUM};
pub use pause::{PauseError, PausePhase, PauseReason, PauseState};
pub use session::{
    Reply, Session, SessionCommand, SessionError, SessionId, SessionOptions, TimerKey,
    TimerRequest,
};
pub use snapshot::{SessionSnapshot, SnapshotError};
pub use tile::{Color, Tile, TileId};

/// Convert a std duration for chrono arithmetic. Durations chrono can't
/// represent are capped at a year.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Time from `start` to `now`, zero if `now` is earlier.
pub(crate) fn elapsed_between(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_helpers() {
        let start = Utc::now();
        let later = start + chrono::Duration::seconds(90);

        assert_eq!(elapsed_between(start, later), Duration::from_secs(90));
        assert_eq!(elapsed_between(later, start), Duration::ZERO);
        assert_eq!(to_chrono(Duration::from_secs(30)), chrono::Duration::seconds(30));
    }
}
