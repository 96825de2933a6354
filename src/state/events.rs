//! Outbound notifications.
//!
//! The session never talks to a transport directly. It queues [`Outbound`]
//! values naming who should receive what, and the host delivers them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::ConnectionStatus;
use super::decision::{ContinuationChoice, ContinuationOption};
use super::game::PlayerId;
use super::pause::PauseReason;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A player emptied their hand, or the pile ran dry
    Completed,
    /// The continuation vote chose to end the game
    VotedEnd,
    /// No human seat remained
    Abandoned,
    /// The only human in a bot session left
    SoleHumanLeft,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::VotedEnd => "voted_end",
            Self::Abandoned => "abandoned",
            Self::SoleHumanLeft => "sole_human_left",
        }
    }
}

/// Who receives a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "player_id", rename_all = "snake_case")]
pub enum Audience {
    All,
    Player(PlayerId),
    AllExcept(PlayerId),
}

impl Audience {
    pub fn includes(&self, player_id: PlayerId) -> bool {
        match self {
            Self::All => true,
            Self::Player(id) => *id == player_id,
            Self::AllExcept(id) => *id != player_id,
        }
    }
}

/// Notification payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        session_id: String,
        player_id: PlayerId,
    },
    PlayerJoined {
        player_id: PlayerId,
        name: String,
        is_bot: bool,
    },
    /// Per-player view: shared state plus the recipient's own hand
    GameState {
        state: serde_json::Value,
    },
    TurnTimerTick {
        player_id: PlayerId,
        remaining_secs: u64,
    },
    TurnSkipped {
        player_id: PlayerId,
        reason: String,
    },
    GamePaused {
        reason: PauseReason,
        target_player_id: PlayerId,
        grace_period_secs: u64,
        grace_deadline: DateTime<Utc>,
    },
    GameResumed {
        player_id: PlayerId,
        remaining_secs: Option<u64>,
    },
    ReconnectionSuccessful {
        player_id: PlayerId,
    },
    ReconnectionFailed {
        player_id: PlayerId,
        reason: String,
    },
    GracePeriodExpired {
        target_player_id: PlayerId,
        options: Vec<ContinuationOption>,
    },
    VotingProgress {
        votes_cast: usize,
        votes_needed: usize,
    },
    ContinuationDecisionMade {
        choice: ContinuationChoice,
        target_player_id: PlayerId,
        votes: BTreeMap<PlayerId, ContinuationChoice>,
    },
    FallbackApplied {
        reason: String,
    },
    GameEnded {
        winner: Option<PlayerId>,
        reason: EndReason,
    },
    PlayerStatusUpdate {
        player_id: PlayerId,
        status: ConnectionStatus,
        reason: Option<String>,
    },
    ActionRejected {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Event name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::PlayerJoined { .. } => "player_joined",
            Self::GameState { .. } => "game_state",
            Self::TurnTimerTick { .. } => "turn_timer_tick",
            Self::TurnSkipped { .. } => "turn_skipped",
            Self::GamePaused { .. } => "game_paused",
            Self::GameResumed { .. } => "game_resumed",
            Self::ReconnectionSuccessful { .. } => "reconnection_successful",
            Self::ReconnectionFailed { .. } => "reconnection_failed",
            Self::GracePeriodExpired { .. } => "grace_period_expired",
            Self::VotingProgress { .. } => "voting_progress",
            Self::ContinuationDecisionMade { .. } => "continuation_decision_made",
            Self::FallbackApplied { .. } => "fallback_applied",
            Self::GameEnded { .. } => "game_ended",
            Self::PlayerStatusUpdate { .. } => "player_status_update",
            Self::ActionRejected { .. } => "action_rejected",
        }
    }
}

/// A notification addressed within one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn new(audience: Audience, event: ServerEvent) -> Self {
        Self { audience, event }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.event).unwrap_or(serde_json::Value::Null)
    }
}
