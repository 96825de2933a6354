//! Pause & grace-period control.
//!
//! When the player holding the turn drops, the turn clock is frozen and the
//! seat is held for a grace period sized by the connection's profile. The
//! player either comes back in time and the turn resumes where it stopped, or
//! the window closes and the remaining players vote on how to continue.
//!
//! # State Diagram
//!
//! ```text
//!                 current player drops
//! ┌─────────┐ ───────────────────────────▶ ┌─────────────┐
//! │ Running │                              │ GracePeriod │
//! └─────────┘ ◀─────────────────────────── └──────┬──────┘
//!    ▲  ▲          target reconnects              │ deadline
//!    │  │                                         ▼
//!    │  │      target reconnects           ┌─────────────┐
//!    │  └──────────────────────────────────│   Voting    │
//!    │                                     └──────┬──────┘
//!    └────────────────────────────────────────────┘
//!               decision applied (skip_turn / add_bot)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::connection::{ConnectionStatus, DisconnectReason};
use super::decision::{continuation_options, ContinuationChoice};
use super::elapsed_between;
use super::events::{Audience, EndReason, ServerEvent};
use super::game::{GameError, PlayerId};
use super::session::{Reply, Session, SessionError};

/// Why the game was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    CurrentPlayerDisconnect,
    NetworkInstability,
    MultipleDisconnects,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentPlayerDisconnect => "CURRENT_PLAYER_DISCONNECT",
            Self::NetworkInstability => "NETWORK_INSTABILITY",
            Self::MultipleDisconnects => "MULTIPLE_DISCONNECTS",
        }
    }
}

/// Where a pause currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePhase {
    /// Waiting for the target to come back
    GracePeriod,
    /// Window closed; remaining players are choosing
    Voting,
}

/// Turn state frozen at the moment of the pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreservedTurn {
    /// Clock left on the turn, floored at zero; `None` without a turn limit
    pub remaining: Option<Duration>,
    pub current_player_index: usize,
    pub turn_epoch: u64,
}

/// A paused session.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseState {
    /// Distinguishes this pause from any earlier one
    pub id: u64,
    pub reason: PauseReason,
    pub target_player_id: PlayerId,
    pub paused_at: DateTime<Utc>,
    pub grace_period: Duration,
    pub grace_deadline: DateTime<Utc>,
    pub preserved: PreservedTurn,
    pub phase: PausePhase,
    pub(crate) votes: BTreeMap<PlayerId, ContinuationChoice>,
}

impl PauseState {
    pub fn votes(&self) -> &BTreeMap<PlayerId, ContinuationChoice> {
        &self.votes
    }

    pub fn is_voting(&self) -> bool {
        self.phase == PausePhase::Voting
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "reason": self.reason.as_str(),
            "target_player_id": self.target_player_id,
            "paused_at": self.paused_at,
            "grace_period_secs": self.grace_period.as_secs(),
            "grace_deadline": self.grace_deadline,
            "phase": self.phase,
            "remaining_turn_secs": self.preserved.remaining.map(|d| d.as_secs()),
            "votes_cast": self.votes.len()
        })
    }
}

/// Reasons a pause could not be put in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PauseError {
    #[error("Game is not in progress")]
    NotActive,
    #[error("Game is already paused")]
    AlreadyPaused,
    #[error("Player {0} does not hold the turn")]
    NotCurrentPlayer(PlayerId),
    #[error("Player {0} has no connection record")]
    UnknownPlayer(PlayerId),
    #[error("Player {0} has no grace window")]
    NoGraceWindow(PlayerId),
}

impl Session {
    /// Whether losing `player_id` right now should pause the game.
    pub fn should_pause(&self, player_id: PlayerId) -> bool {
        self.is_started()
            && !self.is_finished()
            && self.game.winner.is_none()
            && self.game.is_player_turn(player_id)
            && !self.is_paused()
            && !self.is_bot_session()
    }

    /// Freeze the running turn and hold `player_id`'s seat.
    pub(crate) fn pause_for(
        &mut self,
        player_id: PlayerId,
        now: DateTime<Utc>,
    ) -> Result<(), PauseError> {
        if !self.game.status.is_active() {
            return Err(PauseError::NotActive);
        }
        if self.is_paused() {
            return Err(PauseError::AlreadyPaused);
        }
        if self.game.current_player_id() != Some(player_id) {
            return Err(PauseError::NotCurrentPlayer(player_id));
        }

        let record = self
            .connections
            .get(player_id)
            .ok_or(PauseError::UnknownPlayer(player_id))?;
        let grace_deadline = record
            .grace_deadline
            .ok_or(PauseError::NoGraceWindow(player_id))?;

        let others_absent = self
            .connections
            .absent_humans()
            .iter()
            .any(|id| *id != player_id);
        let reason = if others_absent {
            PauseReason::MultipleDisconnects
        } else if record.last_reason == Some(DisconnectReason::NetworkInstability) {
            PauseReason::NetworkInstability
        } else {
            PauseReason::CurrentPlayerDisconnect
        };

        let preserved = PreservedTurn {
            remaining: self.game.remaining_turn_time(now),
            current_player_index: self.game.current_player_index,
            turn_epoch: self.game.turn_epoch(),
        };
        let grace_period = elapsed_between(now, grace_deadline);

        self.next_pause_id += 1;
        self.pause = Some(PauseState {
            id: self.next_pause_id,
            reason,
            target_player_id: player_id,
            paused_at: now,
            grace_period,
            grace_deadline,
            preserved,
            phase: PausePhase::GracePeriod,
            votes: BTreeMap::new(),
        });

        info!(
            session_id = %self.id,
            player_id,
            reason = reason.as_str(),
            grace_secs = grace_period.as_secs(),
            "Game paused"
        );
        self.emit(
            Audience::All,
            ServerEvent::GamePaused {
                reason,
                target_player_id: player_id,
                grace_period_secs: grace_period.as_secs(),
                grace_deadline,
            },
        );
        Ok(())
    }

    /// Clear the pause and give the turn back with its preserved clock.
    pub(crate) fn resume_from_pause(&mut self, now: DateTime<Utc>) {
        let Some(pause) = self.pause.take() else {
            return;
        };

        self.game.current_player_index = pause.preserved.current_player_index;
        self.game.resume_turn(pause.preserved.remaining, now);

        info!(session_id = %self.id, player_id = pause.target_player_id, "Game resumed");
        self.emit(
            Audience::All,
            ServerEvent::GameResumed {
                player_id: pause.target_player_id,
                remaining_secs: pause.preserved.remaining.map(|d| d.as_secs()),
            },
        );
        self.broadcast_state();
    }

    /// Give up on the pause/decision machinery and move the game on.
    pub(crate) fn apply_fallback(&mut self, reason: &str, now: DateTime<Utc>) {
        warn!(session_id = %self.id, reason, "Applying fallback: advancing turn");
        self.pause = None;
        self.emit(
            Audience::All,
            ServerEvent::FallbackApplied {
                reason: reason.to_string(),
            },
        );
        if let Ok(advance) = self.game.force_end_turn(now) {
            self.after_advance(advance, now);
        }
    }

    pub(crate) fn on_disconnect(
        &mut self,
        player_id: PlayerId,
        raw_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        let policy = self.options.grace;
        let record = self
            .connections
            .get_mut(player_id)
            .ok_or(GameError::UnknownPlayer)?;
        if record.is_bot || !record.status.is_connected() {
            debug!(session_id = %self.id, player_id, "Disconnect signal ignored");
            return Ok(Reply::Ignored);
        }

        let reason = record.disconnect(raw_reason, &policy, now)?;
        self.emit(
            Audience::All,
            ServerEvent::PlayerStatusUpdate {
                player_id,
                status: ConnectionStatus::Disconnecting,
                reason: Some(reason.as_str().to_string()),
            },
        );
        info!(session_id = %self.id, player_id, reason = reason.as_str(), "Player disconnected");

        if !self.is_started() || self.is_finished() {
            return Ok(Reply::Ack);
        }
        if self.is_bot_session() {
            self.finish(EndReason::SoleHumanLeft, now);
            return Ok(Reply::Ack);
        }
        if self.pause.as_ref().is_some_and(PauseState::is_voting) {
            self.evaluate_votes(now);
            return Ok(Reply::Ack);
        }
        if self.should_pause(player_id) {
            if let Err(err) = self.pause_for(player_id, now) {
                self.apply_fallback(&err.to_string(), now);
            }
        }
        Ok(Reply::Ack)
    }

    pub(crate) fn on_reconnect_attempt(
        &mut self,
        player_id: PlayerId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        let record = self
            .connections
            .get(player_id)
            .ok_or(GameError::UnknownPlayer)?;

        let refusal = if record.is_bot {
            Some("seat is now played by a bot")
        } else if self.is_finished() {
            Some("session has ended")
        } else {
            None
        };
        if let Some(reason) = refusal {
            debug!(session_id = %self.id, player_id, reason, "Reconnect refused");
            self.emit(
                Audience::Player(player_id),
                ServerEvent::ReconnectionFailed {
                    player_id,
                    reason: reason.to_string(),
                },
            );
            return Ok(Reply::ReconnectRejected);
        }

        if let Some(record) = self.connections.get_mut(player_id) {
            record.begin_reconnect(attempt, now)?;
            record.complete_reconnect(now)?;
        }

        info!(session_id = %self.id, player_id, attempt, "Player reconnected");
        self.emit(
            Audience::All,
            ServerEvent::PlayerStatusUpdate {
                player_id,
                status: ConnectionStatus::Connected,
                reason: None,
            },
        );
        self.emit(
            Audience::All,
            ServerEvent::ReconnectionSuccessful { player_id },
        );

        let target = self.pause.as_ref().map(|p| p.target_player_id);
        if target == Some(player_id) {
            self.resume_from_pause(now);
        } else {
            if self.pause.as_ref().is_some_and(PauseState::is_voting) {
                self.evaluate_votes(now);
            }
            self.broadcast_state();
        }
        Ok(Reply::Reconnected)
    }

    /// The pause's grace window closed without the target returning.
    pub(crate) fn on_grace_expired(&mut self, pause_id: u64, now: DateTime<Utc>) -> Reply {
        let target = match &self.pause {
            Some(p) if p.id == pause_id && p.phase == PausePhase::GracePeriod => {
                p.target_player_id
            }
            _ => {
                debug!(session_id = %self.id, pause_id, "Stale grace timer ignored");
                return Reply::Ignored;
            }
        };

        self.expire_seat(target, "grace period expired", now);

        if self.connections.all_humans_gone() {
            self.finish(EndReason::Abandoned, now);
            return Reply::Ack;
        }
        // Voters still inside their own window can vote once they return.
        let voters = self.connections.connected_humans();

        if let Some(pause) = self.pause.as_mut() {
            pause.phase = PausePhase::Voting;
            pause.votes.clear();
        }

        info!(session_id = %self.id, player_id = target, voters = voters.len(), "Grace period expired, voting opened");
        self.emit(
            Audience::All,
            ServerEvent::GracePeriodExpired {
                target_player_id: target,
                options: continuation_options(),
            },
        );
        self.emit(
            Audience::All,
            ServerEvent::VotingProgress {
                votes_cast: 0,
                votes_needed: voters.len(),
            },
        );
        Reply::Ack
    }

    /// A seat that was not holding the turn ran out of reconnect time.
    pub(crate) fn on_reconnect_window_expired(
        &mut self,
        player_id: PlayerId,
        disconnect_seq: u64,
        now: DateTime<Utc>,
    ) -> Reply {
        let current = self.connections.get(player_id).is_some_and(|r| {
            !r.is_bot
                && r.disconnect_seq == disconnect_seq
                && matches!(
                    r.status,
                    ConnectionStatus::Disconnecting | ConnectionStatus::Reconnecting
                )
        });
        let is_pause_target = self
            .pause
            .as_ref()
            .is_some_and(|p| p.target_player_id == player_id);
        if !current || is_pause_target {
            debug!(session_id = %self.id, player_id, disconnect_seq, "Stale reconnect timer ignored");
            return Reply::Ignored;
        }

        self.expire_seat(player_id, "grace period expired", now);
        if self.pause.as_ref().is_some_and(PauseState::is_voting) {
            self.evaluate_votes(now);
        } else if !self.is_paused() && self.game.is_player_turn(player_id) {
            // Released while the turn was waiting on them
            self.settle_current_seat(now);
            self.broadcast_state();
        }
        Reply::Ack
    }

    fn expire_seat(&mut self, player_id: PlayerId, reason: &str, now: DateTime<Utc>) {
        let Some(record) = self.connections.get_mut(player_id) else {
            return;
        };
        if record.status.is_connected() || record.status == ConnectionStatus::Disconnected {
            return;
        }
        if record.expire(reason, now).is_ok() {
            info!(session_id = %self.id, player_id, "Seat released");
            self.emit(
                Audience::All,
                ServerEvent::PlayerStatusUpdate {
                    player_id,
                    status: ConnectionStatus::Disconnected,
                    reason: Some(reason.to_string()),
                },
            );
        }
    }
}
