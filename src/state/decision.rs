//! Continuation decision protocol.
//!
//! After a grace period runs out, every connected human votes on how to
//! continue. One vote per player; voting again replaces the earlier choice.
//! The decision is applied once every connected human has voted.
//!
//! The winning choice is the one with the most votes. Ties go to the least
//! disruptive option: skipping the turn beats adding a bot, which beats
//! ending the game.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::connection::ConnectionStatus;
use super::events::{Audience, EndReason, ServerEvent};
use super::game::PlayerId;
use super::pause::PauseState;
use super::session::{Reply, Session, SessionError};

/// What the remaining players can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationChoice {
    SkipTurn,
    AddBot,
    EndGame,
}

impl ContinuationChoice {
    /// In tie-break order.
    pub const ALL: [ContinuationChoice; 3] = [Self::SkipTurn, Self::AddBot, Self::EndGame];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipTurn => "skip_turn",
            Self::AddBot => "add_bot",
            Self::EndGame => "end_game",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SkipTurn => "Skip turn",
            Self::AddBot => "Add bot",
            Self::EndGame => "End game",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SkipTurn => {
                "Skip the disconnected player's turn and keep their seat open in case they return"
            }
            Self::AddBot => "Hand the disconnected player's seat and tiles to a bot for the rest of the game",
            Self::EndGame => "End the game now with no winner",
        }
    }
}

/// An option as presented to voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContinuationOption {
    pub choice: ContinuationChoice,
    pub label: String,
    pub description: String,
}

/// The options offered when a vote opens.
pub fn continuation_options() -> Vec<ContinuationOption> {
    ContinuationChoice::ALL
        .iter()
        .map(|choice| ContinuationOption {
            choice: *choice,
            label: choice.label().to_string(),
            description: choice.description().to_string(),
        })
        .collect()
}

/// Plurality winner of `votes`, ties resolved in [`ContinuationChoice::ALL`]
/// order. `None` if nobody voted.
pub fn tally(votes: &BTreeMap<PlayerId, ContinuationChoice>) -> Option<ContinuationChoice> {
    let mut best: Option<(ContinuationChoice, usize)> = None;
    for choice in ContinuationChoice::ALL {
        let count = votes.values().filter(|v| **v == choice).count();
        if count > 0 && best.map_or(true, |(_, top)| count > top) {
            best = Some((choice, count));
        }
    }
    best.map(|(choice, _)| choice)
}

impl Session {
    pub(crate) fn cast_vote(
        &mut self,
        player_id: PlayerId,
        choice: ContinuationChoice,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        if !self.pause.as_ref().is_some_and(PauseState::is_voting) {
            return Err(SessionError::NoVoteOpen);
        }
        let eligible = self
            .connections
            .get(player_id)
            .is_some_and(|r| !r.is_bot && r.status.is_connected());
        if !eligible {
            return Err(SessionError::NotAVoter);
        }

        if let Some(pause) = self.pause.as_mut() {
            let previous = pause.votes.insert(player_id, choice);
            debug!(
                session_id = %self.id,
                player_id,
                choice = choice.as_str(),
                replaced = previous.is_some(),
                "Vote cast"
            );
        }
        self.evaluate_votes(now);
        Ok(Reply::Ack)
    }

    /// Recount against the players connected right now and apply the
    /// decision once all of them have voted. With nobody connected the vote
    /// stays open until the last held seat is released.
    pub(crate) fn evaluate_votes(&mut self, now: DateTime<Utc>) {
        if self.connections.all_humans_gone() {
            self.finish(EndReason::Abandoned, now);
            return;
        }
        let voters = self.connections.connected_humans();

        let Some(pause) = self.pause.as_mut().filter(|p| p.is_voting()) else {
            return;
        };
        pause.votes.retain(|id, _| voters.contains(id));
        let votes_cast = pause.votes.len();
        let decided = if !voters.is_empty() && votes_cast == voters.len() {
            tally(&pause.votes)
        } else {
            None
        };

        self.emit(
            Audience::All,
            ServerEvent::VotingProgress {
                votes_cast,
                votes_needed: voters.len(),
            },
        );
        if let Some(choice) = decided {
            self.apply_decision(choice, now);
        }
    }

    fn apply_decision(&mut self, choice: ContinuationChoice, now: DateTime<Utc>) {
        let Some(pause) = self.pause.take() else {
            return;
        };
        let target = pause.target_player_id;

        info!(
            session_id = %self.id,
            player_id = target,
            choice = choice.as_str(),
            votes = pause.votes.len(),
            "Continuation decided"
        );
        self.emit(
            Audience::All,
            ServerEvent::ContinuationDecisionMade {
                choice,
                target_player_id: target,
                votes: pause.votes.clone(),
            },
        );

        match choice {
            ContinuationChoice::SkipTurn => {
                self.emit(
                    Audience::All,
                    ServerEvent::TurnSkipped {
                        player_id: target,
                        reason: "skipped by vote".to_string(),
                    },
                );
                match self.game.force_end_turn(now) {
                    Ok(advance) => self.after_advance(advance, now),
                    Err(err) => self.apply_fallback(&err.to_string(), now),
                }
            }
            ContinuationChoice::AddBot => match self.game.convert_to_bot(target) {
                Ok(()) => {
                    self.connections.mark_bot(target, now);
                    self.emit(
                        Audience::All,
                        ServerEvent::PlayerStatusUpdate {
                            player_id: target,
                            status: ConnectionStatus::Connected,
                            reason: Some("replaced by bot".to_string()),
                        },
                    );
                    self.game.resume_turn(pause.preserved.remaining, now);
                    self.emit(
                        Audience::All,
                        ServerEvent::GameResumed {
                            player_id: target,
                            remaining_secs: pause.preserved.remaining.map(|d| d.as_secs()),
                        },
                    );
                    self.broadcast_state();
                }
                Err(err) => self.apply_fallback(&err.to_string(), now),
            },
            ContinuationChoice::EndGame => self.finish(EndReason::VotedEnd, now),
        }
    }
}
