//! Session aggregate.
//!
//! A session composes the turn state machine, the connection tracker, and the
//! pause/continuation machinery for one game. Every mutation goes through
//! [`Session::handle`], which the host must call serially: one command at a
//! time, in arrival order. Timer expiries come in as ordinary commands.
//!
//! The session never sleeps or schedules anything itself. It reports the
//! deadlines it wants through [`Session::pending_timers`], each keyed by the
//! state it protects, and ignores fired timers whose key no longer matches.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::connection::{
    ConnectionRecord, ConnectionStatus, ConnectionTracker, GracePolicy, InvalidTransition,
};
use super::decision::ContinuationChoice;
use super::events::{Audience, EndReason, Outbound, ServerEvent};
use super::game::{Game, GameError, GamePlayer, PlayerId, TurnAdvance};
use super::pause::{PausePhase, PauseState};
use super::tile::{shuffled_set, TileId};

/// Session identifier.
pub type SessionId = String;

/// Default per-turn limit (2 minutes).
pub const DEFAULT_TURN_TIME_LIMIT: Duration = Duration::from_secs(120);

/// Tiles dealt to each seat.
pub const DEFAULT_HAND_SIZE: usize = 14;

/// Seats needed to start.
pub const DEFAULT_MIN_PLAYERS: usize = 2;

/// Seats allowed.
pub const DEFAULT_MAX_PLAYERS: usize = 4;

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub turn_time_limit: Option<Duration>,
    pub grace: GracePolicy,
    pub min_players: usize,
    pub max_players: usize,
    pub hand_size: usize,
    /// Fixed shuffle seed
    pub seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            turn_time_limit: Some(DEFAULT_TURN_TIME_LIMIT),
            grace: GracePolicy::default(),
            min_players: DEFAULT_MIN_PLAYERS,
            max_players: DEFAULT_MAX_PLAYERS,
            hand_size: DEFAULT_HAND_SIZE,
            seed: None,
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Join {
        name: String,
        is_bot: bool,
    },
    Start,
    Draw {
        player_id: PlayerId,
    },
    PlaySet {
        player_id: PlayerId,
        selection: Vec<Vec<TileId>>,
    },
    UpdateBoard {
        player_id: PlayerId,
        layout: Vec<Vec<TileId>>,
        from_hand: Vec<TileId>,
    },
    Undo {
        player_id: PlayerId,
    },
    EndTurn {
        player_id: PlayerId,
    },
    Disconnected {
        player_id: PlayerId,
        raw_reason: String,
    },
    ReconnectAttempt {
        player_id: PlayerId,
        attempt: u32,
    },
    ReportMetrics {
        player_id: PlayerId,
        latency_ms: u32,
        is_mobile: bool,
    },
    Vote {
        player_id: PlayerId,
        choice: ContinuationChoice,
    },
    TimerFired(TimerKey),
}

impl SessionCommand {
    /// The player an error should be reported to, if any.
    pub fn actor(&self) -> Option<PlayerId> {
        match self {
            Self::Draw { player_id }
            | Self::PlaySet { player_id, .. }
            | Self::UpdateBoard { player_id, .. }
            | Self::Undo { player_id }
            | Self::EndTurn { player_id }
            | Self::ReconnectAttempt { player_id, .. }
            | Self::Vote { player_id, .. } => Some(*player_id),
            Self::Join { .. }
            | Self::Start
            | Self::Disconnected { .. }
            | Self::ReportMetrics { .. }
            | Self::TimerFired(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Start => "start",
            Self::Draw { .. } => "draw",
            Self::PlaySet { .. } => "play_set",
            Self::UpdateBoard { .. } => "update_board",
            Self::Undo { .. } => "undo",
            Self::EndTurn { .. } => "end_turn",
            Self::Disconnected { .. } => "disconnected",
            Self::ReconnectAttempt { .. } => "reconnect_attempt",
            Self::ReportMetrics { .. } => "report_metrics",
            Self::Vote { .. } => "vote",
            Self::TimerFired(_) => "timer_fired",
        }
    }
}

/// Identity of the state a timer protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    Turn { epoch: u64 },
    Grace { pause_id: u64 },
    Reconnect { player_id: PlayerId, disconnect_seq: u64 },
}

/// A deadline the session wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub key: TimerKey,
    pub deadline: DateTime<Utc>,
}

/// Successful command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Joined { player_id: PlayerId },
    Drew { tile_id: TileId },
    Reconnected,
    ReconnectRejected,
    /// Stale or irrelevant event; nothing changed
    Ignored,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Connection(#[from] InvalidTransition),
    #[error("Session is full")]
    Full,
    #[error("Session has ended")]
    Ended,
    #[error("Game is paused")]
    Paused,
    #[error("No continuation vote is open")]
    NoVoteOpen,
    #[error("Only connected players may vote")]
    NotAVoter,
}

impl SessionError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Game(err) => err.code(),
            Self::Connection(_) => "invalid_connection_transition",
            Self::Full => "session_full",
            Self::Ended => "session_ended",
            Self::Paused => "game_paused",
            Self::NoVoteOpen => "no_vote_open",
            Self::NotAVoter => "not_a_voter",
        }
    }
}

/// One multiplayer game from creation to completion or abandonment.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub(crate) game: Game,
    pub(crate) connections: ConnectionTracker,
    pub(crate) pause: Option<PauseState>,
    pub(crate) options: SessionOptions,
    pub(crate) end_reason: Option<EndReason>,
    pub(crate) next_player_id: PlayerId,
    pub(crate) next_pause_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every state change, however close together
    revision: u64,
    outbox: Vec<Outbound>,
}

impl Session {
    pub fn new(id: SessionId, options: SessionOptions, now: DateTime<Utc>) -> Self {
        let game = Game::new(id.clone(), options.turn_time_limit);
        Self {
            id,
            game,
            connections: ConnectionTracker::new(),
            pause: None,
            options,
            end_reason: None,
            next_player_id: 1,
            next_pause_id: 0,
            created_at: now,
            updated_at: now,
            revision: 0,
            outbox: Vec::new(),
        }
    }

    // Accessors

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn pause(&self) -> Option<&PauseState> {
        self.pause.as_ref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn is_started(&self) -> bool {
        self.game.started_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    /// Finished sessions are ready to be reclaimed.
    pub fn is_finished(&self) -> bool {
        self.end_reason.is_some()
    }

    pub fn winner(&self) -> Option<PlayerId> {
        self.game.winner
    }

    /// A session of bots plus exactly one human.
    pub fn is_bot_session(&self) -> bool {
        self.connections.bot_count() > 0 && self.connections.human_count() == 1
    }

    /// Drain queued notifications.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// The bot seat that should act next, if any.
    pub fn bot_to_move(&self) -> Option<PlayerId> {
        if self.is_finished() || self.is_paused() || !self.game.status.is_active() {
            return None;
        }
        self.game.current_player().filter(|p| p.is_bot).map(|p| p.id)
    }

    /// Apply one command.
    ///
    /// Rejected commands leave the session unchanged and queue an
    /// `action_rejected` notification for the acting player.
    pub fn handle(
        &mut self,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        let actor = command.actor();
        let name = command.name();
        let result = self.dispatch(command, now);

        match &result {
            Ok(reply) => {
                if *reply != Reply::Ignored {
                    self.touch(now);
                }
                debug!(session_id = %self.id, command = name, ?reply, "Command applied");
            }
            Err(err) => {
                debug!(session_id = %self.id, command = name, code = err.code(), "Command rejected");
                if let Some(player_id) = actor {
                    self.emit(
                        Audience::Player(player_id),
                        ServerEvent::ActionRejected {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }

        self.check_abandoned(now);
        result
    }

    fn dispatch(&mut self, command: SessionCommand, now: DateTime<Utc>) -> Result<Reply, SessionError> {
        match command {
            SessionCommand::Join { name, is_bot } => self.join(name, is_bot),
            SessionCommand::Start => self.start(now),
            SessionCommand::Draw { player_id } => {
                self.ensure_playable()?;
                let tile_id = self.game.draw_tile(player_id)?;
                self.broadcast_state();
                Ok(Reply::Drew { tile_id })
            }
            SessionCommand::PlaySet {
                player_id,
                selection,
            } => {
                self.ensure_playable()?;
                let outcome = self.game.play_set(player_id, &selection, now)?;
                self.after_play(outcome.winner, now);
                Ok(Reply::Ack)
            }
            SessionCommand::UpdateBoard {
                player_id,
                layout,
                from_hand,
            } => {
                self.ensure_playable()?;
                let outcome = self
                    .game
                    .update_board(player_id, &layout, &from_hand, now)?;
                self.after_play(outcome.winner, now);
                Ok(Reply::Ack)
            }
            SessionCommand::Undo { player_id } => {
                self.ensure_playable()?;
                self.game.undo_turn(player_id)?;
                self.broadcast_state();
                Ok(Reply::Ack)
            }
            SessionCommand::EndTurn { player_id } => {
                self.ensure_playable()?;
                let advance = self.game.end_turn(player_id, now)?;
                self.after_advance(advance, now);
                Ok(Reply::Ack)
            }
            SessionCommand::Disconnected {
                player_id,
                raw_reason,
            } => self.on_disconnect(player_id, &raw_reason, now),
            SessionCommand::ReconnectAttempt { player_id, attempt } => {
                self.on_reconnect_attempt(player_id, attempt, now)
            }
            SessionCommand::ReportMetrics {
                player_id,
                latency_ms,
                is_mobile,
            } => {
                let record = self
                    .connections
                    .get_mut(player_id)
                    .ok_or(GameError::UnknownPlayer)?;
                record.record_metrics(latency_ms, is_mobile);
                Ok(Reply::Ack)
            }
            SessionCommand::Vote { player_id, choice } => self.cast_vote(player_id, choice, now),
            SessionCommand::TimerFired(key) => Ok(self.on_timer(key, now)),
        }
    }

    fn join(&mut self, name: String, is_bot: bool) -> Result<Reply, SessionError> {
        if self.is_finished() {
            return Err(SessionError::Ended);
        }
        if self.is_started() {
            return Err(GameError::AlreadyStarted.into());
        }
        if self.game.player_count() >= self.options.max_players {
            return Err(SessionError::Full);
        }

        let player_id = self.next_player_id;
        self.game
            .add_player(GamePlayer::new(player_id, name.clone(), is_bot))?;
        self.next_player_id += 1;

        let record = if is_bot {
            ConnectionRecord::new_bot(player_id)
        } else {
            ConnectionRecord::new(player_id)
        };
        self.connections.add(record);

        info!(session_id = %self.id, player_id, %name, is_bot, "Player joined");
        self.emit(
            Audience::All,
            ServerEvent::PlayerJoined {
                player_id,
                name,
                is_bot,
            },
        );
        self.broadcast_state();
        Ok(Reply::Joined { player_id })
    }

    fn start(&mut self, now: DateTime<Utc>) -> Result<Reply, SessionError> {
        if self.is_finished() {
            return Err(SessionError::Ended);
        }
        if self.game.player_count() < self.options.min_players {
            return Err(GameError::NotEnoughPlayers.into());
        }

        let pile = shuffled_set(self.options.seed);
        self.game.start(pile, self.options.hand_size, now)?;
        info!(session_id = %self.id, players = self.game.player_count(), "Session started");
        self.settle_current_seat(now);
        self.broadcast_state();
        Ok(Reply::Ack)
    }

    fn ensure_playable(&self) -> Result<(), SessionError> {
        if self.is_finished() {
            return Err(SessionError::Ended);
        }
        if self.is_paused() {
            return Err(SessionError::Paused);
        }
        Ok(())
    }

    fn after_play(&mut self, winner: Option<PlayerId>, now: DateTime<Utc>) {
        self.broadcast_state();
        if winner.is_some() {
            self.finish(EndReason::Completed, now);
        }
    }

    /// Follow-up after the turn moved on.
    pub(crate) fn after_advance(&mut self, advance: TurnAdvance, now: DateTime<Utc>) {
        match advance {
            TurnAdvance::GameOver { .. } => {
                self.broadcast_state();
                self.finish(EndReason::Completed, now);
            }
            TurnAdvance::Next { .. } => {
                self.settle_current_seat(now);
                self.broadcast_state();
            }
        }
    }

    /// Make sure someone can take the turn that just opened. Seats whose
    /// grace period ran out are skipped. A seat still inside its window keeps
    /// the turn on the normal clock: only dropping while holding the turn
    /// pauses the game.
    pub(crate) fn settle_current_seat(&mut self, now: DateTime<Utc>) {
        for _ in 0..self.game.player_count() {
            if !self.game.status.is_active() || self.is_paused() {
                return;
            }
            let Some(player_id) = self.game.current_player_id() else {
                return;
            };
            let status = match self.connections.get(player_id) {
                Some(record) if !record.is_bot => record.status,
                _ => return,
            };

            match status {
                ConnectionStatus::Connected
                | ConnectionStatus::Disconnecting
                | ConnectionStatus::Reconnecting => return,
                ConnectionStatus::Disconnected => {
                    debug!(session_id = %self.id, player_id, "Skipping absent seat");
                    self.emit(
                        Audience::All,
                        ServerEvent::TurnSkipped {
                            player_id,
                            reason: "player disconnected".to_string(),
                        },
                    );
                    match self.game.force_end_turn(now) {
                        Ok(TurnAdvance::Next { .. }) => continue,
                        Ok(TurnAdvance::GameOver { .. }) => {
                            self.finish(EndReason::Completed, now);
                            return;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey, now: DateTime<Utc>) -> Reply {
        if self.is_finished() {
            return Reply::Ignored;
        }
        match key {
            TimerKey::Turn { epoch } => self.on_turn_timeout(epoch, now),
            TimerKey::Grace { pause_id } => self.on_grace_expired(pause_id, now),
            TimerKey::Reconnect {
                player_id,
                disconnect_seq,
            } => self.on_reconnect_window_expired(player_id, disconnect_seq, now),
        }
    }

    fn on_turn_timeout(&mut self, epoch: u64, now: DateTime<Utc>) -> Reply {
        if self.is_paused() || !self.game.status.is_active() || epoch != self.game.turn_epoch() {
            debug!(session_id = %self.id, epoch, "Stale turn timer ignored");
            return Reply::Ignored;
        }

        let player_id = self.game.current_player_id();
        match self.game.force_end_turn(now) {
            Ok(advance) => {
                info!(session_id = %self.id, ?player_id, "Turn timed out");
                self.after_advance(advance, now);
                Reply::Ack
            }
            Err(_) => Reply::Ignored,
        }
    }

    /// End the session. Later calls are no-ops.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.revision += 1;
    }

    pub(crate) fn finish(&mut self, reason: EndReason, now: DateTime<Utc>) {
        if self.is_finished() {
            return;
        }
        self.game.finish(now);
        self.pause = None;
        self.end_reason = Some(reason);
        self.touch(now);

        info!(
            session_id = %self.id,
            reason = reason.as_str(),
            winner = ?self.game.winner,
            "Session ended"
        );
        self.emit(
            Audience::All,
            ServerEvent::GameEnded {
                winner: self.game.winner,
                reason,
            },
        );
    }

    fn check_abandoned(&mut self, now: DateTime<Utc>) {
        if !self.is_finished()
            && self.connections.human_count() > 0
            && self.connections.all_humans_gone()
        {
            self.finish(EndReason::Abandoned, now);
        }
    }

    /// Deadlines this session currently wants, keyed by what they guard.
    pub fn pending_timers(&self) -> Vec<TimerRequest> {
        let mut timers = Vec::new();
        if self.is_finished() {
            return timers;
        }

        match &self.pause {
            None => {
                if let Some(deadline) = self.game.turn_deadline() {
                    timers.push(TimerRequest {
                        key: TimerKey::Turn {
                            epoch: self.game.turn_epoch(),
                        },
                        deadline,
                    });
                }
            }
            Some(pause) if pause.phase == PausePhase::GracePeriod => {
                timers.push(TimerRequest {
                    key: TimerKey::Grace { pause_id: pause.id },
                    deadline: pause.grace_deadline,
                });
            }
            Some(_) => {}
        }

        let paused_target = self
            .pause
            .as_ref()
            .filter(|p| p.phase == PausePhase::GracePeriod)
            .map(|p| p.target_player_id);

        for record in self.connections.records() {
            if record.is_bot || Some(record.player_id) == paused_target {
                continue;
            }
            let waiting = matches!(
                record.status,
                ConnectionStatus::Disconnecting | ConnectionStatus::Reconnecting
            );
            if let (true, Some(deadline)) = (waiting, record.grace_deadline) {
                timers.push(TimerRequest {
                    key: TimerKey::Reconnect {
                        player_id: record.player_id,
                        disconnect_seq: record.disconnect_seq,
                    },
                    deadline,
                });
            }
        }

        timers
    }

    /// Queue a turn-timer tick for everyone.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if self.is_finished() || self.is_paused() || !self.game.status.is_active() {
            return;
        }
        let (Some(player_id), Some(remaining)) = (
            self.game.current_player_id(),
            self.game.remaining_turn_time(now),
        ) else {
            return;
        };
        self.emit(
            Audience::All,
            ServerEvent::TurnTimerTick {
                player_id,
                remaining_secs: remaining.as_secs(),
            },
        );
    }

    pub(crate) fn emit(&mut self, audience: Audience, event: ServerEvent) {
        self.outbox.push(Outbound::new(audience, event));
    }

    /// Queue a private game-state view for every human seat.
    pub(crate) fn broadcast_state(&mut self) {
        let humans: Vec<PlayerId> = self
            .game
            .players()
            .iter()
            .filter(|p| !p.is_bot)
            .map(|p| p.id)
            .collect();
        for player_id in humans {
            let state = self.player_view(player_id);
            self.emit(Audience::Player(player_id), ServerEvent::GameState { state });
        }
    }

    /// What one player is allowed to see.
    pub fn player_view(&self, player_id: PlayerId) -> serde_json::Value {
        let mut view = self.game.player_view(player_id);
        view["session_id"] = serde_json::json!(self.id);
        view["paused"] = self
            .pause
            .as_ref()
            .map(PauseState::to_json)
            .unwrap_or(serde_json::Value::Null);
        view["connections"] = self.connections.to_json();
        view["end_reason"] = serde_json::json!(self.end_reason.map(|r| r.as_str()));
        view
    }
}
