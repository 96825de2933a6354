//! Durable session snapshots.
//!
//! A snapshot holds what is needed to rebuild a session after a restart:
//! seats with their hands, the committed board, and the pile. In-flight turn
//! progress, pauses, votes and connection records are deliberately absent;
//! a restored session starts a fresh turn and every human seat has to come
//! back through a reconnect.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::connection::{ConnectionRecord, InvalidTransition};
use super::events::EndReason;
use super::game::{Game, GamePlayer, GameStatus, PlayerId};
use super::meld::Meld;
use super::pause::PauseError;
use super::session::{Session, SessionId, SessionOptions};
use super::tile::{Tile, TileId};

/// Format version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: SessionId,
    pub status: GameStatus,
    pub players: Vec<GamePlayer>,
    pub board: Vec<Meld>,
    pub draw_pile: Vec<Tile>,
    pub current_player_index: usize,
    pub winner: Option<PlayerId>,
    pub turn_time_limit_secs: Option<u64>,
    pub end_reason: Option<EndReason>,
    pub next_player_id: PlayerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Why a snapshot could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("Snapshot has no players")]
    NoPlayers,
    #[error("Snapshot is of a finished session")]
    Finished,
    #[error("Tile {0} is malformed")]
    MalformedTile(TileId),
    #[error("Tiles are not partitioned between hands, board and pile")]
    TileConflict,
    #[error("Board meld {index} is illegal")]
    IllegalBoard { index: usize },
    #[error("Turn index {0} is out of range")]
    BadTurnIndex(usize),
    #[error("Seat could not be held: {0}")]
    Seat(#[from] InvalidTransition),
    #[error("Restored turn could not be paused: {0}")]
    Pause(#[from] PauseError),
}

impl Session {
    /// Capture the committed state of this session. Tiles placed during the
    /// running turn are reported back in their owner's hand.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut players = self.game.players.clone();
        let in_flight = &self.game.turn.played_from_hand;
        if let Some(current) = players.get_mut(self.game.current_player_index) {
            let returning = self
                .game
                .board
                .iter()
                .flat_map(|m| m.tiles.iter())
                .filter(|t| in_flight.contains(&t.id))
                .cloned();
            current.hand.extend(returning);
            if self.game.turn.initial_met_this_turn {
                current.has_played_initial = false;
            }
        }

        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: self.id.clone(),
            status: self.game.status,
            players,
            board: self.game.board_snapshot.clone(),
            draw_pile: self.game.draw_pile.clone(),
            current_player_index: self.game.current_player_index,
            winner: self.game.winner,
            turn_time_limit_secs: self.game.turn_time_limit.map(|d| d.as_secs()),
            end_reason: self.end_reason,
            next_player_id: self.next_player_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.game.started_at,
            ended_at: self.game.ended_at,
        }
    }

    /// Rebuild a session from a snapshot.
    ///
    /// Human seats come back disconnecting, each with a fresh grace window;
    /// if one of them holds the turn, the game starts paused for them.
    pub fn restore(
        snapshot: SessionSnapshot,
        options: SessionOptions,
        now: DateTime<Utc>,
    ) -> Result<Session, SnapshotError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        if snapshot.players.is_empty() {
            return Err(SnapshotError::NoPlayers);
        }
        if snapshot.end_reason.is_some() || snapshot.status.is_terminal() {
            return Err(SnapshotError::Finished);
        }
        if snapshot.current_player_index >= snapshot.players.len() {
            return Err(SnapshotError::BadTurnIndex(snapshot.current_player_index));
        }

        let tiles = snapshot
            .players
            .iter()
            .flat_map(|p| p.hand.iter())
            .chain(snapshot.board.iter().flat_map(|m| m.tiles.iter()))
            .chain(snapshot.draw_pile.iter());
        for tile in tiles {
            if !tile.is_well_formed() {
                return Err(SnapshotError::MalformedTile(tile.id));
            }
        }
        if let Some(index) = snapshot.board.iter().position(|m| !m.is_legal()) {
            return Err(SnapshotError::IllegalBoard { index });
        }

        let turn_time_limit = snapshot.turn_time_limit_secs.map(Duration::from_secs);
        let mut game = Game::new(snapshot.session_id.clone(), turn_time_limit);
        game.status = snapshot.status;
        game.players = snapshot.players;
        game.board_snapshot = snapshot.board.clone();
        game.board = snapshot.board;
        game.draw_pile = snapshot.draw_pile;
        game.current_player_index = snapshot.current_player_index;
        game.winner = snapshot.winner;
        game.started_at = snapshot.started_at;
        game.ended_at = snapshot.ended_at;
        if !game.ownership_is_partition() {
            return Err(SnapshotError::TileConflict);
        }
        if game.status.is_active() {
            game.resume_turn(None, now);
        }

        let session_options = SessionOptions {
            turn_time_limit,
            ..options
        };
        let mut session = Session::new(snapshot.session_id, session_options, snapshot.created_at);
        session.game = game;
        session.next_player_id = snapshot.next_player_id;
        session.updated_at = now;

        let policy = session.options.grace;
        for player in &session.game.players {
            let record = if player.is_bot {
                ConnectionRecord::new_bot(player.id)
            } else {
                let mut record = ConnectionRecord::new(player.id);
                record.disconnect("server shutdown", &policy, now)?;
                record
            };
            session.connections.add(record);
        }

        // The shutdown dropped whoever held the turn while it was theirs.
        let holder = session
            .game
            .current_player()
            .filter(|p| !p.is_bot && session.game.status.is_active())
            .map(|p| p.id);
        if let Some(player_id) = holder {
            session.pause_for(player_id, now)?;
        }
        info!(
            session_id = %session.id,
            players = session.game.player_count(),
            paused = session.is_paused(),
            "Session restored"
        );
        Ok(session)
    }
}
