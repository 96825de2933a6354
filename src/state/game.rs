//! Turn state machine.
//!
//! Owns the draw pile, every hand, the board, and whose turn it is. Every
//! meld-producing action goes through one layout validator, so the board is
//! legal after every accepted action and any moment of a turn can be
//! committed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::meld::{meld_value, Meld, INITIAL_MELD_MINIMUM};
use super::tile::{hand_value, Tile, TileId};
use super::{elapsed_between, to_chrono};

/// Player identifier, unique within a session.
pub type PlayerId = u64;

/// Game state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Seats filling, nothing dealt
    #[default]
    AwaitingStart,
    /// Someone's turn is running
    TurnActive,
    /// Terminal
    GameOver,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingStart => "awaiting_start",
            Self::TurnActive => "turn_active",
            Self::GameOver => "game_over",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::TurnActive)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GameOver)
    }
}

/// A seat in the game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePlayer {
    pub id: PlayerId,
    pub name: String,
    pub hand: Vec<Tile>,
    pub has_played_initial: bool,
    pub is_bot: bool,
    pub score: i32,
}

impl GamePlayer {
    pub fn new(id: PlayerId, name: String, is_bot: bool) -> Self {
        Self {
            id,
            name,
            hand: Vec::new(),
            has_played_initial: false,
            is_bot,
            score: 0,
        }
    }

    pub fn has_tile(&self, tile_id: TileId) -> bool {
        self.hand.iter().any(|t| t.id == tile_id)
    }

    pub fn hand_value(&self) -> u32 {
        hand_value(&self.hand)
    }

    /// Public view: everything except the tiles themselves.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "tile_count": self.hand.len(),
            "has_played_initial": self.has_played_initial,
            "is_bot": self.is_bot,
            "score": self.score
        })
    }
}

/// What the current player has done so far this turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnProgress {
    /// Tiles moved from the current player's hand to the board
    pub played_from_hand: Vec<TileId>,
    /// A tile was drawn; plays are closed for the turn
    pub drew: bool,
    /// `has_played_initial` flipped during this turn
    pub initial_met_this_turn: bool,
}

/// Result of an accepted play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayOutcome {
    pub placed: Vec<TileId>,
    pub initial_met: bool,
    pub winner: Option<PlayerId>,
}

/// Result of ending a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAdvance {
    Next { player_id: PlayerId },
    GameOver { winner: Option<PlayerId> },
}

/// Game errors. Each maps to a stable reason code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("Game has not started")]
    NotStarted,
    #[error("Game has already started")]
    AlreadyStarted,
    #[error("Game is over")]
    GameOver,
    #[error("It's not your turn")]
    NotYourTurn,
    #[error("Not a player in this game")]
    UnknownPlayer,
    #[error("Already a player in this game")]
    AlreadyPlayer,
    #[error("Not enough players to start")]
    NotEnoughPlayers,
    #[error("Not enough tiles to deal")]
    NotEnoughTiles,
    #[error("The draw pile is empty")]
    DrawPileEmpty,
    #[error("Already drew a tile this turn")]
    AlreadyDrew,
    #[error("Drawing closes play for this turn")]
    PlayAfterDraw,
    #[error("Tiles were already played this turn")]
    DrawAfterPlay,
    #[error("No tiles selected")]
    EmptySelection,
    #[error("Unknown tile {0}")]
    UnknownTile(TileId),
    #[error("Tile {0} is not yours")]
    TileNotOwned(TileId),
    #[error("Tile {0} used more than once")]
    DuplicateTile(TileId),
    #[error("Board layout would lose tile {0}")]
    MissingTile(TileId),
    #[error("Meld {index} is not a legal group or run")]
    IllegalMeld { index: usize },
    #[error("Initial meld totals {value}, needs at least 30")]
    InsufficientInitialValue { value: u32 },
    #[error("The board can't be rearranged before your initial meld")]
    BoardLocked,
}

impl GameError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::AlreadyStarted => "already_started",
            Self::GameOver => "game_over",
            Self::NotYourTurn => "not_your_turn",
            Self::UnknownPlayer => "unknown_player",
            Self::AlreadyPlayer => "already_player",
            Self::NotEnoughPlayers => "not_enough_players",
            Self::NotEnoughTiles => "not_enough_tiles",
            Self::DrawPileEmpty => "draw_pile_empty",
            Self::AlreadyDrew => "already_drew",
            Self::PlayAfterDraw => "play_after_draw",
            Self::DrawAfterPlay => "draw_after_play",
            Self::EmptySelection => "empty_selection",
            Self::UnknownTile(_) => "unknown_tile",
            Self::TileNotOwned(_) => "tile_not_owned",
            Self::DuplicateTile(_) => "duplicate_tile",
            Self::MissingTile(_) => "missing_tile",
            Self::IllegalMeld { .. } => "illegal_meld",
            Self::InsufficientInitialValue { .. } => "insufficient_initial_value",
            Self::BoardLocked => "board_locked",
        }
    }
}

/// Turn state machine for one session.
#[derive(Debug, Clone)]
pub struct Game {
    pub id: String,
    pub status: GameStatus,
    pub(crate) players: Vec<GamePlayer>,
    pub(crate) board: Vec<Meld>,
    pub(crate) draw_pile: Vec<Tile>,
    pub current_player_index: usize,
    pub winner: Option<PlayerId>,
    pub turn_time_limit: Option<Duration>,
    pub turn_started_at: Option<DateTime<Utc>>,
    /// Board as committed at the end of the previous turn
    pub(crate) board_snapshot: Vec<Meld>,
    pub(crate) turn: TurnProgress,
    /// Bumped whenever the turn clock restarts; guards stale timer callbacks
    pub(crate) turn_epoch: u64,
    /// Consecutive turns without a placement while the pile is empty
    pub(crate) idle_turns: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Game {
    pub fn new(id: String, turn_time_limit: Option<Duration>) -> Self {
        Self {
            id,
            status: GameStatus::AwaitingStart,
            players: Vec::new(),
            board: Vec::new(),
            draw_pile: Vec::new(),
            current_player_index: 0,
            winner: None,
            turn_time_limit,
            turn_started_at: None,
            board_snapshot: Vec::new(),
            turn: TurnProgress::default(),
            turn_epoch: 0,
            idle_turns: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// Seat a player. Only allowed before the deal.
    pub fn add_player(&mut self, player: GamePlayer) -> Result<(), GameError> {
        if self.status != GameStatus::AwaitingStart {
            return Err(GameError::AlreadyStarted);
        }
        if self.has_player(player.id) {
            return Err(GameError::AlreadyPlayer);
        }

        self.players.push(player);
        Ok(())
    }

    /// Deal `hand_size` tiles to each seat from `pile` and open the first turn.
    pub fn start(
        &mut self,
        mut pile: Vec<Tile>,
        hand_size: usize,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        if self.status != GameStatus::AwaitingStart {
            return Err(GameError::AlreadyStarted);
        }
        if self.players.is_empty() {
            return Err(GameError::NotEnoughPlayers);
        }
        let dealt = hand_size.checked_mul(self.players.len());
        if dealt.map_or(true, |n| n > pile.len()) {
            return Err(GameError::NotEnoughTiles);
        }

        for player in &mut self.players {
            player.hand = pile.drain(..hand_size).collect();
        }
        self.draw_pile = pile;

        self.status = GameStatus::TurnActive;
        self.started_at = Some(now);
        self.current_player_index = 0;
        self.board_snapshot = self.board.clone();
        self.turn = TurnProgress::default();
        self.restart_turn_clock(now);

        info!(
            game_id = %self.id,
            players = self.players.len(),
            pile = self.draw_pile.len(),
            "Game started"
        );
        Ok(())
    }

    // Accessors

    pub fn players(&self) -> &[GamePlayer] {
        &self.players
    }

    pub fn board(&self) -> &[Meld] {
        &self.board
    }

    pub fn board_snapshot(&self) -> &[Meld] {
        &self.board_snapshot
    }

    pub fn turn_progress(&self) -> &TurnProgress {
        &self.turn
    }

    pub fn turn_epoch(&self) -> u64 {
        self.turn_epoch
    }

    pub fn draw_pile_count(&self) -> usize {
        self.draw_pile.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn get_player(&self, player_id: PlayerId) -> Option<&GamePlayer> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub(crate) fn get_player_mut(&mut self, player_id: PlayerId) -> Option<&mut GamePlayer> {
        self.players.iter_mut().find(|p| p.id == player_id)
    }

    pub fn has_player(&self, player_id: PlayerId) -> bool {
        self.get_player(player_id).is_some()
    }

    pub fn current_player_id(&self) -> Option<PlayerId> {
        self.players.get(self.current_player_index).map(|p| p.id)
    }

    pub fn current_player(&self) -> Option<&GamePlayer> {
        self.players.get(self.current_player_index)
    }

    pub fn is_player_turn(&self, player_id: PlayerId) -> bool {
        self.status.is_active() && self.current_player_id() == Some(player_id)
    }

    /// When the running turn times out, if the clock is enabled.
    pub fn turn_deadline(&self) -> Option<DateTime<Utc>> {
        if !self.status.is_active() {
            return None;
        }
        let limit = self.turn_time_limit?;
        Some(self.turn_started_at? + to_chrono(limit))
    }

    /// Time left on the running turn, floored at zero.
    pub fn remaining_turn_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        let limit = self.turn_time_limit?;
        let started = self.turn_started_at?;
        Some(limit.saturating_sub(elapsed_between(started, now)))
    }

    // Turn actions

    /// Move one tile from the pile to the current player's hand.
    pub fn draw_tile(&mut self, player_id: PlayerId) -> Result<TileId, GameError> {
        self.check_turn(player_id)?;
        if self.turn.drew {
            return Err(GameError::AlreadyDrew);
        }
        if !self.turn.played_from_hand.is_empty() {
            return Err(GameError::DrawAfterPlay);
        }

        let tile = self.draw_pile.pop().ok_or(GameError::DrawPileEmpty)?;
        let tile_id = tile.id;
        let player = self
            .get_player_mut(player_id)
            .ok_or(GameError::UnknownPlayer)?;
        player.hand.push(tile);
        self.turn.drew = true;

        debug!(game_id = %self.id, player_id, tile_id, "Drew tile");
        Ok(tile_id)
    }

    /// Place one or more new melds.
    ///
    /// Each selected id must be in the caller's hand or already on the board;
    /// board tiles are lifted out of their current melds, and whatever remains
    /// of those melds must still be legal.
    pub fn play_set(
        &mut self,
        player_id: PlayerId,
        selection: &[Vec<TileId>],
        now: DateTime<Utc>,
    ) -> Result<PlayOutcome, GameError> {
        self.check_turn(player_id)?;
        if selection.iter().all(Vec::is_empty) {
            return Err(GameError::EmptySelection);
        }

        let player = self.get_player(player_id).ok_or(GameError::UnknownPlayer)?;
        let selected: HashSet<TileId> = selection.iter().flatten().copied().collect();

        let mut from_hand = Vec::new();
        for &tile_id in selection.iter().flatten() {
            if player.has_tile(tile_id) {
                from_hand.push(tile_id);
            } else if !self.board.iter().any(|m| m.contains(tile_id)) {
                return Err(self.foreign_tile_error(tile_id));
            }
        }

        let mut layout: Vec<Vec<TileId>> = self
            .board
            .iter()
            .map(|m| m.ids().filter(|id| !selected.contains(id)).collect::<Vec<_>>())
            .filter(|ids| !ids.is_empty())
            .collect();
        layout.extend(selection.iter().filter(|g| !g.is_empty()).cloned());

        self.apply_layout(player_id, &layout, &from_hand, now)
    }

    /// Replace the whole board with `layout`, moving `from_hand` out of the
    /// caller's hand.
    pub fn update_board(
        &mut self,
        player_id: PlayerId,
        layout: &[Vec<TileId>],
        from_hand: &[TileId],
        now: DateTime<Utc>,
    ) -> Result<PlayOutcome, GameError> {
        self.check_turn(player_id)?;
        self.apply_layout(player_id, layout, from_hand, now)
    }

    /// Put the board back to the start of the turn and return every tile the
    /// current player placed this turn to their hand.
    pub fn undo_turn(&mut self, player_id: PlayerId) -> Result<Vec<TileId>, GameError> {
        self.check_turn(player_id)?;

        let returning: HashSet<TileId> = self.turn.played_from_hand.iter().copied().collect();
        let returned: Vec<Tile> = self
            .board
            .iter()
            .flat_map(|m| m.tiles.iter())
            .filter(|t| returning.contains(&t.id))
            .cloned()
            .collect();

        self.board = self.board_snapshot.clone();
        let revoke_initial = self.turn.initial_met_this_turn;
        let player = self
            .get_player_mut(player_id)
            .ok_or(GameError::UnknownPlayer)?;
        player.hand.extend(returned);
        if revoke_initial {
            player.has_played_initial = false;
        }

        let ids = std::mem::take(&mut self.turn.played_from_hand);
        self.turn.initial_met_this_turn = false;

        debug!(game_id = %self.id, player_id, returned = ids.len(), "Turn undone");
        Ok(ids)
    }

    /// Commit the board and pass the turn.
    pub fn end_turn(
        &mut self,
        player_id: PlayerId,
        now: DateTime<Utc>,
    ) -> Result<TurnAdvance, GameError> {
        self.check_turn(player_id)?;
        Ok(self.advance_turn(now))
    }

    /// End the running turn on behalf of whoever holds it (clock expiry,
    /// skip decision). The board is always legal, so it is committed as is.
    pub fn force_end_turn(&mut self, now: DateTime<Utc>) -> Result<TurnAdvance, GameError> {
        self.check_active()?;
        Ok(self.advance_turn(now))
    }

    /// Resume the current turn with `remaining` time on the clock.
    pub fn resume_turn(&mut self, remaining: Option<Duration>, now: DateTime<Utc>) {
        self.restart_turn_clock(now);
        if let (Some(limit), Some(remaining)) = (self.turn_time_limit, remaining) {
            let used = limit.saturating_sub(remaining);
            self.turn_started_at = Some(now - to_chrono(used));
        }
    }

    /// Hand a seat to a bot, keeping hand and turn position.
    pub fn convert_to_bot(&mut self, player_id: PlayerId) -> Result<(), GameError> {
        let player = self
            .get_player_mut(player_id)
            .ok_or(GameError::UnknownPlayer)?;
        player.is_bot = true;
        info!(game_id = %self.id, player_id, "Seat converted to bot");
        Ok(())
    }

    /// End the game without a winner.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = GameStatus::GameOver;
        self.winner = None;
        self.ended_at = Some(now);
        info!(game_id = %self.id, "Game ended without a winner");
    }

    /// Check that every tile lives in exactly one place.
    pub fn ownership_is_partition(&self) -> bool {
        let mut seen = HashSet::new();
        let hands = self.players.iter().flat_map(|p| p.hand.iter());
        let board = self.board.iter().flat_map(|m| m.tiles.iter());
        hands
            .chain(board)
            .chain(self.draw_pile.iter())
            .all(|t| seen.insert(t.id))
    }

    // Internals

    fn check_active(&self) -> Result<(), GameError> {
        match self.status {
            GameStatus::AwaitingStart => Err(GameError::NotStarted),
            GameStatus::GameOver => Err(GameError::GameOver),
            GameStatus::TurnActive => Ok(()),
        }
    }

    fn check_turn(&self, player_id: PlayerId) -> Result<(), GameError> {
        self.check_active()?;
        if !self.has_player(player_id) {
            return Err(GameError::UnknownPlayer);
        }
        if self.current_player_id() != Some(player_id) {
            return Err(GameError::NotYourTurn);
        }
        Ok(())
    }

    fn foreign_tile_error(&self, tile_id: TileId) -> GameError {
        let elsewhere = self.players.iter().any(|p| p.has_tile(tile_id))
            || self.draw_pile.iter().any(|t| t.id == tile_id);
        if elsewhere {
            GameError::TileNotOwned(tile_id)
        } else {
            GameError::UnknownTile(tile_id)
        }
    }

    /// Validate and commit a full board layout.
    fn apply_layout(
        &mut self,
        player_id: PlayerId,
        layout: &[Vec<TileId>],
        from_hand: &[TileId],
        now: DateTime<Utc>,
    ) -> Result<PlayOutcome, GameError> {
        if self.turn.drew {
            return Err(GameError::PlayAfterDraw);
        }

        let player = self.get_player(player_id).ok_or(GameError::UnknownPlayer)?;
        let has_played_initial = player.has_played_initial;

        // Every tile the layout may use, by id.
        let mut available: HashMap<TileId, Tile> = HashMap::new();
        for tile in self.board.iter().flat_map(|m| m.tiles.iter()) {
            available.insert(tile.id, tile.clone());
        }
        for &tile_id in from_hand {
            let tile = player
                .hand
                .iter()
                .find(|t| t.id == tile_id)
                .ok_or_else(|| self.foreign_tile_error(tile_id))?;
            if available.insert(tile_id, tile.clone()).is_some() {
                return Err(GameError::DuplicateTile(tile_id));
            }
        }

        let mut used = HashSet::new();
        let mut melds = Vec::with_capacity(layout.len());
        for ids in layout.iter().filter(|ids| !ids.is_empty()) {
            let mut tiles = Vec::with_capacity(ids.len());
            for &tile_id in ids {
                if !used.insert(tile_id) {
                    return Err(GameError::DuplicateTile(tile_id));
                }
                let tile = available
                    .get(&tile_id)
                    .ok_or_else(|| self.foreign_tile_error(tile_id))?;
                tiles.push(tile.clone());
            }
            melds.push(Meld::new(tiles));
        }

        if let Some(lost) = available.keys().find(|id| !used.contains(*id)) {
            return Err(GameError::MissingTile(*lost));
        }
        if let Some(index) = melds.iter().position(|m| !m.is_legal()) {
            return Err(GameError::IllegalMeld { index });
        }

        let hand_ids: HashSet<TileId> = from_hand.iter().copied().collect();
        let initial_met = if has_played_initial {
            false
        } else {
            self.check_initial_layout(&melds, &hand_ids)?;
            !hand_ids.is_empty()
        };

        // Commit
        let player = self
            .get_player_mut(player_id)
            .ok_or(GameError::UnknownPlayer)?;
        player.hand.retain(|t| !hand_ids.contains(&t.id));
        if initial_met {
            player.has_played_initial = true;
        }
        let emptied = player.hand.is_empty();

        self.board = melds;
        self.turn.played_from_hand.extend(from_hand.iter().copied());
        if initial_met {
            self.turn.initial_met_this_turn = true;
        }

        debug!(
            game_id = %self.id,
            player_id,
            placed = from_hand.len(),
            melds = self.board.len(),
            "Board updated"
        );

        let winner = if emptied {
            self.declare_winner(player_id, now);
            Some(player_id)
        } else {
            None
        };

        Ok(PlayOutcome {
            placed: from_hand.to_vec(),
            initial_met,
            winner,
        })
    }

    /// Before the initial meld: new melds are hand-only, existing melds are
    /// untouched, and the new melds reach the threshold.
    fn check_initial_layout(
        &self,
        melds: &[Meld],
        hand_ids: &HashSet<TileId>,
    ) -> Result<(), GameError> {
        let existing: Vec<HashSet<TileId>> = self
            .board
            .iter()
            .map(|m| m.ids().collect())
            .collect();

        let mut value = 0;
        for meld in melds {
            let from_hand = meld.ids().filter(|id| hand_ids.contains(id)).count();
            if from_hand == 0 {
                let ids: HashSet<TileId> = meld.ids().collect();
                if !existing.contains(&ids) {
                    return Err(GameError::BoardLocked);
                }
            } else if from_hand != meld.len() {
                return Err(GameError::BoardLocked);
            } else {
                value += meld_value(&meld.tiles);
            }
        }

        if !hand_ids.is_empty() && value < INITIAL_MELD_MINIMUM {
            return Err(GameError::InsufficientInitialValue { value });
        }
        Ok(())
    }

    fn advance_turn(&mut self, now: DateTime<Utc>) -> TurnAdvance {
        let placed = !self.turn.played_from_hand.is_empty();
        self.board_snapshot = self.board.clone();
        self.turn = TurnProgress::default();

        if placed || !self.draw_pile.is_empty() {
            self.idle_turns = 0;
        } else {
            self.idle_turns += 1;
        }

        if self.idle_turns >= self.players.len() {
            let winner = self
                .players
                .iter()
                .min_by_key(|p| p.hand_value())
                .map(|p| p.id);
            if let Some(winner) = winner {
                info!(game_id = %self.id, winner, "Draw pile exhausted, lowest hand wins");
                self.declare_winner(winner, now);
            } else {
                self.finish(now);
            }
            return TurnAdvance::GameOver {
                winner: self.winner,
            };
        }

        self.current_player_index = (self.current_player_index + 1) % self.players.len();
        self.restart_turn_clock(now);

        let player_id = self.current_player_id().unwrap_or_default();
        debug!(game_id = %self.id, player_id, "Turn advanced");
        TurnAdvance::Next { player_id }
    }

    fn restart_turn_clock(&mut self, now: DateTime<Utc>) {
        self.turn_started_at = Some(now);
        self.turn_epoch += 1;
    }

    fn declare_winner(&mut self, winner: PlayerId, now: DateTime<Utc>) {
        let mut pot = 0i32;
        for player in self.players.iter_mut().filter(|p| p.id != winner) {
            let value = player.hand_value() as i32;
            player.score -= value;
            pot += value;
        }
        if let Some(player) = self.get_player_mut(winner) {
            player.score += pot;
        }

        self.board_snapshot = self.board.clone();
        self.turn = TurnProgress::default();
        self.status = GameStatus::GameOver;
        self.winner = Some(winner);
        self.ended_at = Some(now);
        info!(game_id = %self.id, winner, "Game won");
    }

    /// Shared state plus the viewer's own hand.
    pub fn player_view(&self, viewer: PlayerId) -> serde_json::Value {
        let mut view = self.to_json();
        if let Some(player) = self.get_player(viewer) {
            view["hand"] = serde_json::json!(player.hand);
            view["viewer_id"] = serde_json::json!(viewer);
        }
        view
    }

    /// Shared state only. Hands are never included.
    pub fn to_json(&self) -> serde_json::Value {
        let players: Vec<serde_json::Value> = self.players.iter().map(|p| p.to_json()).collect();

        serde_json::json!({
            "game_id": self.id,
            "status": self.status.as_str(),
            "players": players,
            "board": self.board,
            "current_player_index": self.current_player_index,
            "current_player_id": self.current_player_id(),
            "draw_pile_count": self.draw_pile.len(),
            "winner": self.winner,
            "turn_started_at": self.turn_started_at,
            "turn_time_limit_secs": self.turn_time_limit.map(|d| d.as_secs())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tile::Color::{self, *};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn t(id: TileId, color: Color, n: u8) -> Tile {
        Tile::numbered(id, color, n)
    }

    /// Two seats with rigged hands and a small pile.
    fn rigged_game(hand_a: Vec<Tile>, hand_b: Vec<Tile>) -> Game {
        let mut game = Game::new("game-1".to_string(), Some(Duration::from_secs(60)));
        game.add_player(GamePlayer::new(1, "A".to_string(), false))
            .unwrap();
        game.add_player(GamePlayer::new(2, "B".to_string(), false))
            .unwrap();
        let pile = vec![t(900, Black, 1), t(901, Black, 2), t(902, Black, 3)];
        game.start(pile, 0, now()).unwrap();
        game.players[0].hand = hand_a;
        game.players[1].hand = hand_b;
        game
    }

    fn strong_hand() -> Vec<Tile> {
        vec![
            t(1, Red, 7),
            t(2, Red, 8),
            t(3, Red, 9),
            t(4, Red, 10),
            t(5, Blue, 7),
            t(6, Yellow, 7),
            t(7, Black, 7),
            t(8, Blue, 1),
        ]
    }

    fn tile_ids(melds: &[Meld]) -> Vec<Vec<TileId>> {
        melds.iter().map(|m| m.ids().collect()).collect()
    }

    #[test]
    fn test_start_deals_hands() {
        let mut game = Game::new("g".to_string(), None);
        for id in 1..=3 {
            game.add_player(GamePlayer::new(id, format!("P{}", id), false))
                .unwrap();
        }
        game.start(crate::state::tile::shuffled_set(Some(1)), 14, now())
            .unwrap();

        assert_eq!(game.status, GameStatus::TurnActive);
        assert!(game.players().iter().all(|p| p.hand.len() == 14));
        assert_eq!(game.draw_pile_count(), 106 - 42);
        assert_eq!(game.current_player_id(), Some(1));
        assert!(game.ownership_is_partition());
        assert_eq!(game.add_player(GamePlayer::new(9, "late".into(), false)), Err(GameError::AlreadyStarted));
    }

    #[test]
    fn test_start_needs_enough_tiles() {
        let mut game = Game::new("g".to_string(), None);
        for id in 1..=4 {
            game.add_player(GamePlayer::new(id, format!("P{}", id), false))
                .unwrap();
        }
        let pile = crate::state::tile::full_set();
        assert_eq!(game.start(pile.clone(), 27, now()), Err(GameError::NotEnoughTiles));
        assert_eq!(game.start(pile.clone(), usize::MAX, now()), Err(GameError::NotEnoughTiles));
        assert_eq!(game.status, GameStatus::AwaitingStart);
        assert!(game.players().iter().all(|p| p.hand.is_empty()));

        game.start(pile, 26, now()).unwrap();
        assert_eq!(game.draw_pile_count(), 2);
    }

    #[test]
    fn test_draw_rules() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);

        assert_eq!(game.draw_tile(2), Err(GameError::NotYourTurn));
        let drawn = game.draw_tile(1).unwrap();
        assert!(game.players[0].has_tile(drawn));
        assert_eq!(game.draw_pile_count(), 2);
        assert_eq!(game.draw_tile(1), Err(GameError::AlreadyDrew));

        // Drawing closes play
        let result = game.play_set(1, &[vec![1, 2, 3, 4]], now());
        assert_eq!(result, Err(GameError::PlayAfterDraw));
        assert!(game.ownership_is_partition());
    }

    #[test]
    fn test_draw_after_play_rejected() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        assert_eq!(game.draw_tile(1), Err(GameError::DrawAfterPlay));
    }

    #[test]
    fn test_draw_empty_pile() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        game.draw_pile.clear();
        assert_eq!(game.draw_tile(1), Err(GameError::DrawPileEmpty));
    }

    #[test]
    fn test_initial_meld_threshold() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);

        // 7-7-7 is only 21
        let result = game.play_set(1, &[vec![1, 5, 6]], now());
        assert_eq!(
            result,
            Err(GameError::InsufficientInitialValue { value: 21 })
        );
        assert!(game.board().is_empty());
        assert!(!game.players[0].has_played_initial);

        // 7-8-9-10 red is 34
        let outcome = game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        assert!(outcome.initial_met);
        assert!(game.players[0].has_played_initial);
        assert_eq!(game.players[0].hand.len(), 4);

        // No minimum once the initial meld is down
        let outcome = game.play_set(1, &[vec![5, 6, 7]], now()).unwrap();
        assert!(!outcome.initial_met);
        assert_eq!(game.board().len(), 2);
        assert!(game.ownership_is_partition());
    }

    #[test]
    fn test_initial_meld_can_combine_sets() {
        let hand = vec![
            t(1, Red, 7),
            t(2, Blue, 7),
            t(3, Yellow, 7),
            t(4, Black, 3),
            t(5, Black, 4),
            t(6, Black, 5),
            t(7, Red, 1),
        ];
        let mut game = rigged_game(hand, vec![t(20, Blue, 2)]);
        let outcome = game
            .play_set(1, &[vec![1, 2, 3], vec![4, 5, 6]], now())
            .unwrap();
        assert!(outcome.initial_met);
        assert_eq!(game.board().len(), 2);
    }

    #[test]
    fn test_illegal_meld_rejected() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        let result = game.play_set(1, &[vec![1, 2, 8]], now());
        assert_eq!(result, Err(GameError::IllegalMeld { index: 0 }));
        assert_eq!(game.players[0].hand.len(), 8);
    }

    #[test]
    fn test_foreign_and_unknown_tiles() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        assert_eq!(
            game.play_set(1, &[vec![1, 2, 20]], now()),
            Err(GameError::TileNotOwned(20))
        );
        assert_eq!(
            game.play_set(1, &[vec![1, 2, 555]], now()),
            Err(GameError::UnknownTile(555))
        );
        assert_eq!(
            game.play_set(1, &[vec![1, 2, 3, 4], vec![4, 5, 6]], now()),
            Err(GameError::DuplicateTile(4))
        );
    }

    #[test]
    fn test_rearrangement_requires_initial() {
        let mut game = rigged_game(strong_hand(), strong_hand_b());
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        game.end_turn(1, now()).unwrap();

        // B has not played initial: may not lift 10-red from A's run
        let result = game.play_set(2, &[vec![30, 31, 4]], now());
        assert_eq!(result, Err(GameError::BoardLocked));
    }

    fn strong_hand_b() -> Vec<Tile> {
        vec![
            t(30, Blue, 10),
            t(31, Yellow, 10),
            t(32, Black, 11),
            t(33, Black, 12),
            t(34, Black, 13),
        ]
    }

    #[test]
    fn test_rearrangement_after_initial() {
        let mut game = rigged_game(strong_hand(), strong_hand_b());
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        game.end_turn(1, now()).unwrap();

        // B opens with 11-12-13 black (36)
        game.play_set(2, &[vec![32, 33, 34]], now()).unwrap();
        // Then lifts 10-red into a group, leaving 7-8-9 red behind
        game.play_set(2, &[vec![30, 31, 4]], now()).unwrap();

        assert_eq!(
            tile_ids(game.board()),
            vec![vec![1, 2, 3], vec![32, 33, 34], vec![30, 31, 4]]
        );
        assert!(game.board().iter().all(Meld::is_legal));
        assert!(game.ownership_is_partition());
    }

    #[test]
    fn test_lifting_that_breaks_meld_rejected() {
        let mut game = rigged_game(strong_hand(), strong_hand_b());
        game.play_set(1, &[vec![1, 2, 3]], now()).unwrap_err();
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        game.end_turn(1, now()).unwrap();
        game.play_set(2, &[vec![32, 33, 34]], now()).unwrap();

        // Taking 8-red would leave 7 / 9-10 behind
        let result = game.play_set(2, &[vec![30, 31, 2]], now());
        assert!(matches!(result, Err(GameError::IllegalMeld { .. })));
    }

    #[test]
    fn test_undo_restores_snapshot_and_hand() {
        let mut game = rigged_game(strong_hand(), strong_hand_b());
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();
        game.end_turn(1, now()).unwrap();

        let snapshot = game.board_snapshot().to_vec();
        let hand_before = game.players[1].hand.clone();

        game.play_set(2, &[vec![32, 33, 34]], now()).unwrap();
        game.play_set(2, &[vec![30, 31, 4]], now()).unwrap();
        let returned = game.undo_turn(2).unwrap();

        assert_eq!(returned, vec![32, 33, 34, 30, 31]);
        assert_eq!(game.board(), snapshot.as_slice());
        let mut hand_after: Vec<TileId> = game.players[1].hand.iter().map(|t| t.id).collect();
        hand_after.sort();
        let mut expected: Vec<TileId> = hand_before.iter().map(|t| t.id).collect();
        expected.sort();
        assert_eq!(hand_after, expected);
        assert!(!game.players[1].has_played_initial);
        assert!(game.ownership_is_partition());

        // Undo twice is harmless
        assert!(game.undo_turn(2).unwrap().is_empty());
        assert_eq!(game.players[1].hand.len(), 5);
    }

    #[test]
    fn test_undo_keeps_drawn_tile() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        let drawn = game.draw_tile(1).unwrap();
        game.undo_turn(1).unwrap();
        assert!(game.players[0].has_tile(drawn));
        assert!(game.ownership_is_partition());
    }

    #[test]
    fn test_update_board() {
        let mut game = rigged_game(strong_hand(), strong_hand_b());
        game.update_board(1, &[vec![1, 2, 3, 4]], &[1, 2, 3, 4], now())
            .unwrap();
        game.end_turn(1, now()).unwrap();
        game.play_set(2, &[vec![32, 33, 34]], now()).unwrap();

        // Dropping a board tile from the layout is rejected
        let result = game.update_board(2, &[vec![32, 33, 34], vec![1, 2, 3]], &[], now());
        assert_eq!(result, Err(GameError::MissingTile(4)));

        // Valid split with hand tiles
        game.update_board(
            2,
            &[vec![32, 33, 34], vec![1, 2, 3], vec![4, 30, 31]],
            &[30, 31],
            now(),
        )
        .unwrap();
        assert!(game.players[1].hand.is_empty());
        assert_eq!(game.status, GameStatus::GameOver);
        assert_eq!(game.winner, Some(2));
    }

    #[test]
    fn test_end_turn_advances_and_wraps() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        let epoch = game.turn_epoch();

        assert_eq!(game.end_turn(2, now()), Err(GameError::NotYourTurn));
        assert_eq!(
            game.end_turn(1, now()),
            Ok(TurnAdvance::Next { player_id: 2 })
        );
        assert!(game.turn_epoch() > epoch);
        assert_eq!(
            game.end_turn(2, now()),
            Ok(TurnAdvance::Next { player_id: 1 })
        );
        assert_eq!(game.current_player_index, 0);
    }

    #[test]
    fn test_emptying_hand_wins_immediately() {
        let hand = vec![t(1, Red, 10), t(2, Red, 11), t(3, Red, 12)];
        let mut game = rigged_game(hand, vec![t(20, Blue, 2), Tile::wildcard(21)]);

        let outcome = game.play_set(1, &[vec![1, 2, 3]], now()).unwrap();
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(game.status, GameStatus::GameOver);
        assert_eq!(game.players[0].score, 32);
        assert_eq!(game.players[1].score, -32);

        assert_eq!(game.end_turn(1, now()), Err(GameError::GameOver));
        assert_eq!(game.draw_tile(1), Err(GameError::GameOver));
    }

    #[test]
    fn test_exhausted_pile_ends_game() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        game.draw_pile.clear();

        assert_eq!(
            game.end_turn(1, now()),
            Ok(TurnAdvance::Next { player_id: 2 })
        );
        assert_eq!(
            game.end_turn(2, now()),
            Ok(TurnAdvance::GameOver { winner: Some(2) })
        );
        assert_eq!(game.status, GameStatus::GameOver);
    }

    #[test]
    fn test_turn_clock() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        let later = now() + chrono::Duration::seconds(25);

        assert_eq!(game.remaining_turn_time(later), Some(Duration::from_secs(35)));
        assert_eq!(
            game.turn_deadline(),
            Some(now() + chrono::Duration::seconds(60))
        );

        let way_later = now() + chrono::Duration::seconds(600);
        assert_eq!(game.remaining_turn_time(way_later), Some(Duration::ZERO));

        game.resume_turn(Some(Duration::from_secs(35)), way_later);
        assert_eq!(
            game.remaining_turn_time(way_later),
            Some(Duration::from_secs(35))
        );
    }

    #[test]
    fn test_force_end_turn_commits_board() {
        let mut game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        game.play_set(1, &[vec![1, 2, 3, 4]], now()).unwrap();

        assert_eq!(
            game.force_end_turn(now()),
            Ok(TurnAdvance::Next { player_id: 2 })
        );
        assert_eq!(game.board_snapshot().len(), 1);
        assert!(game.players[0].has_played_initial);
    }

    #[test]
    fn test_player_view_hides_other_hands() {
        let game = rigged_game(strong_hand(), vec![t(20, Blue, 2)]);
        let view = game.player_view(2);

        assert_eq!(view["hand"].as_array().unwrap().len(), 1);
        assert_eq!(view["players"][0]["tile_count"], 8);
        assert!(view["players"][0].get("hand").is_none());
        assert!(game.to_json().get("hand").is_none());
    }

    /// Every legal three-tile meld in a hand.
    fn legal_triples(hand: &[Tile]) -> Vec<Vec<TileId>> {
        let mut found = Vec::new();
        for i in 0..hand.len() {
            for j in i + 1..hand.len() {
                for k in j + 1..hand.len() {
                    let tiles = [hand[i].clone(), hand[j].clone(), hand[k].clone()];
                    if crate::state::meld::is_legal_meld(&tiles) {
                        found.push(tiles.iter().map(|t| t.id).collect());
                    }
                }
            }
        }
        found
    }

    fn sorted_ids(tiles: &[Tile]) -> Vec<TileId> {
        let mut ids: Vec<TileId> = tiles.iter().map(|t| t.id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_random_turns_keep_ownership_and_undo_exact() {
        use crate::state::tile::{shuffled_set, FULL_SET_SIZE};
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut game = Game::new(format!("g{}", seed), None);
            for id in 1..=3 {
                game.add_player(GamePlayer::new(id, format!("P{}", id), false))
                    .unwrap();
            }
            game.start(shuffled_set(Some(seed)), 14, now()).unwrap();
            if seed % 2 == 0 {
                // Half the runs skip the opening threshold so melds land often
                for player in &mut game.players {
                    player.has_played_initial = true;
                }
            }

            let mut turn_hand = sorted_ids(&game.players[0].hand);
            let mut turn_initial = game.players[0].has_played_initial;

            for step in 0..300 {
                if game.status.is_terminal() {
                    break;
                }
                let pid = game.current_player_id().unwrap();
                let hand = game.current_player().unwrap().hand.clone();

                match rng.gen_range(0..6) {
                    0 => {
                        if let Ok(drawn) = game.draw_tile(pid) {
                            // Undo keeps the drawn tile
                            turn_hand.push(drawn);
                            turn_hand.sort();
                        }
                    }
                    1 => {
                        if let Some(set) = legal_triples(&hand).choose(&mut rng) {
                            let _ = game.play_set(pid, &[set.clone()], now());
                        }
                    }
                    2 => {
                        let mut pool: Vec<TileId> = hand
                            .iter()
                            .map(|t| t.id)
                            .chain(game.board().iter().flat_map(|m| m.ids()))
                            .collect();
                        pool.shuffle(&mut rng);
                        pool.truncate(rng.gen_range(1..=4));
                        let _ = game.play_set(pid, &[pool], now());
                    }
                    3 => {
                        let mut layout: Vec<Vec<TileId>> =
                            game.board().iter().map(|m| m.ids().collect()).collect();
                        layout.shuffle(&mut rng);
                        let mut from_hand = Vec::new();
                        if let Some(set) = legal_triples(&hand).choose(&mut rng) {
                            from_hand = set.clone();
                            layout.push(set.clone());
                        }
                        if rng.gen_bool(0.3) {
                            layout.pop();
                        }
                        let _ = game.update_board(pid, &layout, &from_hand, now());
                    }
                    4 => {
                        game.undo_turn(pid).unwrap();
                        let player = game.get_player(pid).unwrap();
                        assert_eq!(game.board(), game.board_snapshot(), "seed {} step {}", seed, step);
                        assert_eq!(sorted_ids(&player.hand), turn_hand, "seed {} step {}", seed, step);
                        assert_eq!(player.has_played_initial, turn_initial);
                    }
                    _ => {
                        game.end_turn(pid, now()).unwrap();
                        let next = game.current_player().unwrap();
                        turn_hand = sorted_ids(&next.hand);
                        turn_initial = next.has_played_initial;
                    }
                }

                assert!(game.ownership_is_partition(), "seed {} step {}", seed, step);
                let placed = game.players().iter().map(|p| p.hand.len()).sum::<usize>()
                    + game.board().iter().map(Meld::len).sum::<usize>()
                    + game.draw_pile_count();
                assert_eq!(placed, FULL_SET_SIZE, "seed {} step {}", seed, step);
                assert!(game.board().iter().all(Meld::is_legal));
            }
        }
    }
}
