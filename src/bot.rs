//! Bot move selection.
//!
//! A bot sees what its seat is allowed to see and returns one action at a
//! time. Actions go back through the same command path as human input.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::state::game::PlayerId;
use crate::state::meld::{meld_value, Meld, INITIAL_MELD_MINIMUM, MIN_MELD_SIZE, MAX_GROUP_SIZE};
use crate::state::session::{Session, SessionCommand};
use crate::state::tile::{Color, Tile, TileId};

/// What a bot seat can see on its turn.
#[derive(Debug, Clone, PartialEq)]
pub struct BotView {
    pub player_id: PlayerId,
    pub hand: Vec<Tile>,
    pub board: Vec<Meld>,
    pub has_played_initial: bool,
    pub drew: bool,
    pub played_this_turn: bool,
    pub draw_pile_count: usize,
}

impl BotView {
    /// View for the bot holding the turn, if a bot holds it.
    pub fn from_session(session: &Session) -> Option<Self> {
        let player_id = session.bot_to_move()?;
        let game = session.game();
        let player = game.get_player(player_id)?;
        let progress = game.turn_progress();
        Some(Self {
            player_id,
            hand: player.hand.clone(),
            board: game.board().to_vec(),
            has_played_initial: player.has_played_initial,
            drew: progress.drew,
            played_this_turn: !progress.played_from_hand.is_empty(),
            draw_pile_count: game.draw_pile_count(),
        })
    }
}

/// One bot action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotAction {
    Draw,
    PlaySet(Vec<Vec<TileId>>),
    EndTurn,
}

impl BotAction {
    pub fn into_command(self, player_id: PlayerId) -> SessionCommand {
        match self {
            Self::Draw => SessionCommand::Draw { player_id },
            Self::PlaySet(selection) => SessionCommand::PlaySet {
                player_id,
                selection,
            },
            Self::EndTurn => SessionCommand::EndTurn { player_id },
        }
    }
}

/// Move selection for bot seats.
pub trait BotStrategy: Send + Sync {
    fn choose(&self, view: &BotView) -> BotAction;

    fn name(&self) -> &str;
}

/// Lays down whatever sets it can find in hand, otherwise draws.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleBot;

impl BotStrategy for SimpleBot {
    fn choose(&self, view: &BotView) -> BotAction {
        if view.drew || view.played_this_turn {
            return BotAction::EndTurn;
        }

        let selection = pick_melds(&view.hand, view.has_played_initial);
        if !selection.is_empty() {
            debug!(player_id = view.player_id, melds = selection.len(), "Bot playing sets");
            return BotAction::PlaySet(selection);
        }

        if view.draw_pile_count > 0 {
            BotAction::Draw
        } else {
            BotAction::EndTurn
        }
    }

    fn name(&self) -> &str {
        "simple"
    }
}

/// Disjoint melds from `hand`, best first. Before the initial meld the
/// result is empty unless it reaches the threshold.
fn pick_melds(hand: &[Tile], has_played_initial: bool) -> Vec<Vec<TileId>> {
    let mut candidates = candidate_melds(hand);
    candidates.sort_by_key(|tiles| std::cmp::Reverse(meld_value(tiles)));

    let mut used: HashSet<TileId> = HashSet::new();
    let mut chosen = Vec::new();
    let mut total = 0;
    for tiles in candidates {
        if tiles.iter().any(|t| used.contains(&t.id)) {
            continue;
        }
        used.extend(tiles.iter().map(|t| t.id));
        total += meld_value(&tiles);
        chosen.push(tiles.iter().map(|t| t.id).collect::<Vec<_>>());
    }

    if !has_played_initial && total < INITIAL_MELD_MINIMUM {
        return Vec::new();
    }
    chosen
}

/// Groups and maximal runs made of real tiles only.
fn candidate_melds(hand: &[Tile]) -> Vec<Vec<Tile>> {
    let mut melds = Vec::new();

    // Groups: one tile per color for each number.
    let mut by_number: BTreeMap<u8, Vec<&Tile>> = BTreeMap::new();
    for tile in hand.iter().filter(|t| !t.is_wildcard) {
        if let Some(n) = tile.number {
            by_number.entry(n).or_default().push(tile);
        }
    }
    for tiles in by_number.values() {
        let mut colors: HashSet<Color> = HashSet::new();
        let group: Vec<Tile> = tiles
            .iter()
            .filter(|t| t.color.is_some_and(|c| colors.insert(c)))
            .take(MAX_GROUP_SIZE)
            .map(|t| (*t).clone())
            .collect();
        if group.len() >= MIN_MELD_SIZE {
            melds.push(group);
        }
    }

    // Runs: consecutive numbers per color.
    for color in Color::ALL {
        let mut by_value: BTreeMap<u8, &Tile> = BTreeMap::new();
        for tile in hand.iter().filter(|t| !t.is_wildcard && t.color == Some(color)) {
            if let Some(n) = tile.number {
                by_value.entry(n).or_insert(tile);
            }
        }

        let mut run: Vec<Tile> = Vec::new();
        for (n, tile) in by_value {
            let extends = run.last().and_then(|t| t.number) == Some(n.wrapping_sub(1));
            if !extends {
                if run.len() >= MIN_MELD_SIZE {
                    melds.push(std::mem::take(&mut run));
                }
                run.clear();
            }
            run.push(tile.clone());
        }
        if run.len() >= MIN_MELD_SIZE {
            melds.push(run);
        }
    }

    melds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tile::Color::*;
    use pretty_assertions::assert_eq;

    fn t(id: TileId, color: Color, n: u8) -> Tile {
        Tile::numbered(id, color, n)
    }

    fn view(hand: Vec<Tile>, has_played_initial: bool) -> BotView {
        BotView {
            player_id: 2,
            hand,
            board: Vec::new(),
            has_played_initial,
            drew: false,
            played_this_turn: false,
            draw_pile_count: 10,
        }
    }

    #[test]
    fn test_plays_run_meeting_threshold() {
        let hand = vec![
            t(1, Red, 9),
            t(2, Red, 10),
            t(3, Red, 11),
            t(4, Blue, 2),
        ];
        assert_eq!(
            SimpleBot.choose(&view(hand, false)),
            BotAction::PlaySet(vec![vec![1, 2, 3]])
        );
    }

    #[test]
    fn test_draws_when_below_threshold() {
        let hand = vec![t(1, Red, 1), t(2, Red, 2), t(3, Red, 3), t(4, Blue, 9)];
        assert_eq!(SimpleBot.choose(&view(hand.clone(), false)), BotAction::Draw);

        // Once the initial meld is down, small sets are fine
        assert_eq!(
            SimpleBot.choose(&view(hand, true)),
            BotAction::PlaySet(vec![vec![1, 2, 3]])
        );
    }

    #[test]
    fn test_combines_disjoint_sets() {
        let hand = vec![
            t(1, Red, 8),
            t(2, Blue, 8),
            t(3, Yellow, 8),
            t(4, Black, 3),
            t(5, Black, 4),
            t(6, Black, 5),
            t(7, Red, 8),
        ];
        let BotAction::PlaySet(selection) = SimpleBot.choose(&view(hand, false)) else {
            panic!("expected a play");
        };
        assert_eq!(selection, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_ends_turn_after_acting() {
        let mut v = view(vec![t(1, Red, 1)], false);
        v.drew = true;
        assert_eq!(SimpleBot.choose(&v), BotAction::EndTurn);

        let mut v = view(vec![t(1, Red, 1)], false);
        v.draw_pile_count = 0;
        assert_eq!(SimpleBot.choose(&v), BotAction::EndTurn);
    }

    #[test]
    fn test_run_split_on_gap() {
        let hand = vec![
            t(1, Blue, 1),
            t(2, Blue, 2),
            t(3, Blue, 4),
            t(4, Blue, 5),
            t(5, Blue, 6),
        ];
        let melds = candidate_melds(&hand);
        let ids: Vec<Vec<TileId>> = melds
            .iter()
            .map(|m| m.iter().map(|t| t.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![3, 4, 5]]);
    }

    #[test]
    fn test_action_becomes_command() {
        assert_eq!(
            BotAction::Draw.into_command(4),
            SessionCommand::Draw { player_id: 4 }
        );
    }
}
