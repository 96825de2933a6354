//! Meld legality.
//!
//! Pure functions deciding whether a set of tiles forms a legal group or run
//! and what it is worth. Legality is an existence check: a meld is legal if
//! some assignment of its wildcards makes it a group or a run.

use serde::{Deserialize, Serialize};

use super::tile::{Color, Tile, TileId, MAX_NUMBER, MIN_NUMBER};

/// Smallest legal meld.
pub const MIN_MELD_SIZE: usize = 3;

/// Largest legal group (one tile per color).
pub const MAX_GROUP_SIZE: usize = 4;

/// Largest legal run (1 through 13).
pub const MAX_RUN_SIZE: usize = 13;

/// Points a player's first placement must reach.
pub const INITIAL_MELD_MINIMUM: u32 = 30;

/// Meld shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeldKind {
    Group,
    Run,
}

/// A meld committed to the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meld {
    pub tiles: Vec<Tile>,
}

impl Meld {
    pub fn new(tiles: Vec<Tile>) -> Self {
        Self { tiles }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, tile_id: TileId) -> bool {
        self.tiles.iter().any(|t| t.id == tile_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.iter().map(|t| t.id)
    }

    pub fn kind(&self) -> Option<MeldKind> {
        classify_meld(&self.tiles)
    }

    pub fn is_legal(&self) -> bool {
        is_legal_meld(&self.tiles)
    }

    pub fn value(&self) -> u32 {
        meld_value(&self.tiles)
    }
}

/// Check whether tiles form a legal group or run.
pub fn is_legal_meld(tiles: &[Tile]) -> bool {
    classify_meld(tiles).is_some()
}

/// Classify tiles as a group or run.
///
/// When both shapes fit (a single real tile plus wildcards, or wildcards
/// only), the group reading wins.
pub fn classify_meld(tiles: &[Tile]) -> Option<MeldKind> {
    if tiles.len() < MIN_MELD_SIZE || !tiles.iter().all(Tile::is_well_formed) {
        return None;
    }

    if is_group(tiles) {
        Some(MeldKind::Group)
    } else if is_run(tiles) {
        Some(MeldKind::Run)
    } else {
        None
    }
}

/// Point value of a meld.
///
/// Wildcards count as the number they stand in for. Illegal melds and
/// wildcard-only melds are worth 0, since nothing anchors their numbers.
pub fn meld_value(tiles: &[Tile]) -> u32 {
    let Some(kind) = classify_meld(tiles) else {
        return 0;
    };

    let numbers = real_numbers(tiles);
    let Some(&lowest) = numbers.first() else {
        return 0;
    };

    match kind {
        MeldKind::Group => u32::from(lowest) * tiles.len() as u32,
        MeldKind::Run => {
            let (start, end) = run_window(&numbers, tiles.len());
            (u32::from(start)..=u32::from(end)).sum()
        }
    }
}

/// Combined value of several melds.
pub fn combined_value<'a>(melds: impl IntoIterator<Item = &'a [Tile]>) -> u32 {
    melds.into_iter().map(meld_value).sum()
}

fn is_group(tiles: &[Tile]) -> bool {
    if tiles.len() > MAX_GROUP_SIZE {
        return false;
    }

    let mut number = None;
    let mut colors: Vec<Color> = Vec::with_capacity(MAX_GROUP_SIZE);

    for tile in tiles.iter().filter(|t| !t.is_wildcard) {
        let (Some(color), Some(n)) = (tile.color, tile.number) else {
            return false;
        };
        match number {
            None => number = Some(n),
            Some(existing) if existing != n => return false,
            _ => {}
        }
        if colors.contains(&color) {
            return false;
        }
        colors.push(color);
    }

    true
}

fn is_run(tiles: &[Tile]) -> bool {
    if tiles.len() > MAX_RUN_SIZE {
        return false;
    }

    let mut color = None;
    for tile in tiles.iter().filter(|t| !t.is_wildcard) {
        match (color, tile.color) {
            (None, Some(c)) => color = Some(c),
            (Some(existing), Some(c)) if existing != c => return false,
            (_, None) => return false,
            _ => {}
        }
    }

    let numbers = real_numbers(tiles);
    if numbers.windows(2).any(|w| w[0] == w[1]) {
        return false;
    }

    match (numbers.first(), numbers.last()) {
        (Some(&low), Some(&high)) => usize::from(high - low) + 1 <= tiles.len(),
        _ => true,
    }
}

/// Sorted numbers of the non-wildcard tiles.
fn real_numbers(tiles: &[Tile]) -> Vec<u8> {
    let mut numbers: Vec<u8> = tiles
        .iter()
        .filter(|t| !t.is_wildcard)
        .filter_map(|t| t.number)
        .collect();
    numbers.sort_unstable();
    numbers
}

/// Window a run occupies: interior gaps first, then upward, then downward.
fn run_window(numbers: &[u8], len: usize) -> (u8, u8) {
    let low = numbers[0];
    let high = numbers[numbers.len() - 1];
    let span = usize::from(high - low) + 1;
    let spare = len.saturating_sub(span);

    let up = spare.min(usize::from(MAX_NUMBER - high));
    let down = (spare - up).min(usize::from(low - MIN_NUMBER));

    (low - down as u8, high + up as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tile::Color::*;

    fn t(id: TileId, color: Color, n: u8) -> Tile {
        Tile::numbered(id, color, n)
    }

    fn w(id: TileId) -> Tile {
        Tile::wildcard(id)
    }

    #[test]
    fn test_plain_groups() {
        assert!(is_legal_meld(&[t(1, Red, 7), t(2, Blue, 7), t(3, Yellow, 7)]));
        assert!(is_legal_meld(&[
            t(1, Red, 7),
            t(2, Blue, 7),
            t(3, Yellow, 7),
            t(4, Black, 7)
        ]));
        assert_eq!(
            classify_meld(&[t(1, Red, 7), t(2, Blue, 7), t(3, Yellow, 7)]),
            Some(MeldKind::Group)
        );

        // Repeated color
        assert!(!is_legal_meld(&[t(1, Red, 7), t(2, Red, 7), t(3, Yellow, 7)]));
        // Mixed numbers, mixed colors
        assert!(!is_legal_meld(&[t(1, Red, 7), t(2, Blue, 8), t(3, Yellow, 7)]));
        // Too small
        assert!(!is_legal_meld(&[t(1, Red, 7), t(2, Blue, 7)]));
    }

    #[test]
    fn test_group_capped_at_four() {
        let five = [
            t(1, Red, 7),
            t(2, Blue, 7),
            t(3, Yellow, 7),
            w(4),
            t(5, Black, 7),
        ];
        assert!(!is_legal_meld(&five));
    }

    #[test]
    fn test_groups_with_wildcards() {
        assert!(is_legal_meld(&[t(1, Red, 9), w(2), t(3, Blue, 9)]));
        assert!(is_legal_meld(&[t(1, Red, 9), w(2), w(3), t(4, Black, 9)]));
        assert_eq!(meld_value(&[t(1, Red, 9), w(2), t(3, Blue, 9)]), 27);
    }

    #[test]
    fn test_plain_runs() {
        assert!(is_legal_meld(&[t(1, Red, 1), t(2, Red, 2), t(3, Red, 3)]));
        assert!(is_legal_meld(&[t(1, Blue, 11), t(2, Blue, 12), t(3, Blue, 13)]));
        assert_eq!(
            classify_meld(&[t(1, Red, 1), t(2, Red, 2), t(3, Red, 3)]),
            Some(MeldKind::Run)
        );

        // Order of presentation does not matter
        assert!(is_legal_meld(&[t(1, Red, 3), t(2, Red, 1), t(3, Red, 2)]));

        // Gap with no wildcard
        assert!(!is_legal_meld(&[t(1, Red, 1), t(2, Red, 2), t(3, Red, 4)]));
        // Mixed colors
        assert!(!is_legal_meld(&[t(1, Red, 1), t(2, Blue, 2), t(3, Red, 3)]));
        // Duplicate number
        assert!(!is_legal_meld(&[
            t(1, Red, 1),
            t(2, Red, 2),
            t(3, Red, 2),
            t(4, Red, 3)
        ]));
    }

    #[test]
    fn test_runs_with_wildcards() {
        // Interior gap
        assert!(is_legal_meld(&[t(1, Red, 4), w(2), t(3, Red, 6)]));
        // Gap wider than wildcards
        assert!(!is_legal_meld(&[t(1, Red, 4), w(2), t(3, Red, 7)]));
        assert!(is_legal_meld(&[t(1, Red, 4), w(2), w(3), t(4, Red, 7)]));

        // Extension at either boundary stays within 1..=13
        assert!(is_legal_meld(&[t(1, Yellow, 12), t(2, Yellow, 13), w(3)]));
        assert!(is_legal_meld(&[w(1), t(2, Yellow, 1), t(3, Yellow, 2)]));
    }

    #[test]
    fn test_run_cannot_exceed_thirteen_tiles() {
        let mut tiles: Vec<Tile> = (1..=13).map(|n| t(u32::from(n), Black, n)).collect();
        assert!(is_legal_meld(&tiles));
        tiles.push(w(99));
        assert!(!is_legal_meld(&tiles));
    }

    #[test]
    fn test_all_wildcards() {
        assert!(is_legal_meld(&[w(1), w(2), w(3)]));
        assert_eq!(meld_value(&[w(1), w(2), w(3)]), 0);
        assert!(!is_legal_meld(&[w(1), w(2)]));
    }

    #[test]
    fn test_run_values() {
        assert_eq!(
            meld_value(&[t(1, Red, 7), t(2, Red, 8), t(3, Red, 9), t(4, Red, 10)]),
            34
        );
        assert_eq!(meld_value(&[t(1, Red, 1), t(2, Red, 2), t(3, Red, 3)]), 6);

        // Wildcard extends upward first
        assert_eq!(meld_value(&[t(1, Red, 5), t(2, Red, 6), w(3)]), 18);
        // Upward blocked at 13, so it extends downward
        assert_eq!(meld_value(&[t(1, Red, 12), t(2, Red, 13), w(3)]), 36);
        // Interior gap filled before extending
        assert_eq!(meld_value(&[t(1, Red, 4), w(2), t(3, Red, 6)]), 15);
    }

    #[test]
    fn test_ambiguous_single_anchor_reads_as_group() {
        let tiles = [t(1, Red, 7), w(2), w(3)];
        assert_eq!(classify_meld(&tiles), Some(MeldKind::Group));
        assert_eq!(meld_value(&tiles), 21);
    }

    #[test]
    fn test_initial_threshold_examples() {
        let group = [t(1, Red, 7), t(2, Blue, 7), t(3, Yellow, 7)];
        assert_eq!(meld_value(&group), 21);
        assert!(meld_value(&group) < INITIAL_MELD_MINIMUM);

        let run = [t(4, Red, 7), t(5, Red, 8), t(6, Red, 9), t(7, Red, 10)];
        assert!(meld_value(&run) >= INITIAL_MELD_MINIMUM);

        let both: [&[Tile]; 2] = [&group, &run];
        assert_eq!(combined_value(both), 55);
    }

    #[test]
    fn test_malformed_tile_rejected() {
        let broken = Tile {
            id: 3,
            color: None,
            number: Some(7),
            is_wildcard: false,
        };
        assert!(!is_legal_meld(&[t(1, Red, 7), t(2, Blue, 7), broken]));
    }
}
