//! Tile model.
//!
//! A tile is either a colored, numbered tile or a wildcard. Tiles never change
//! after construction; where a tile lives (hand, draw pile, board) is tracked
//! by [`TileId`] elsewhere.

use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Unique tile identifier within one session.
pub type TileId = u32;

/// Lowest tile number.
pub const MIN_NUMBER: u8 = 1;

/// Highest tile number.
pub const MAX_NUMBER: u8 = 13;

/// Copies of each color/number combination in a full set.
pub const COPIES_PER_TILE: usize = 2;

/// Wildcards in a full set.
pub const WILDCARD_COUNT: usize = 2;

/// Tiles in a full set.
pub const FULL_SET_SIZE: usize =
    Color::ALL.len() * MAX_NUMBER as usize * COPIES_PER_TILE + WILDCARD_COUNT;

/// Points a wildcard left in hand costs at game end.
pub const WILDCARD_PENALTY: u32 = 30;

/// Tile colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Blue,
    Yellow,
    Black,
}

impl Color {
    pub const ALL: [Color; 4] = [Color::Red, Color::Blue, Color::Yellow, Color::Black];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
            Self::Black => "black",
        }
    }
}

/// A single tile.
///
/// Exactly one of (color and number present) or `is_wildcard` holds; use the
/// constructors rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub id: TileId,
    pub color: Option<Color>,
    pub number: Option<u8>,
    pub is_wildcard: bool,
}

impl Tile {
    /// Create a numbered tile.
    pub fn numbered(id: TileId, color: Color, number: u8) -> Self {
        debug_assert!((MIN_NUMBER..=MAX_NUMBER).contains(&number));
        Self {
            id,
            color: Some(color),
            number: Some(number),
            is_wildcard: false,
        }
    }

    /// Create a wildcard.
    pub fn wildcard(id: TileId) -> Self {
        Self {
            id,
            color: None,
            number: None,
            is_wildcard: true,
        }
    }

    /// Check the color/number/wildcard exclusivity rule.
    ///
    /// Deserialized tiles go through this before they are trusted.
    pub fn is_well_formed(&self) -> bool {
        match (self.is_wildcard, self.color, self.number) {
            (true, None, None) => true,
            (false, Some(_), Some(n)) => (MIN_NUMBER..=MAX_NUMBER).contains(&n),
            _ => false,
        }
    }

    /// Points this tile costs when left in a hand at game end.
    pub fn penalty_value(&self) -> u32 {
        if self.is_wildcard {
            WILDCARD_PENALTY
        } else {
            self.number.map(u32::from).unwrap_or(0)
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.color, self.number) {
            (Some(color), Some(number)) if !self.is_wildcard => {
                write!(f, "{}-{}", number, color.as_str())
            }
            _ => write!(f, "wildcard#{}", self.id),
        }
    }
}

/// Build the full 106-tile set with sequential ids, unshuffled.
pub fn full_set() -> Vec<Tile> {
    let mut tiles = Vec::with_capacity(FULL_SET_SIZE);
    let mut next_id: TileId = 0;

    for _ in 0..COPIES_PER_TILE {
        for color in Color::ALL {
            for number in MIN_NUMBER..=MAX_NUMBER {
                tiles.push(Tile::numbered(next_id, color, number));
                next_id += 1;
            }
        }
    }
    for _ in 0..WILDCARD_COUNT {
        tiles.push(Tile::wildcard(next_id));
        next_id += 1;
    }

    tiles
}

/// Build a shuffled full set. A seed makes the order reproducible.
pub fn shuffled_set(seed: Option<u64>) -> Vec<Tile> {
    let mut tiles = full_set();
    match seed {
        Some(seed) => tiles.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => tiles.shuffle(&mut rand::thread_rng()),
    }
    tiles
}

/// Total penalty value of a set of tiles.
pub fn hand_value(tiles: &[Tile]) -> u32 {
    tiles.iter().map(Tile::penalty_value).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_full_set_shape() {
        let tiles = full_set();
        assert_eq!(tiles.len(), 106);
        assert_eq!(tiles.len(), FULL_SET_SIZE);
        assert_eq!(tiles.iter().filter(|t| t.is_wildcard).count(), 2);

        let ids: HashSet<TileId> = tiles.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 106);
        assert!(tiles.iter().all(Tile::is_well_formed));
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let a: Vec<TileId> = shuffled_set(Some(7)).iter().map(|t| t.id).collect();
        let b: Vec<TileId> = shuffled_set(Some(7)).iter().map(|t| t.id).collect();
        assert_eq!(a, b);
        assert_ne!(a, full_set().iter().map(|t| t.id).collect::<Vec<_>>());
    }

    #[test]
    fn test_well_formed() {
        assert!(Tile::numbered(1, Color::Red, 13).is_well_formed());
        assert!(Tile::wildcard(2).is_well_formed());

        let bad = Tile {
            id: 3,
            color: Some(Color::Blue),
            number: None,
            is_wildcard: false,
        };
        assert!(!bad.is_well_formed());

        let both = Tile {
            id: 4,
            color: Some(Color::Blue),
            number: Some(4),
            is_wildcard: true,
        };
        assert!(!both.is_well_formed());
    }

    #[test]
    fn test_display_and_penalty() {
        let seven = Tile::numbered(0, Color::Yellow, 7);
        assert_eq!(seven.to_string(), "7-yellow");
        assert_eq!(seven.penalty_value(), 7);
        assert_eq!(Tile::wildcard(9).penalty_value(), WILDCARD_PENALTY);
        assert_eq!(hand_value(&[seven, Tile::wildcard(9)]), 37);
    }
}
