//! Per-level sizes that both ends must agree on before a snapshot can be
//! framed. The level data itself lives with the game.

use crate::error::{Error, Result};

/// Most coins any level places.
pub const MAX_COINS: usize = 12;

/// Most enemies that can be defeated in any level.
pub const MAX_ENEMIES: usize = 5;

/// `(coins, enemies)` for the eight shipped levels.
const LEVELS: [(u8, u8); 8] = [
    (7, 2),
    (6, 0),
    (6, 2),
    (8, 3),
    (9, 3),
    (7, 4),
    (8, 5),
    (12, 4),
];

/// How many coin and enemy flags a snapshot carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LevelShape {
    coins: u8,
    enemies: u8,
}

impl LevelShape {
    pub fn new(coins: usize, enemies: usize) -> Result<Self> {
        if coins > MAX_COINS || enemies > MAX_ENEMIES {
            return Err(Error::InvalidShape(format!(
                "{} coins / {} enemies exceeds {} / {}",
                coins, enemies, MAX_COINS, MAX_ENEMIES
            )));
        }
        Ok(Self {
            coins: coins as u8,
            enemies: enemies as u8,
        })
    }

    /// Shape of level `level` (1-based), if it exists.
    pub fn for_level(level: u8) -> Option<Self> {
        let index = usize::from(level).checked_sub(1)?;
        LEVELS.get(index).map(|&(coins, enemies)| Self { coins, enemies })
    }

    pub fn level_count() -> u8 {
        LEVELS.len() as u8
    }

    pub fn coins(&self) -> usize {
        usize::from(self.coins)
    }

    pub fn enemies(&self) -> usize {
        usize::from(self.enemies)
    }

    /// Wire length of a snapshot for this level.
    pub fn snapshot_len(&self) -> usize {
        3 + self.coins() + self.enemies()
    }
}
