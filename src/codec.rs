//! Snapshot wire format.
//!
//! ```text
//! Snapshot:   x | y | coin_count | collected[0..coins] | enemy_dead[0..enemies]
//! EndOfLevel: level | winner | 128
//! ```
//!
//! Neither form carries a tag or a length. The receiver tells them apart by
//! the length of what it read, which is why both ends need the same
//! [`LevelShape`]. The third byte of an end-of-level message is a coin count
//! no level can reach.

use crate::error::{Error, Result};
use crate::level::{LevelShape, MAX_COINS, MAX_ENEMIES};

/// Third byte of an end-of-level message.
pub const END_OF_LEVEL_MARKER: u8 = 128;

/// Length of an end-of-level message.
pub const END_OF_LEVEL_LEN: usize = 3;

pub const WINNER_PLAYER: u8 = b'P';
pub const WINNER_WALKER: u8 = b'W';
pub const WINNER_FLOATER: u8 = b'F';

/// A run of at most `N` booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags<const N: usize> {
    bits: [bool; N],
    len: usize,
}

impl<const N: usize> Flags<N> {
    /// `len` cleared flags.
    pub fn new(len: usize) -> Result<Self> {
        if len > N {
            return Err(Error::InvalidShape(format!(
                "{} flags exceeds capacity {}",
                len, N
            )));
        }
        Ok(Self {
            bits: [false; N],
            len,
        })
    }

    pub fn from_slice(values: &[bool]) -> Result<Self> {
        let mut flags = Self::new(values.len())?;
        flags.bits[..values.len()].copy_from_slice(values);
        Ok(flags)
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut flags = Self::new(bytes.len())?;
        for (bit, byte) in flags.bits.iter_mut().zip(bytes) {
            *bit = *byte != 0;
        }
        Ok(flags)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        self.as_slice().get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: bool) -> Result<()> {
        let len = self.len;
        let bit = self.bits[..len].get_mut(index).ok_or_else(|| {
            Error::InvalidShape(format!("flag {} out of range (len {})", index, len))
        })?;
        *bit = value;
        Ok(())
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.bits[..self.len]
    }

    pub fn count(&self) -> usize {
        self.as_slice().iter().filter(|bit| **bit).count()
    }
}

/// One player's per-tick state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub x: u8,
    pub y: u8,
    /// Coins this player picked up. Never [`END_OF_LEVEL_MARKER`].
    pub coin_count: u8,
    /// One flag per coin in the level: already collected by this player.
    pub collected: Flags<MAX_COINS>,
    /// One flag per walker in the level: already defeated.
    pub enemy_dead: Flags<MAX_ENEMIES>,
}

impl Snapshot {
    /// A snapshot at `(x, y)` with nothing collected or defeated.
    pub fn blank(shape: LevelShape, x: u8, y: u8) -> Result<Self> {
        Ok(Self {
            x,
            y,
            coin_count: 0,
            collected: Flags::new(shape.coins())?,
            enemy_dead: Flags::new(shape.enemies())?,
        })
    }

    pub fn fits(&self, shape: LevelShape) -> bool {
        self.collected.len() == shape.coins() && self.enemy_dead.len() == shape.enemies()
    }
}

/// Level over: who or what ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfLevel {
    pub level: u8,
    /// [`WINNER_PLAYER`] when a player reached the house, otherwise the
    /// enemy kind that caught one.
    pub winner: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMessage {
    Snapshot(Snapshot),
    EndOfLevel(EndOfLevel),
}

impl From<Snapshot> for SyncMessage {
    fn from(snapshot: Snapshot) -> Self {
        Self::Snapshot(snapshot)
    }
}

impl From<EndOfLevel> for SyncMessage {
    fn from(end: EndOfLevel) -> Self {
        Self::EndOfLevel(end)
    }
}

/// Frames `message` for a level of the given shape.
///
/// # Errors
///
/// Returns [`Error::InvalidShape`] when a snapshot's flag counts differ from
/// `shape` or its coin count collides with the end-of-level marker.
pub fn encode(message: &SyncMessage, shape: LevelShape) -> Result<Vec<u8>> {
    match message {
        SyncMessage::EndOfLevel(end) => Ok(vec![end.level, end.winner, END_OF_LEVEL_MARKER]),
        SyncMessage::Snapshot(snapshot) => {
            if !snapshot.fits(shape) {
                return Err(Error::InvalidShape(format!(
                    "snapshot has {} coins / {} enemies, level has {} / {}",
                    snapshot.collected.len(),
                    snapshot.enemy_dead.len(),
                    shape.coins(),
                    shape.enemies()
                )));
            }
            if snapshot.coin_count == END_OF_LEVEL_MARKER {
                return Err(Error::InvalidShape(
                    "coin count collides with end-of-level marker".to_string(),
                ));
            }

            let mut buffer = Vec::with_capacity(shape.snapshot_len());
            buffer.extend_from_slice(&[snapshot.x, snapshot.y, snapshot.coin_count]);
            buffer.extend(snapshot.collected.as_slice().iter().map(|bit| u8::from(*bit)));
            buffer.extend(snapshot.enemy_dead.as_slice().iter().map(|bit| u8::from(*bit)));
            Ok(buffer)
        }
    }
}

/// Classifies and parses one received payload.
///
/// # Errors
///
/// Returns [`Error::MalformedSync`] for any length other than the two legal
/// ones for `shape`.
pub fn decode(bytes: &[u8], shape: LevelShape) -> Result<SyncMessage> {
    if let [level, winner, END_OF_LEVEL_MARKER] = *bytes {
        return Ok(SyncMessage::EndOfLevel(EndOfLevel { level, winner }));
    }

    if bytes.len() != shape.snapshot_len() {
        return Err(Error::MalformedSync {
            length: bytes.len(),
            expected: shape.snapshot_len(),
        });
    }

    let (header, flags) = bytes.split_at(3);
    let (collected, enemy_dead) = flags.split_at(shape.coins());

    Ok(SyncMessage::Snapshot(Snapshot {
        x: header[0],
        y: header[1],
        coin_count: header[2],
        collected: Flags::from_wire(collected)?,
        enemy_dead: Flags::from_wire(enemy_dead)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level_one() -> LevelShape {
        LevelShape::new(7, 2).unwrap()
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            x: 3,
            y: 5,
            coin_count: 2,
            collected: Flags::from_slice(&[true, false, false, false, false, false, true]).unwrap(),
            enemy_dead: Flags::from_slice(&[false, true]).unwrap(),
        }
    }

    #[test]
    fn test_snapshot_layout() {
        let encoded = encode(&sample_snapshot().into(), level_one()).unwrap();
        assert_eq!(encoded, vec![3, 5, 2, 1, 0, 0, 0, 0, 0, 1, 0, 1]);

        let decoded = decode(&encoded, level_one()).unwrap();
        assert_eq!(decoded, SyncMessage::Snapshot(sample_snapshot()));
    }

    #[test]
    fn test_end_of_level_layout() {
        let end = EndOfLevel {
            level: 4,
            winner: WINNER_WALKER,
        };
        let encoded = encode(&end.into(), level_one()).unwrap();
        assert_eq!(encoded, vec![4, b'W', 128]);

        for shape in [
            level_one(),
            LevelShape::new(0, 0).unwrap(),
            LevelShape::new(12, 5).unwrap(),
        ] {
            assert_eq!(decode(&encoded, shape).unwrap(), SyncMessage::EndOfLevel(end));
        }
    }

    #[test]
    fn test_wrong_length_is_malformed() {
        let encoded = encode(&sample_snapshot().into(), level_one()).unwrap();

        for length in [0, 1, 2, 4, 11, 13] {
            let mut buffer = encoded.clone();
            buffer.resize(length, 0);
            assert!(matches!(
                decode(&buffer, level_one()),
                Err(Error::MalformedSync { expected: 12, .. })
            ));
        }
    }

    #[test]
    fn test_three_bytes_without_marker() {
        assert!(decode(&[1, 2, 3], level_one()).is_err());

        let empty_level = LevelShape::new(0, 0).unwrap();
        let decoded = decode(&[1, 2, 3], empty_level).unwrap();
        assert_eq!(
            decoded,
            SyncMessage::Snapshot(Snapshot::blank(empty_level, 1, 2).map(|mut s| {
                s.coin_count = 3;
                s
            }).unwrap())
        );
    }

    #[test]
    fn test_nonzero_flag_bytes_read_as_set() {
        let shape = LevelShape::new(2, 1).unwrap();
        let decoded = decode(&[0, 0, 0, 7, 0, 255], shape).unwrap();
        let SyncMessage::Snapshot(snapshot) = decoded else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.collected.as_slice(), &[true, false]);
        assert_eq!(snapshot.enemy_dead.as_slice(), &[true]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let other = LevelShape::new(6, 0).unwrap();
        assert!(matches!(
            encode(&sample_snapshot().into(), other),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn test_reserved_coin_count_rejected() {
        let mut snapshot = sample_snapshot();
        snapshot.coin_count = END_OF_LEVEL_MARKER;
        assert!(encode(&snapshot.into(), level_one()).is_err());
    }

    #[test]
    fn test_flags_bounds() {
        let mut flags = Flags::<4>::new(2).unwrap();
        assert!(flags.set(1, true).is_ok());
        assert!(flags.set(2, true).is_err());
        assert_eq!(flags.get(1), Some(true));
        assert_eq!(flags.get(2), None);
        assert_eq!(flags.count(), 1);
        assert!(Flags::<4>::new(5).is_err());
        assert!(Flags::<4>::from_slice(&[true; 5]).is_err());
    }
}
