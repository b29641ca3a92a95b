//! Fixed-capacity lease table.
//!
//! The access point hands out at most [`LEASE_SLOTS`] addresses. A slot's
//! index is the lease: slot `n` always maps to host `base + n`. Expiry is
//! kept as the top 16 bits of a wrapping millisecond tick counter, so a
//! record is two words and comparisons survive counter rollover.
//!
//! Expired slots are not swept. They are reclaimed only when a DISCOVER scan
//! lands on them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::packet::MAC_LEN;

/// Number of lease slots.
pub const LEASE_SLOTS: usize = 8;

/// Expiry granularity: timestamps are stored as `ticks >> 16` (~65.5 s).
const EXPIRY_SHIFT: u32 = 16;

const UNUSED: [u8; MAC_LEN] = [0; MAC_LEN];

/// Longest lease the wrapping expiry comparison can represent. The stored
/// deadline is rounded up to the end of its coarse window, and the
/// difference from now must stay positive as an `i32`.
pub const MAX_LEASE_MILLIS: u32 = i32::MAX as u32 - 0xffff;

/// Source of the wrapping millisecond tick counter.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u32;
}

/// Milliseconds since construction, wrapping every ~49.7 days.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU32,
}

impl ManualClock {
    pub fn new(millis: u32) -> Self {
        Self {
            millis: AtomicU32::new(millis),
        }
    }

    pub fn set(&self, millis: u32) {
        self.millis.store(millis, Ordering::Relaxed);
    }

    pub fn advance(&self, millis: u32) {
        let _ = self
            .millis
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                Some(now.wrapping_add(millis))
            });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u32 {
        self.millis.load(Ordering::Relaxed)
    }
}

/// Converts an absolute tick deadline to the stored coarse form.
pub fn coarse_expiry(now_millis: u32, duration_millis: u32) -> u16 {
    (now_millis.wrapping_add(duration_millis) >> EXPIRY_SHIFT) as u16
}

/// One hardware address bound to one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    /// All zeros when the slot is unused.
    pub hardware_address: [u8; MAC_LEN],
    pub expiry: u16,
}

impl LeaseRecord {
    pub fn is_unused(&self) -> bool {
        self.hardware_address == UNUSED
    }

    /// The coarse expiry is widened to the end of its 65.5 s window before
    /// a signed wrapping comparison against `now_millis`.
    pub fn is_expired(&self, now_millis: u32) -> bool {
        let expiry = (u32::from(self.expiry) << EXPIRY_SHIFT) | 0xffff;
        (expiry.wrapping_sub(now_millis) as i32) < 0
    }
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    records: [LeaseRecord; LEASE_SLOTS],
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.records = [LeaseRecord::default(); LEASE_SLOTS];
    }

    /// Picks the slot to offer `mac` in a single index-order scan.
    ///
    /// A slot already holding `mac` wins outright, even if it has expired.
    /// Otherwise the first unused or expired slot is chosen, and an expired
    /// one is reclaimed on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when every slot holds a live lease
    /// for some other address.
    pub fn offer_slot(&mut self, mac: &[u8; MAC_LEN], now_millis: u32) -> Result<usize> {
        let mut candidate = None;

        for (index, record) in self.records.iter().enumerate() {
            if record.hardware_address == *mac {
                return Ok(index);
            }
            if candidate.is_none() && (record.is_unused() || record.is_expired(now_millis)) {
                candidate = Some(index);
            }
        }

        let index = candidate.ok_or(Error::PoolExhausted)?;
        if !self.records[index].is_unused() {
            self.records[index].hardware_address = UNUSED;
        }
        Ok(index)
    }

    /// Binds slot `index` to `mac` until `now + duration`.
    ///
    /// Succeeds when the slot is unused or already owned by `mac`. Returns
    /// `false` (and changes nothing) on an out-of-range index, when the
    /// slot belongs to another address (expired or not), or when `mac`
    /// still holds a live lease in a different slot. An expired record of
    /// `mac` elsewhere is released, so an address never owns two records.
    pub fn try_claim(
        &mut self,
        index: usize,
        mac: &[u8; MAC_LEN],
        now_millis: u32,
        duration_millis: u32,
    ) -> bool {
        let Some(record) = self.records.get(index) else {
            return false;
        };

        if !record.is_unused() && record.hardware_address != *mac {
            return false;
        }

        if let Some(other) = self.find(mac)
            && other != index
        {
            if !self.records[other].is_expired(now_millis) {
                return false;
            }
            self.records[other] = LeaseRecord::default();
        }

        let record = &mut self.records[index];
        record.hardware_address = *mac;
        record.expiry = coarse_expiry(now_millis, duration_millis);
        true
    }

    pub fn record(&self, index: usize) -> Option<&LeaseRecord> {
        self.records.get(index)
    }

    /// Slot of the record owned by `mac`, if any.
    pub fn find(&self, mac: &[u8; MAC_LEN]) -> Option<usize> {
        if *mac == UNUSED {
            return None;
        }
        self.records
            .iter()
            .position(|record| record.hardware_address == *mac)
    }

    /// Claimed, unexpired records with their slot indices.
    pub fn active(&self, now_millis: u32) -> impl Iterator<Item = (usize, &LeaseRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(move |(_, record)| !record.is_unused() && !record.is_expired(now_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MILLIS: u32 = 24 * 60 * 60 * 1000;

    fn mac(last: u8) -> [u8; MAC_LEN] {
        [0xaa, 0xbb, 0xcc, 0xdd, 0xee, last]
    }

    #[test]
    fn test_coarse_expiry_truncates() {
        assert_eq!(coarse_expiry(0, DAY_MILLIS), (DAY_MILLIS >> 16) as u16);
        assert_eq!(coarse_expiry(0xffff, 1), 1);
        assert_eq!(coarse_expiry(u32::MAX, 1), 0);
    }

    #[test]
    fn test_expiry_comparison() {
        let record = LeaseRecord {
            hardware_address: mac(1),
            expiry: coarse_expiry(1_000, DAY_MILLIS),
        };
        assert!(!record.is_expired(1_000));
        assert!(!record.is_expired(1_000 + DAY_MILLIS - 1));
        assert!(record.is_expired(1_000 + DAY_MILLIS + 0x1_0000));
    }

    #[test]
    fn test_expiry_survives_rollover() {
        let now = u32::MAX - 10_000;
        let record = LeaseRecord {
            hardware_address: mac(1),
            expiry: coarse_expiry(now, DAY_MILLIS),
        };
        assert!(!record.is_expired(now));
        assert!(!record.is_expired(now.wrapping_add(DAY_MILLIS / 2)));
        assert!(record.is_expired(now.wrapping_add(DAY_MILLIS + 0x2_0000)));
    }

    #[test]
    fn test_longest_lease_is_live_when_granted() {
        for now in [0, 0xffff, 0x8000_0000, u32::MAX - 5] {
            let mut table = LeaseTable::new();
            assert!(table.try_claim(0, &mac(1), now, MAX_LEASE_MILLIS));
            assert!(!table.record(0).unwrap().is_expired(now));
            assert_eq!(table.offer_slot(&mac(2), now).unwrap(), 1);
        }
    }

    #[test]
    fn test_offer_prefers_existing_binding() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(3, &mac(1), 0, DAY_MILLIS));

        assert_eq!(table.offer_slot(&mac(1), 10).unwrap(), 3);
        assert_eq!(table.offer_slot(&mac(2), 10).unwrap(), 0);
    }

    #[test]
    fn test_offer_is_stable_before_request() {
        let mut table = LeaseTable::new();
        let first = table.offer_slot(&mac(1), 0).unwrap();
        let second = table.offer_slot(&mac(1), 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut table = LeaseTable::new();
        for index in 0..LEASE_SLOTS {
            assert!(table.try_claim(index, &mac(index as u8 + 1), 0, DAY_MILLIS));
        }

        assert!(matches!(
            table.offer_slot(&mac(100), 1_000),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    fn test_expired_slot_reclaimed() {
        let mut table = LeaseTable::new();
        for index in 0..LEASE_SLOTS {
            assert!(table.try_claim(index, &mac(index as u8 + 1), 0, DAY_MILLIS));
        }
        let later = 2 * DAY_MILLIS;
        assert!(table.try_claim(1, &mac(2), later, DAY_MILLIS));

        let index = table.offer_slot(&mac(100), later).unwrap();
        assert_eq!(index, 0);
        assert!(table.record(0).unwrap().is_unused());
        assert_eq!(table.record(2).unwrap().hardware_address, mac(3));
    }

    #[test]
    fn test_claim_rejects_other_owner() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(0, &mac(1), 0, DAY_MILLIS));
        assert!(!table.try_claim(0, &mac(2), 0, DAY_MILLIS));
        assert!(table.try_claim(0, &mac(1), 5_000, DAY_MILLIS));
        assert!(!table.try_claim(LEASE_SLOTS, &mac(1), 0, DAY_MILLIS));
    }

    #[test]
    fn test_claim_rejects_expired_other_owner() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(0, &mac(1), 0, 1_000));
        assert!(table.record(0).unwrap().is_expired(DAY_MILLIS));
        assert!(!table.try_claim(0, &mac(2), DAY_MILLIS, DAY_MILLIS));
    }

    #[test]
    fn test_claim_rejects_second_live_slot() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(0, &mac(1), 0, DAY_MILLIS));
        assert!(!table.try_claim(1, &mac(1), 1_000, DAY_MILLIS));

        assert!(table.record(1).unwrap().is_unused());
        let owned: Vec<usize> = table.active(1_000).map(|(index, _)| index).collect();
        assert_eq!(owned, vec![0]);
    }

    #[test]
    fn test_claim_moves_off_expired_slot() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(0, &mac(1), 0, 1_000));

        let later = DAY_MILLIS;
        assert!(table.try_claim(3, &mac(1), later, DAY_MILLIS));
        assert!(table.record(0).unwrap().is_unused());
        assert_eq!(table.find(&mac(1)), Some(3));
    }

    #[test]
    fn test_active_and_clear() {
        let mut table = LeaseTable::new();
        assert!(table.try_claim(0, &mac(1), 0, DAY_MILLIS));
        assert!(table.try_claim(5, &mac(2), 0, 1_000));

        let active: Vec<usize> = table.active(0x4_0000).map(|(index, _)| index).collect();
        assert_eq!(active, vec![0]);
        assert_eq!(table.find(&mac(2)), Some(5));
        assert_eq!(table.find(&UNUSED), None);

        table.clear();
        assert_eq!(table.active(0).count(), 0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(u32::MAX);
        clock.advance(2);
        assert_eq!(clock.now_millis(), 1);
        clock.set(42);
        assert_eq!(clock.now_millis(), 42);
    }
}
