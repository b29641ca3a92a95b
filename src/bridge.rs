//! Handoff between the control thread and the network task.
//!
//! Each direction is a single-slot channel. The control side blocks when it
//! gets a full tick ahead of the network; the network side never blocks and
//! drops a received message when the control side has not consumed the
//! previous one yet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use tracing::debug;

use crate::codec::{EndOfLevel, SyncMessage};
use crate::error::{Error, Result};
use crate::level::LevelShape;

/// Snapshots discarded after each gate reset.
pub const WARM_UP_SNAPSHOTS: u32 = 2;

/// How often a blocked push rechecks that the network side still exists.
const PUSH_RECHECK: Duration = Duration::from_millis(20);

/// A message queued for sending, with the shape it must be framed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub message: SyncMessage,
    pub shape: LevelShape,
}

/// Creates a connected pair of ports.
pub fn channel() -> (ControlPort, NetworkPort) {
    let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(1);
    let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(1);
    let network_gone = Arc::new(AtomicBool::new(false));
    let control_gone = Arc::new(AtomicBool::new(false));

    let control = ControlPort {
        outbound_tx,
        outbound_drain: outbound_rx.clone(),
        inbound_rx,
        gate: InboundGate::new(),
        network_gone: Arc::clone(&network_gone),
        control_gone: Arc::clone(&control_gone),
    };
    let network = NetworkPort {
        outbound_rx,
        inbound_tx,
        network_gone,
        control_gone,
    };
    (control, network)
}

/// Control-thread end.
#[derive(Debug)]
pub struct ControlPort {
    outbound_tx: Sender<Outbound>,
    /// Lets the control side retract a snapshot the network has not taken.
    outbound_drain: Receiver<Outbound>,
    inbound_rx: Receiver<SyncMessage>,
    gate: InboundGate,
    network_gone: Arc<AtomicBool>,
    control_gone: Arc<AtomicBool>,
}

impl ControlPort {
    /// Queues `message`, blocking while the previous one is still waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] once the network side is gone.
    pub fn push_outbound(&self, message: SyncMessage, shape: LevelShape) -> Result<()> {
        let mut item = Outbound { message, shape };
        loop {
            if self.network_gone.load(Ordering::Acquire) {
                return Err(Error::SessionClosed);
            }
            match self.outbound_tx.send_timeout(item, PUSH_RECHECK) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::SessionClosed),
            }
        }
    }

    /// Queues `message` only if the slot is free.
    pub fn try_push_outbound(&self, message: SyncMessage, shape: LevelShape) -> Result<bool> {
        if self.network_gone.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        match self.outbound_tx.try_send(Outbound { message, shape }) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(Error::SessionClosed),
        }
    }

    /// Replaces any snapshot still waiting in the slot with `end`.
    pub fn announce_end_of_level(&self, end: EndOfLevel, shape: LevelShape) -> Result<()> {
        if let Ok(stale) = self.outbound_drain.try_recv() {
            debug!("Dropping unsent {:?} for end of level {}", stale.message, end.level);
        }
        self.push_outbound(SyncMessage::EndOfLevel(end), shape)
    }

    /// Takes the latest received message without blocking.
    pub fn poll_inbound(&self) -> Option<SyncMessage> {
        self.inbound_rx.try_recv().ok()
    }

    /// Like [`poll_inbound`](Self::poll_inbound), but passes the message
    /// through the warm-up gate first.
    pub fn poll_admitted(&mut self) -> Option<SyncMessage> {
        let message = self.poll_inbound()?;
        self.gate.admit(&message).then_some(message)
    }

    /// Restarts the warm-up, typically at the start of each level.
    pub fn reset_gate(&mut self) {
        self.gate.reset();
    }

    pub fn is_network_gone(&self) -> bool {
        self.network_gone.load(Ordering::Acquire)
    }
}

/// Network-task end.
#[derive(Debug)]
pub struct NetworkPort {
    outbound_rx: Receiver<Outbound>,
    inbound_tx: Sender<SyncMessage>,
    network_gone: Arc<AtomicBool>,
    control_gone: Arc<AtomicBool>,
}

impl NetworkPort {
    /// Takes at most one queued message. Never blocks.
    pub fn try_take_outbound(&self) -> Option<Outbound> {
        self.outbound_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a queued message.
    pub fn take_outbound_timeout(&self, timeout: Duration) -> Option<Outbound> {
        match self.outbound_rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Hands a received message to the control side. Returns `false` when
    /// the slot is still occupied and the message was dropped.
    pub fn offer_inbound(&self, message: SyncMessage) -> bool {
        match self.inbound_tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Inbound slot full, dropping {:?}", message);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Whether the control side has hung up.
    pub fn is_control_gone(&self) -> bool {
        self.control_gone.load(Ordering::Acquire)
    }
}

impl Drop for ControlPort {
    fn drop(&mut self) {
        self.control_gone.store(true, Ordering::Release);
    }
}

impl Drop for NetworkPort {
    fn drop(&mut self) {
        self.network_gone.store(true, Ordering::Release);
    }
}

/// Ignores remote snapshots until a couple have arrived, so the first
/// frames of a level are not applied from stale remote state.
#[derive(Debug, Clone, Default)]
pub struct InboundGate {
    drained: u32,
}

impl InboundGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message` may be applied. End-of-level messages always pass.
    pub fn admit(&mut self, message: &SyncMessage) -> bool {
        match message {
            SyncMessage::EndOfLevel(_) => true,
            SyncMessage::Snapshot(_) => {
                if self.drained >= WARM_UP_SNAPSHOTS {
                    true
                } else {
                    self.drained += 1;
                    false
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.drained = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Snapshot, WINNER_PLAYER};
    use std::thread;
    use std::time::Instant;

    fn shape() -> LevelShape {
        LevelShape::for_level(1).unwrap()
    }

    fn snapshot(x: u8) -> SyncMessage {
        Snapshot::blank(shape(), x, 0).unwrap().into()
    }

    fn end() -> SyncMessage {
        EndOfLevel {
            level: 1,
            winner: WINNER_PLAYER,
        }
        .into()
    }

    #[test]
    fn test_push_blocks_until_taken() {
        let (control, network) = channel();
        control.push_outbound(snapshot(1), shape()).unwrap();
        assert!(!control.try_push_outbound(snapshot(2), shape()).unwrap());

        let taker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let first = network.try_take_outbound();
            (first, network)
        });

        let started = Instant::now();
        control.push_outbound(snapshot(2), shape()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));

        let (first, network) = taker.join().unwrap();
        assert_eq!(first.unwrap().message, snapshot(1));
        assert_eq!(network.try_take_outbound().unwrap().message, snapshot(2));
    }

    #[test]
    fn test_empty_inbound_poll_returns_immediately() {
        let (control, _network) = channel();
        let started = Instant::now();
        assert!(control.poll_inbound().is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_offer_drops_when_full() {
        let (control, network) = channel();
        assert!(network.offer_inbound(snapshot(1)));
        assert!(!network.offer_inbound(snapshot(2)));
        assert_eq!(control.poll_inbound(), Some(snapshot(1)));
        assert!(network.offer_inbound(snapshot(3)));
    }

    #[test]
    fn test_end_of_level_replaces_pending_snapshot() {
        let (control, network) = channel();
        control.push_outbound(snapshot(1), shape()).unwrap();
        control
            .announce_end_of_level(
                EndOfLevel {
                    level: 1,
                    winner: WINNER_PLAYER,
                },
                shape(),
            )
            .unwrap();

        assert_eq!(network.try_take_outbound().unwrap().message, end());
        assert!(network.try_take_outbound().is_none());
    }

    #[test]
    fn test_gate_discards_first_two_snapshots() {
        let mut gate = InboundGate::new();
        assert!(!gate.admit(&snapshot(1)));
        assert!(gate.admit(&end()));
        assert!(!gate.admit(&snapshot(2)));
        assert!(gate.admit(&snapshot(3)));
        assert!(gate.admit(&snapshot(4)));

        gate.reset();
        assert!(!gate.admit(&snapshot(5)));
    }

    #[test]
    fn test_poll_admitted_applies_gate() {
        let (mut control, network) = channel();
        let mut admitted = Vec::new();
        for x in 0..4 {
            assert!(network.offer_inbound(snapshot(x)));
            admitted.push(control.poll_admitted());
        }
        assert_eq!(admitted, vec![None, None, Some(snapshot(2)), Some(snapshot(3))]);

        control.reset_gate();
        assert!(network.offer_inbound(snapshot(9)));
        assert!(control.poll_admitted().is_none());
    }

    #[test]
    fn test_push_fails_after_network_dropped() {
        let (control, network) = channel();
        control.push_outbound(snapshot(1), shape()).unwrap();
        drop(network);
        assert!(control.is_network_gone());
        assert!(matches!(
            control.push_outbound(snapshot(2), shape()),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_end_of_level_fails_after_network_dropped() {
        let (control, network) = channel();
        drop(network);
        let end = EndOfLevel {
            level: 2,
            winner: WINNER_PLAYER,
        };
        assert!(matches!(
            control.announce_end_of_level(end, shape()),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_control_gone_detected() {
        let (control, network) = channel();
        assert!(!network.is_control_gone());
        drop(control);
        assert!(network.is_control_gone());
    }
}
