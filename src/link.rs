//! Network-side loop: moves snapshots between the bridge and the session.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::NetworkPort;
use crate::codec;
use crate::error::Result;
use crate::level::LevelShape;
use crate::session::Session;

/// Counters reported when the link stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub received: u64,
    /// Received while the control side still held the previous message.
    pub dropped: u64,
    pub malformed: u64,
}

enum Step {
    Poll,
    Received(Result<usize>),
}

pub struct Link {
    session: Session,
    port: NetworkPort,
    shape: LevelShape,
    poll: Duration,
    stats: LinkStats,
}

impl Link {
    /// `shape` frames received data until the control side pushes a
    /// message carrying another one.
    pub fn new(session: Session, port: NetworkPort, shape: LevelShape, poll: Duration) -> Self {
        Self {
            session,
            port,
            shape,
            poll,
            stats: LinkStats::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Establishes the session if needed, then shuttles messages until the
    /// session completes or the control side goes away.
    ///
    /// # Errors
    ///
    /// Only establishment errors are returned. Failures after that end the
    /// session through its fatal path and the loop returns normally.
    pub async fn run(mut self) -> Result<LinkStats> {
        if !self.session.is_connected() {
            self.session.establish().await?;
        }

        let mut ticker = time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.session.is_complete() {
            if self.port.is_control_gone() {
                info!("Control side stopped, closing session");
                break;
            }

            let step = tokio::select! {
                _ = ticker.tick() => Step::Poll,
                read = self.session.read_segment() => Step::Received(read),
            };

            match step {
                Step::Poll => self.flush_outbound().await,
                Step::Received(Ok(_)) => self.deliver_inbound(),
                Step::Received(Err(error)) => {
                    debug!("Read ended the session: {}", error);
                }
            }
        }

        self.session.close().await;
        info!(
            "Link stopped: {} sent, {} received, {} dropped, {} malformed",
            self.stats.sent, self.stats.received, self.stats.dropped, self.stats.malformed
        );
        Ok(self.stats)
    }

    async fn flush_outbound(&mut self) {
        let Some(outbound) = self.port.try_take_outbound() else {
            return;
        };
        self.shape = outbound.shape;

        let bytes = match codec::encode(&outbound.message, outbound.shape) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("Dropping unencodable message: {}", error);
                return;
            }
        };

        if self.session.send(&bytes).await.is_ok() {
            self.stats.sent += 1;
        }
    }

    fn deliver_inbound(&mut self) {
        let Some(bytes) = self.session.take_received() else {
            return;
        };

        match codec::decode(bytes, self.shape) {
            Ok(message) => {
                self.stats.received += 1;
                if !self.port.offer_inbound(message) {
                    self.stats.dropped += 1;
                }
            }
            Err(error) => {
                self.stats.malformed += 1;
                debug!("Discarding received payload: {}", error);
            }
        }
    }
}
