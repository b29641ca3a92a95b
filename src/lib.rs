//! # twinlink
//!
//! Networking for a two-player handheld game where one device is the access
//! point and the other joins it.
//!
//! ## Features
//!
//! - Minimal DHCP server with an eight-slot lease table (DISCOVER/OFFER, REQUEST/ACK)
//! - One-peer TCP session with an acceptor and a connector role
//! - Length-classified snapshot codec sized per level
//! - Single-slot handoff between the control thread and the network task
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use twinlink::{bridge, Config, LevelShape, Link, Role, Session};
//!
//! #[tokio::main]
//! async fn main() -> twinlink::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let (control, network) = bridge::channel();
//!     let session = Session::open(Role::Connector, &config)?;
//!     let shape = LevelShape::for_level(1).unwrap_or_default();
//!     let link = Link::new(session, network, shape, Duration::from_millis(config.poll_millis));
//!
//!     std::thread::spawn(move || loop {
//!         if let Some(message) = control.poll_inbound() {
//!             println!("{:?}", message);
//!         }
//!         std::thread::sleep(Duration::from_millis(150));
//!     });
//!     link.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Addresses, ports, lease duration and loop cadence
//! - [`LeaseServer`] - DHCP server on the access point
//! - [`LeaseTable`] - Fixed lease slots with coarse wrapping expiry
//! - [`Session`] - TCP endpoint driving the [`session::Connection`] state machine
//! - [`codec`] - Snapshot and end-of-level framing
//! - [`bridge`] - [`ControlPort`] / [`NetworkPort`] handoff and warm-up gate
//! - [`Link`] - Network loop joining the bridge to the session

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod lease;
pub mod level;
pub mod link;
pub mod options;
pub mod packet;
pub mod server;
pub mod session;

pub use bridge::{ControlPort, InboundGate, NetworkPort};
pub use codec::{EndOfLevel, Snapshot, SyncMessage};
pub use config::Config;
pub use error::{Error, Result};
pub use lease::{LeaseRecord, LeaseTable};
pub use level::LevelShape;
pub use link::{Link, LinkStats};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use server::LeaseServer;
pub use session::{Role, Session, SessionState};
