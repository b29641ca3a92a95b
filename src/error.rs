//! Error types for the link.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Most DHCP variants never reach a
//! caller: the lease server logs them and drops the datagram.

use std::net::Ipv4Addr;

use crate::options::MessageType;

/// Errors that can occur while serving leases or synchronizing state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// Packets that are too short, have an invalid magic cookie, or carry
    /// truncated options.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Every slot in the lease table is held by a live lease.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// A REQUEST named an address outside the server's subnet.
    #[error("Address {0} is not on the server subnet")]
    SubnetMismatch(Ipv4Addr),

    /// A REQUEST named an address on the subnet but outside the lease pool.
    #[error("Address {0} is outside the lease pool")]
    AddressOutOfRange(Ipv4Addr),

    /// A REQUEST named an address leased to another hardware address, or
    /// came from an address that already holds a live lease elsewhere.
    #[error("Address {0} conflicts with an existing lease")]
    AddressCollision(Ipv4Addr),

    /// A DHCP message type the server does not answer.
    #[error("Ignoring {0} message")]
    Ignored(MessageType),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 or 80 without privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A sync payload whose length matches neither legal form.
    #[error("Malformed sync payload: {length} bytes (expected 3 or {expected})")]
    MalformedSync { length: usize, expected: usize },

    /// A level shape or snapshot that does not fit the fixed capacities.
    #[error("Invalid level shape: {0}")]
    InvalidShape(String),

    /// Send attempted before the session connected.
    #[error("Session is not connected")]
    NotConnected,

    /// The session already went through its terminal path.
    #[error("Session closed")]
    SessionClosed,
}

/// A specialized Result type for link operations.
pub type Result<T> = std::result::Result<T, Error>;
