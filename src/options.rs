//! DHCP options understood by the lease server.
//!
//! Each option has a code (1 byte), length (1 byte), and variable-length data.
//! The server only reads the message type and requested address from clients
//! and only writes the handful of options a single joining device needs.
//! Everything else is kept as [`DhcpOption::Unknown`].

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// DHCP option codes used by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation).
    Pad = 0,
    SubnetMask = 1,
    /// Router/gateway address. The server names itself.
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    RequestedIpAddress = 50,
    /// Lease time in seconds.
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    /// End of options marker.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53).
///
/// Only [`Discover`](Self::Discover) and [`Request`](Self::Request) are
/// answered; the rest parse so they can be named in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Ipv4Addr),
    DnsServer(Ipv4Addr),
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    /// Any other option, kept raw. Parameter request lists and client
    /// identifiers land here too.
    Unknown(u8, Vec<u8>),
}

fn parse_address(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    match data {
        [a, b, c, d] => Ok(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => Err(Error::InvalidPacket(format!("Invalid {} length", what))),
    }
}

fn encode_address(code: OptionCode, addr: &Ipv4Addr) -> Vec<u8> {
    let mut result = vec![code as u8, 4];
    result.extend_from_slice(&addr.octets());
    result
}

fn encode_bytes(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(255);
    let mut result = vec![code, len as u8];
    result.extend_from_slice(&data[..len]);
    result
}

impl DhcpOption {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Parses a DHCP option from its code and raw data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length is invalid for
    /// the option type. Router and DNS options with several addresses keep
    /// only the first one.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_address(data, "subnet mask")?)),
            Ok(OptionCode::Router) => {
                if data.len() < 4 || !data.len().is_multiple_of(4) {
                    return Err(Error::InvalidPacket(
                        "Invalid router option length".to_string(),
                    ));
                }
                Ok(Self::Router(parse_address(&data[..4], "router")?))
            }
            Ok(OptionCode::DnsServer) => {
                if data.len() < 4 || !data.len().is_multiple_of(4) {
                    return Err(Error::InvalidPacket(
                        "Invalid DNS server option length".to_string(),
                    ));
                }
                Ok(Self::DnsServer(parse_address(&data[..4], "DNS server")?))
            }
            Ok(OptionCode::Hostname) => {
                let name = String::from_utf8_lossy(data).to_string();
                Ok(Self::Hostname(name))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(parse_address(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| {
                    Error::InvalidPacket("Invalid lease time length".to_string())
                })?;
                Ok(Self::LeaseTime(u32::from_be_bytes(bytes)))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(parse_address(
                data,
                "server identifier",
            )?)),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr) => encode_address(OptionCode::SubnetMask, addr),
            Self::Router(addr) => encode_address(OptionCode::Router, addr),
            Self::DnsServer(addr) => encode_address(OptionCode::DnsServer, addr),
            Self::Hostname(name) => encode_bytes(OptionCode::Hostname as u8, name.as_bytes()),
            Self::RequestedIpAddress(addr) => {
                encode_address(OptionCode::RequestedIpAddress, addr)
            }
            Self::LeaseTime(time) => {
                let mut result = vec![OptionCode::LeaseTime as u8, 4];
                result.extend_from_slice(&time.to_be_bytes());
                result
            }
            Self::MessageType(msg_type) => {
                vec![OptionCode::MessageType as u8, 1, *msg_type as u8]
            }
            Self::ServerIdentifier(addr) => encode_address(OptionCode::ServerIdentifier, addr),
            Self::Unknown(code, data) => encode_bytes(*code, data),
        }
    }
}
