use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Clock, LeaseTable, SystemClock};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DHCP_MIN_MESSAGE_SIZE, DhcpPacket, format_mac};

const RECV_BUFFER_SIZE: usize = 1500;

/// The access point's DHCP server.
///
/// Answers DISCOVER and REQUEST from the one device expected to join and
/// silently drops everything else, including every rejected REQUEST: there
/// is no NAK path.
pub struct LeaseServer {
    handler: LeaseHandler,
    socket: UdpSocket,
    reply_to: SocketAddr,
}

impl LeaseServer {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new())).await
    }

    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let config = Arc::new(config);
        let socket = Self::create_socket(&config)?;
        let reply_to = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::BROADCAST,
            config.dhcp_client_port,
        ));

        info!(
            "DHCP server starting on {}:{} (subnet {})",
            config.server_ip, config.dhcp_server_port, config.subnet_mask
        );
        info!(
            "Lease pool: {} - {}",
            config.lease_address(0),
            config.lease_address(crate::lease::LEASE_SLOTS - 1)
        );

        Ok(Self {
            handler: LeaseHandler::new(config, clock),
            socket,
            reply_to,
        })
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.dhcp_server_port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves datagrams one at a time until the socket fails.
    pub async fn run(&mut self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            let (size, source) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                    continue;
                }
            };

            match self.handler.handle_datagram(&buffer[..size]) {
                Ok(reply) => {
                    if let Err(error) = self.socket.send_to(&reply.encode(), self.reply_to).await {
                        error!("Failed to send {:?} reply: {}", reply.message_type(), error);
                    }
                }
                Err(error @ (Error::PoolExhausted | Error::AddressCollision(_))) => {
                    warn!("Dropping datagram from {}: {}", source, error);
                }
                Err(error) => {
                    debug!("Dropping datagram from {}: {}", source, error);
                }
            }
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        self.handler.leases()
    }

    pub fn config(&self) -> &Config {
        &self.handler.config
    }

    /// Logs the live leases and releases the socket.
    pub fn shutdown(self) {
        let now = self.handler.clock.now_millis();
        for (index, record) in self.handler.table.active(now) {
            info!(
                "Lease {} -> {}",
                format_mac(&record.hardware_address),
                self.handler.config.lease_address(index)
            );
        }
        info!("DHCP server stopped");
    }
}

/// Turns one inbound datagram into at most one reply.
///
/// Every `Err` is a reason to stay silent.
pub struct LeaseHandler {
    config: Arc<Config>,
    table: LeaseTable,
    clock: Arc<dyn Clock>,
}

impl LeaseHandler {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            table: LeaseTable::new(),
            clock,
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.table
    }

    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<DhcpPacket> {
        if data.len() < DHCP_MIN_MESSAGE_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Datagram too short: {} bytes",
                data.len()
            )));
        }

        let packet = DhcpPacket::parse(data)?;

        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("Missing message type".to_string()))?;

        debug!("{} from {}", message_type, packet.format_mac());

        match message_type {
            MessageType::Discover => self.handle_discover(&packet),
            MessageType::Request => self.handle_request(&packet),
            other => Err(Error::Ignored(other)),
        }
    }

    fn handle_discover(&mut self, packet: &DhcpPacket) -> Result<DhcpPacket> {
        let now = self.clock.now_millis();
        let index = self.table.offer_slot(&packet.hardware_address(), now)?;
        let offered_ip = self.config.lease_address(index);

        info!("OFFER {} to {}", offered_ip, packet.format_mac());

        Ok(self.reply(packet, MessageType::Offer, offered_ip))
    }

    fn handle_request(&mut self, packet: &DhcpPacket) -> Result<DhcpPacket> {
        let requested_ip = packet
            .requested_ip()
            .ok_or_else(|| Error::InvalidPacket("No requested address in REQUEST".to_string()))?;

        if !self.config.on_subnet(requested_ip) {
            return Err(Error::SubnetMismatch(requested_ip));
        }

        let index = self
            .config
            .lease_index(requested_ip)
            .ok_or(Error::AddressOutOfRange(requested_ip))?;

        let now = self.clock.now_millis();
        let mac = packet.hardware_address();
        if !self
            .table
            .try_claim(index, &mac, now, self.config.lease_duration_millis())
        {
            return Err(Error::AddressCollision(requested_ip));
        }

        match packet.hostname() {
            Some(hostname) => info!(
                "ACK {} to {} ({})",
                requested_ip,
                packet.format_mac(),
                hostname
            ),
            None => info!("ACK {} to {}", requested_ip, packet.format_mac()),
        }

        Ok(self.reply(packet, MessageType::Ack, requested_ip))
    }

    fn reply(&self, request: &DhcpPacket, message_type: MessageType, your_ip: Ipv4Addr) -> DhcpPacket {
        let server_ip = self.config.server_ip;
        let options = vec![
            DhcpOption::ServerIdentifier(server_ip),
            DhcpOption::SubnetMask(self.config.subnet_mask),
            DhcpOption::Router(server_ip),
            DhcpOption::DnsServer(self.config.dns_server),
            DhcpOption::LeaseTime(self.config.lease_duration_seconds),
        ];

        DhcpPacket::create_reply(request, message_type, your_ip, server_ip, options)
    }
}
