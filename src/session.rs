//! The single peer-to-peer TCP session.
//!
//! [`Connection`] holds the session state and reacts to [`SessionEvent`]s.
//! It does no I/O. [`Session`] drives it from tokio sockets: one end is the
//! [`Role::Acceptor`] (the access point, which accepts exactly one client),
//! the other the [`Role::Connector`].
//!
//! Every failure funnels into one fatal path that marks the session
//! complete and tears the connection down. There is no reconnection.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Bytes kept from one received segment. The rest is discarded.
pub const RECEIVE_CAPACITY: usize = 1024;

const READ_CHUNK: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Acceptor,
    Connector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Establishing,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent<'a> {
    Connected,
    DataReceived(&'a [u8]),
    Error,
    Closed,
}

/// What the driver must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    None,
    /// First fatal event: shut the socket down.
    Required,
}

#[derive(Debug, Clone)]
pub struct Connection {
    role: Role,
    state: SessionState,
    connected: bool,
    received_pending: bool,
    complete: bool,
    buffer: [u8; RECEIVE_CAPACITY],
    received_len: usize,
}

impl Connection {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            connected: false,
            received_pending: false,
            complete: false,
            buffer: [0; RECEIVE_CAPACITY],
            received_len: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn has_received(&self) -> bool {
        self.received_pending
    }

    pub fn begin_establish(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Establishing;
        }
    }

    pub fn handle(&mut self, event: SessionEvent<'_>) -> Teardown {
        match event {
            SessionEvent::Connected => {
                if matches!(self.state, SessionState::Idle | SessionState::Establishing) {
                    self.state = SessionState::Connected;
                    self.connected = true;
                }
                Teardown::None
            }
            SessionEvent::DataReceived(bytes) => {
                if self.state == SessionState::Connected {
                    let kept = bytes.len().min(RECEIVE_CAPACITY);
                    if kept < bytes.len() {
                        debug!("Truncating {} byte segment to {}", bytes.len(), kept);
                    }
                    self.buffer[..kept].copy_from_slice(&bytes[..kept]);
                    self.received_len = kept;
                    self.received_pending = true;
                }
                Teardown::None
            }
            SessionEvent::Error | SessionEvent::Closed => self.fail(),
        }
    }

    fn fail(&mut self) -> Teardown {
        if self.complete {
            return Teardown::None;
        }
        self.complete = true;
        self.connected = false;
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
        Teardown::Required
    }

    /// The last received segment, once.
    pub fn take_received(&mut self) -> Option<&[u8]> {
        if !self.received_pending {
            return None;
        }
        self.received_pending = false;
        Some(&self.buffer[..self.received_len])
    }

    pub fn close(&mut self) {
        self.connected = false;
        if !self.state.is_terminal() {
            self.state = SessionState::Closed;
        }
    }
}

enum Endpoint {
    Listener(TcpListener),
    Socket(TcpSocket, SocketAddr),
    Stream(TcpStream),
    None,
}

/// A [`Connection`] bound to real sockets.
pub struct Session {
    connection: Connection,
    endpoint: Endpoint,
    scratch: Box<[u8; READ_CHUNK]>,
}

impl Session {
    /// Opens the endpoint for `role` using the configured port and peer.
    pub fn open(role: Role, config: &Config) -> Result<Self> {
        match role {
            Role::Acceptor => Self::acceptor(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                config.session_port,
            ))),
            Role::Connector => Self::connector(SocketAddr::V4(SocketAddrV4::new(
                config.peer_address,
                config.session_port,
            ))),
        }
    }

    /// Binds `addr` with a backlog of one. Must run inside a tokio runtime.
    pub fn acceptor(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket
            .bind(&addr.into())
            .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", addr, error)))?;

        socket
            .listen(1)
            .map_err(|error| Error::Socket(format!("Failed to listen on {}: {}", addr, error)))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio listener: {}", error))
        })?;

        info!("Session listening on {}", addr);
        Ok(Self::with_endpoint(Role::Acceptor, Endpoint::Listener(listener)))
    }

    /// Creates the client endpoint for `peer`. Nothing is sent until
    /// [`establish`](Self::establish).
    pub fn connector(peer: SocketAddr) -> Result<Self> {
        let socket = match peer {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        Ok(Self::with_endpoint(Role::Connector, Endpoint::Socket(socket, peer)))
    }

    fn with_endpoint(role: Role, endpoint: Endpoint) -> Self {
        Self {
            connection: Connection::new(role),
            endpoint,
            scratch: Box::new([0; READ_CHUNK]),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.endpoint {
            Endpoint::Listener(listener) => Ok(listener.local_addr()?),
            Endpoint::Socket(socket, _) => Ok(socket.local_addr()?),
            Endpoint::Stream(stream) => Ok(stream.local_addr()?),
            Endpoint::None => Err(Error::SessionClosed),
        }
    }

    pub fn role(&self) -> Role {
        self.connection.role()
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_complete(&self) -> bool {
        self.connection.is_complete()
    }

    /// Accepts the one client, or connects to the peer.
    ///
    /// The acceptor stops listening once its client is in; later attempts
    /// are refused.
    pub async fn establish(&mut self) -> Result<()> {
        if self.connection.is_complete() || self.connection.state().is_terminal() {
            return Err(Error::SessionClosed);
        }
        self.connection.begin_establish();

        let outcome = match std::mem::replace(&mut self.endpoint, Endpoint::None) {
            Endpoint::Listener(listener) => listener
                .accept()
                .await
                .map(|(stream, remote)| {
                    info!("Accepted session client {}", remote);
                    stream
                }),
            Endpoint::Socket(socket, peer) => {
                info!("Connecting to {}", peer);
                socket.connect(peer).await
            }
            Endpoint::Stream(stream) => {
                self.endpoint = Endpoint::Stream(stream);
                return Ok(());
            }
            Endpoint::None => return Err(Error::SessionClosed),
        };

        match outcome {
            Ok(stream) => {
                if let Err(error) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", error);
                }
                self.endpoint = Endpoint::Stream(stream);
                self.connection.handle(SessionEvent::Connected);
                info!("Session connected ({:?})", self.connection.role());
                Ok(())
            }
            Err(error) => {
                warn!("Session establish failed: {}", error);
                self.fail(SessionEvent::Error).await;
                Err(error.into())
            }
        }
    }

    /// Waits for the next segment and stores it for
    /// [`take_received`](Self::take_received). Returns the delivered length.
    ///
    /// Cancel safe: nothing is consumed unless the read completes.
    pub async fn read_segment(&mut self) -> Result<usize> {
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return Err(self.unavailable());
        };

        let read = stream.read(&mut self.scratch[..]).await;
        match read {
            Ok(0) => {
                info!("Session closed by peer");
                self.fail(SessionEvent::Closed).await;
                Err(Error::SessionClosed)
            }
            Ok(size) => {
                self.connection
                    .handle(SessionEvent::DataReceived(&self.scratch[..size]));
                Ok(size)
            }
            Err(error) => {
                warn!("Session read failed: {}", error);
                self.fail(SessionEvent::Error).await;
                Err(error.into())
            }
        }
    }

    pub fn take_received(&mut self) -> Option<&[u8]> {
        self.connection.take_received()
    }

    /// Writes `bytes` in full. Any failure ends the session.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(self.unavailable());
        }
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return Err(self.unavailable());
        };

        let written = stream.write_all(bytes).await;
        match written {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("Session write failed: {}", error);
                self.fail(SessionEvent::Error).await;
                Err(error.into())
            }
        }
    }

    /// Tears the session down. Safe to call at any point, more than once.
    pub async fn close(&mut self) {
        self.connection.close();
        if let Endpoint::Stream(mut stream) = std::mem::replace(&mut self.endpoint, Endpoint::None)
            && let Err(error) = stream.shutdown().await
        {
            debug!("Session shutdown on close failed: {}", error);
        }
    }

    fn unavailable(&self) -> Error {
        if self.connection.is_complete() || self.connection.state().is_terminal() {
            Error::SessionClosed
        } else {
            Error::NotConnected
        }
    }

    async fn fail(&mut self, event: SessionEvent<'_>) {
        if self.connection.handle(event) == Teardown::None {
            return;
        }
        if let Endpoint::Stream(mut stream) = std::mem::replace(&mut self.endpoint, Endpoint::None)
            && let Err(error) = stream.shutdown().await
        {
            debug!("Graceful shutdown failed ({}), aborting", error);
            abort(&stream);
        }
    }
}

/// Drops the connection with a reset instead of a FIN.
fn abort(stream: &TcpStream) {
    if let Err(error) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set SO_LINGER: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut connection = Connection::new(Role::Connector);
        assert_eq!(connection.state(), SessionState::Idle);

        connection.begin_establish();
        assert_eq!(connection.state(), SessionState::Establishing);

        assert_eq!(connection.handle(SessionEvent::Connected), Teardown::None);
        assert!(connection.is_connected());
        assert_eq!(connection.state(), SessionState::Connected);

        connection.close();
        assert!(!connection.is_connected());
        assert_eq!(connection.state(), SessionState::Closed);
        connection.close();
        assert_eq!(connection.state(), SessionState::Closed);
    }

    #[test]
    fn test_oversized_segment_truncated() {
        let mut connection = Connection::new(Role::Acceptor);
        connection.handle(SessionEvent::Connected);

        let segment: Vec<u8> = (0..1500).map(|i| i as u8).collect();
        connection.handle(SessionEvent::DataReceived(&segment));

        let received = connection.take_received().unwrap();
        assert_eq!(received.len(), RECEIVE_CAPACITY);
        assert_eq!(received, &segment[..RECEIVE_CAPACITY]);
        assert!(connection.take_received().is_none());
    }

    #[test]
    fn test_latest_segment_wins() {
        let mut connection = Connection::new(Role::Acceptor);
        connection.handle(SessionEvent::Connected);
        connection.handle(SessionEvent::DataReceived(&[1, 2, 3, 4]));
        connection.handle(SessionEvent::DataReceived(&[9, 9]));
        assert!(connection.has_received());
        assert_eq!(connection.take_received(), Some(&[9u8, 9][..]));
    }

    #[test]
    fn test_data_ignored_before_connect() {
        let mut connection = Connection::new(Role::Acceptor);
        connection.handle(SessionEvent::DataReceived(&[1, 2, 3]));
        assert!(connection.take_received().is_none());
    }

    #[test]
    fn test_fatal_path_runs_once() {
        let mut connection = Connection::new(Role::Connector);
        connection.handle(SessionEvent::Connected);

        assert_eq!(connection.handle(SessionEvent::Closed), Teardown::Required);
        assert!(connection.is_complete());
        assert!(!connection.is_connected());
        assert_eq!(connection.state(), SessionState::Failed);

        assert_eq!(connection.handle(SessionEvent::Error), Teardown::None);
        assert_eq!(connection.handle(SessionEvent::Closed), Teardown::None);
        assert_eq!(connection.handle(SessionEvent::Connected), Teardown::None);
        assert!(!connection.is_connected());

        connection.close();
        assert_eq!(connection.state(), SessionState::Failed);
    }

    #[test]
    fn test_fail_from_idle() {
        let mut connection = Connection::new(Role::Connector);
        assert_eq!(connection.handle(SessionEvent::Error), Teardown::Required);
        assert_eq!(connection.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_loopback_exchange() {
        let mut acceptor = Session::acceptor(loopback()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let mut connector = Session::connector(addr).unwrap();

        let (accepted, connected) = tokio::join!(acceptor.establish(), connector.establish());
        accepted.unwrap();
        connected.unwrap();
        assert!(acceptor.is_connected());
        assert!(connector.is_connected());

        connector.send(&[4, b'W', 128]).await.unwrap();
        let size = acceptor.read_segment().await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(acceptor.take_received(), Some(&[4u8, b'W', 128][..]));

        acceptor.send(&[1, 2, 3]).await.unwrap();
        connector.read_segment().await.unwrap();
        assert_eq!(connector.take_received(), Some(&[1u8, 2, 3][..]));

        connector.close().await;
        connector.close().await;
        assert_eq!(connector.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_completes_session() {
        let mut acceptor = Session::acceptor(loopback()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let mut connector = Session::connector(addr).unwrap();

        let (accepted, connected) = tokio::join!(acceptor.establish(), connector.establish());
        accepted.unwrap();
        connected.unwrap();

        connector.close().await;

        assert!(matches!(
            acceptor.read_segment().await,
            Err(Error::SessionClosed)
        ));
        assert!(acceptor.is_complete());
        assert!(!acceptor.is_connected());
        assert!(matches!(acceptor.send(&[0]).await, Err(Error::SessionClosed)));
        assert!(matches!(acceptor.establish().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_close_acceptor_before_connect() {
        let mut acceptor = Session::acceptor(loopback()).unwrap();
        acceptor.close().await;
        acceptor.close().await;

        assert_eq!(acceptor.state(), SessionState::Closed);
        assert!(!acceptor.is_connected());
        assert!(matches!(acceptor.establish().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_close_connector_before_connect() {
        let mut connector = Session::connector(loopback()).unwrap();
        connector.close().await;
        connector.close().await;

        assert_eq!(connector.state(), SessionState::Closed);
        assert!(!connector.is_connected());
        assert!(matches!(connector.establish().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_acceptor_takes_one_client() {
        let mut acceptor = Session::acceptor(loopback()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let mut first = Session::connector(addr).unwrap();

        let (accepted, connected) = tokio::join!(acceptor.establish(), first.establish());
        accepted.unwrap();
        connected.unwrap();

        let mut second = Session::connector(addr).unwrap();
        assert!(second.establish().await.is_err());
        assert!(second.is_complete());
        assert!(acceptor.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal() {
        let vacant = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = vacant.local_addr().unwrap();
        drop(vacant);

        let mut connector = Session::connector(addr).unwrap();
        assert!(connector.establish().await.is_err());
        assert!(connector.is_complete());
        assert_eq!(connector.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut connector = Session::connector(loopback()).unwrap();
        assert!(matches!(connector.send(&[1]).await, Err(Error::NotConnected)));
        assert!(matches!(
            connector.read_segment().await,
            Err(Error::NotConnected)
        ));
    }
}
