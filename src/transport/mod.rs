//! Transport establishment.
//!
//! Turns an [`Endpoint`] into a single bidirectional [`Stream`], either a
//! plain TCP socket or a TLS session over one. All calls block; apart from
//! the optional connect timeout nothing here times out.

pub mod tls;

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use rustls::{
    ClientConfig, ClientConnection, ConnectionCommon, ServerConfig, ServerConnection, StreamOwned,
};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use tls::{Fingerprint, TrustPolicy};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 128;

/// An IP literal and port, validated before any socket is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse an IP literal and a port number.
    pub fn parse(ip: &str, port: &str) -> Result<Self> {
        let ip = ip
            .trim()
            .parse()
            .map_err(|_| Error::Argument(format!("'{ip}' is not a valid IP address")))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| Error::Argument(format!("'{port}' is not a valid port number")))?;
        Ok(Self { ip, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Client-side TLS parameters.
#[derive(Clone)]
pub struct TlsClientContext {
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
}

impl TlsClientContext {
    pub fn new(host: &str, policy: &TrustPolicy) -> Result<Self> {
        Ok(Self {
            server_name: tls::server_name(host)?,
            config: tls::client_config(policy)?,
        })
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

impl fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Whether the client wraps its socket in TLS.
#[derive(Debug, Clone, Default)]
pub enum TransportMode {
    #[default]
    Plain,
    Tls(TlsClientContext),
}

/// The byte stream both roles talk over once the transport is up.
///
/// Dropping a `Stream` releases the socket and any TLS session.
pub enum Stream {
    Plain(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::TlsClient(s) => &s.sock,
            Stream::TlsServer(s) => &s.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Stream::Plain(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Finish the session: `close_notify` for TLS, then shut down the
    /// write half so the peer sees end of stream.
    pub fn close(mut self) -> io::Result<()> {
        match &mut self {
            Stream::Plain(_) => {}
            Stream::TlsClient(s) => s.conn.send_close_notify(),
            Stream::TlsServer(s) => s.conn.send_close_notify(),
        }
        self.flush()?;
        match self.tcp().shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("tls", &self.is_tls())
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::TlsClient(s) => s.read(buf),
            Stream::TlsServer(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::TlsClient(s) => s.write(buf),
            Stream::TlsServer(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::TlsClient(s) => s.flush(),
            Stream::TlsServer(s) => s.flush(),
        }
    }
}

/// Drive the handshake to completion before any application data flows.
fn complete_handshake<C, D>(conn: &mut C, sock: &mut TcpStream) -> Result<()>
where
    C: DerefMut<Target = ConnectionCommon<D>>,
{
    while conn.is_handshaking() {
        conn.complete_io(sock)
            .map_err(|e| Error::TlsHandshake(e.to_string()))?;
    }
    Ok(())
}

/// Opens client connections.
#[derive(Debug, Clone, Default)]
pub struct Connector {
    pub mode: TransportMode,
    /// `None` leaves the platform default in place.
    pub connect_timeout: Option<Duration>,
}

impl Connector {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// TCP connect, then the TLS client handshake when enabled.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<Stream> {
        let addr = endpoint.socket_addr();
        let mut tcp = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| Error::connection(format!("connect to {addr}"), e))?;

        debug!(addr = %addr, tls = matches!(self.mode, TransportMode::Tls(_)), "TCP connection established");

        match &self.mode {
            TransportMode::Plain => Ok(Stream::Plain(tcp)),
            TransportMode::Tls(ctx) => {
                let mut conn =
                    ClientConnection::new(Arc::clone(&ctx.config), ctx.server_name.clone())
                        .map_err(|e| Error::TlsHandshake(e.to_string()))?;
                complete_handshake(&mut conn, &mut tcp)?;
                debug!(
                    addr = %addr,
                    version = ?conn.protocol_version(),
                    "TLS client handshake complete"
                );
                Ok(Stream::TlsClient(Box::new(StreamOwned::new(conn, tcp))))
            }
        }
    }
}

/// Connect to `endpoint` using `mode` with no timeout.
pub fn connect(endpoint: &Endpoint, mode: TransportMode) -> Result<Stream> {
    Connector::new(mode).connect(endpoint)
}

/// A bound, listening socket, optionally terminating TLS.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<ServerConfig>>,
}

impl Listener {
    /// Bind with `SO_REUSEADDR` and the given backlog.
    pub fn bind(endpoint: &Endpoint, tls: Option<Arc<ServerConfig>>, backlog: i32) -> Result<Self> {
        let addr = endpoint.socket_addr();
        let inner = create_listener(addr, backlog).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self {
            inner,
            local_addr,
            tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Block until one inbound TCP handshake completes.
    pub fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr)> {
        self.inner
            .accept()
            .map_err(|e| Error::connection("accept", e))
    }

    /// Run the TLS server handshake on an accepted socket, if enabled.
    pub fn establish(&self, mut tcp: TcpStream) -> Result<Stream> {
        match &self.tls {
            None => Ok(Stream::Plain(tcp)),
            Some(config) => {
                let mut conn = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| Error::TlsHandshake(e.to_string()))?;
                complete_handshake(&mut conn, &mut tcp)?;
                Ok(Stream::TlsServer(Box::new(StreamOwned::new(conn, tcp))))
            }
        }
    }

    /// Accept one connection and complete its handshakes.
    pub fn accept(&self) -> Result<Stream> {
        let (tcp, _) = self.accept_tcp()?;
        self.establish(tcp)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.is_tls())
            .finish()
    }
}

/// Bind and listen on `endpoint` with the default backlog.
pub fn listen_and_accept(endpoint: &Endpoint, tls: Option<Arc<ServerConfig>>) -> Result<Listener> {
    Listener::bind(endpoint, tls, DEFAULT_BACKLOG)
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
