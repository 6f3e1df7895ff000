//! TCP server answering one connection at a time.
//!
//! Each accepted connection walks through
//! `Listening -> Accepted -> (TlsHandshaking ->) Reading -> Responding -> Closed`.
//! A failure at any step closes that connection and the accept loop
//! carries on with the next one.

use crate::certs::CertificateStore;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::framing::RequestLines;
use crate::response::{self, ResponseSource};
use crate::transport::{tls, Listener, Stream};
use chrono::Utc;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Span};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Listening,
    Accepted,
    TlsHandshaking,
    Reading,
    Responding,
    Closed,
}

/// State of the connection currently being served.
#[derive(Debug)]
struct Session {
    peer: SocketAddr,
    state: ConnState,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnState::Listening,
        }
    }

    fn advance(&mut self, next: ConnState) {
        debug!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// What the server learned from one served connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub peer: SocketAddr,
    /// Request lines, terminator excluded.
    pub request: Vec<String>,
    pub response_bytes: usize,
}

/// Server instance
#[derive(Debug)]
pub struct Server {
    listener: Listener,
    responses: ResponseSource,
    max_line_bytes: usize,
    span: Span,
}

impl Server {
    /// Look up the certificate (when TLS is on), load the response
    /// source and bind the listener, in that order.
    ///
    /// A missing certificate fails before any socket is bound.
    pub fn bind(config: &ServerConfig, span: Span) -> Result<Self> {
        let tls = if config.ssl {
            let store = match &config.cert_store {
                Some(path) => CertificateStore::open(path),
                None => CertificateStore::current_user(),
            };
            let certificate = store.find_valid(Utc::now())?;
            span.in_scope(|| {
                info!(
                    certificate = %certificate.friendly_name,
                    thumbprint = %certificate.thumbprint,
                    not_after = %certificate.not_after,
                    "Using certificate"
                )
            });
            Some(tls::server_config(&certificate)?)
        } else {
            None
        };

        let responses = if config.preload_templates {
            ResponseSource::preload(&config.header_file, &config.content_file)?
        } else {
            ResponseSource::files(&config.header_file, &config.content_file)
        };

        let listener = Listener::bind(&config.endpoint, tls, config.backlog)?;
        span.in_scope(|| {
            info!(address = %listener.local_addr(), tls = listener.is_tls(), "Server listening")
        });

        Ok(Self::from_parts(
            listener,
            responses,
            config.max_line_bytes,
            span,
        ))
    }

    pub fn from_parts(
        listener: Listener,
        responses: ResponseSource,
        max_line_bytes: usize,
        span: Span,
    ) -> Self {
        Self {
            listener,
            responses,
            max_line_bytes,
            span,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the process is killed.
    pub fn run(&self) -> ! {
        loop {
            if let Some(pause) = self.dispatch(self.listener.accept_tcp()) {
                std::thread::sleep(pause);
            }
        }
    }

    /// Accept one connection and serve it to completion.
    pub fn serve_next(&self) -> Result<Served> {
        let (tcp, peer) = self.listener.accept_tcp().inspect_err(|e| {
            error!(parent: &self.span, error = %e, "Failed to accept connection");
        })?;
        self.serve(tcp, peer)
    }

    /// Serve an accepted connection, or return how long to back off when
    /// `accept` itself failed (e.g. out of file descriptors).
    fn dispatch(&self, accepted: Result<(TcpStream, SocketAddr)>) -> Option<Duration> {
        match accepted {
            Ok((tcp, peer)) => {
                let _ = self.serve(tcp, peer);
                None
            }
            Err(e) => {
                error!(parent: &self.span, error = %e, "Failed to accept connection");
                Some(ACCEPT_BACKOFF)
            }
        }
    }

    fn serve(&self, tcp: TcpStream, peer: SocketAddr) -> Result<Served> {
        let mut session = Session::new(peer);

        let span = info_span!(parent: &self.span, "connection", peer = %peer);
        let _enter = span.enter();
        info!("Connection accepted");
        session.advance(ConnState::Accepted);

        let result = self.handle(&mut session, tcp);
        match &result {
            Ok(served) => info!(
                lines = served.request.len(),
                bytes = served.response_bytes,
                "Response sent"
            ),
            Err(e) => warn!(state = ?session.state, error = %e, "Connection aborted"),
        }
        session.advance(ConnState::Closed);
        result
    }

    fn handle(&self, session: &mut Session, tcp: TcpStream) -> Result<Served> {
        if self.listener.is_tls() {
            session.advance(ConnState::TlsHandshaking);
        }
        let mut stream = self.listener.establish(tcp)?;

        session.advance(ConnState::Reading);
        let request = self.read_request(&mut stream)?;

        session.advance(ConnState::Responding);
        let response = self.responses.response()?;
        response::write_response(&mut stream, &response)?;

        if let Err(e) = stream.close() {
            debug!(error = %e, "Error while closing stream");
        }

        Ok(Served {
            peer: session.peer,
            request,
            response_bytes: response.header.len() + 1 + response.content_length(),
        })
    }

    fn read_request(&self, stream: &mut Stream) -> Result<Vec<String>> {
        let reader = BufReader::new(stream);
        let mut request = Vec::new();
        for line in RequestLines::new(reader, self.max_line_bytes) {
            let line = line?;
            info!(line = %line, "From client");
            request.push(line);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::Endpoint;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::thread;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        std::fs::write(dir.join("header.txt"), "Content-Length: {0}").unwrap();
        std::fs::write(dir.join("content.txt"), "abc").unwrap();
        ServerConfig {
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            header_file: dir.join("header.txt"),
            content_file: dir.join("content.txt"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_session_starts_listening() {
        let mut session = Session::new("127.0.0.1:7777".parse().unwrap());
        assert_eq!(session.state, ConnState::Listening);
        session.advance(ConnState::Accepted);
        assert_eq!(session.state, ConnState::Accepted);
    }

    #[test]
    fn test_serve_one_plain_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&test_config(dir.path()), Span::none()).unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello\n\n").unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });

        let served = server.serve_next().unwrap();
        assert_eq!(served.request, vec!["hello".to_string()]);
        assert_eq!(served.response_bytes, "Content-Length: 3\nabc".len());
        assert_eq!(client.join().unwrap(), b"Content-Length: 3\nabc");
    }

    #[test]
    fn test_template_failure_does_not_stop_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let server = Server::bind(&config, Span::none()).unwrap();
        let addr = server.local_addr();

        std::fs::write(&config.header_file, "no placeholder").unwrap();
        let first = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"one\n\n").unwrap();
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response);
            response
        });
        assert!(matches!(server.serve_next(), Err(Error::Template(_))));
        assert!(first.join().unwrap().is_empty());

        std::fs::write(&config.header_file, "Content-Length: {0}").unwrap();
        let second = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"two\n\n").unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });
        let served = server.serve_next().unwrap();
        assert_eq!(served.request, vec!["two".to_string()]);
        assert_eq!(second.join().unwrap(), b"Content-Length: 3\nabc");
    }

    #[test]
    fn test_accept_failure_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&test_config(dir.path()), Span::none()).unwrap();
        let emfile = std::io::Error::from_raw_os_error(24);
        assert_eq!(
            server.dispatch(Err(Error::connection("accept", emfile))),
            Some(ACCEPT_BACKOFF)
        );
    }

    #[test]
    fn test_accepted_connection_does_not_back_off() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&test_config(dir.path()), Span::none()).unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hi\n\n").unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });

        let accepted = server.listener.accept_tcp();
        assert_eq!(server.dispatch(accepted), None);
        assert_eq!(client.join().unwrap(), b"Content-Length: 3\nabc");
    }

    #[test]
    fn test_missing_certificate_never_binds() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let config = ServerConfig {
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            ssl: true,
            cert_store: Some(dir.path().join("empty-store")),
            ..test_config(dir.path())
        };

        assert!(matches!(
            Server::bind(&config, Span::none()),
            Err(Error::NotFound(_))
        ));
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_preload_validates_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.preload_templates = true;
        std::fs::write(&config.header_file, "{0} {0}").unwrap();
        assert!(matches!(
            Server::bind(&config, Span::none()),
            Err(Error::Template(_))
        ));
    }
}
