//! Error taxonomy shared by the client and the server.
//!
//! Argument and certificate errors are fatal at startup. Every other
//! variant is scoped to a single connection.

use std::io;
use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing command-line / config file input.
    #[error("argument error: {0}")]
    Argument(String),

    /// TCP connect, accept or stream I/O failure.
    #[error("connection error: {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The listening socket could not be created or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// TLS setup or handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// Header template is malformed or the template files are unreadable.
    #[error("template error: {0}")]
    Template(String),

    /// No time-valid certificate in the store.
    #[error("no valid certificate found in {}", .0.display())]
    NotFound(PathBuf),

    /// Request violated the line framing rules.
    #[error("framing error: {0}")]
    Framing(String),
}

impl Error {
    /// Wrap an I/O failure on an established or pending connection.
    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        Error::Connection {
            context: context.into(),
            source,
        }
    }
}
