//! line-exchange: a point-to-point line-delimited exchange over TCP or TLS.
//!
//! The client sends one payload line followed by a blank line and prints
//! whatever the server writes back until the connection closes. The
//! server answers every request with a header template (its `{0}` slot
//! filled with the content length) followed by a fixed content body.
//!
//! Modules:
//! - `transport`: plain/TLS stream establishment
//! - `framing`: request line framing
//! - `response`: header templating and response writing
//! - `certs`: per-user certificate store lookup
//! - `server` / `client`: the two roles built on the above

pub mod certs;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod logging;
pub mod response;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
