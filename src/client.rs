//! Client role: connect, send one request, drain the response.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::framing;
use crate::transport::{Connector, Endpoint, Stream, TlsClientContext, TransportMode};
use bytes::BytesMut;
use std::time::Duration;
use tracing::{debug, info, warn, Span};

/// Connect retry schedule. The default makes a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure.
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// A configured client. Each call to [`Client::exchange`] uses a fresh
/// connection.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    connector: Connector,
    retry: RetryPolicy,
    span: Span,
}

impl Client {
    /// Build a client from resolved configuration, logging under `span`.
    pub fn new(config: &ClientConfig, span: Span) -> Result<Self> {
        let mode = match (config.ssl, config.ssl_host.as_deref()) {
            (false, _) => TransportMode::Plain,
            (true, Some(host)) => TransportMode::Tls(TlsClientContext::new(host, &config.trust)?),
            (true, None) => {
                return Err(Error::Argument(
                    "SSL enabled, but host is not specified".to_string(),
                ))
            }
        };

        Ok(Self {
            endpoint: config.endpoint,
            connector: Connector::new(mode).with_connect_timeout(config.connect_timeout),
            retry: config.retry,
            span,
        })
    }

    /// Plain-text client with no retries.
    pub fn plain(endpoint: Endpoint, span: Span) -> Self {
        Self::with_mode(endpoint, TransportMode::Plain, span)
    }

    pub fn with_mode(endpoint: Endpoint, mode: TransportMode, span: Span) -> Self {
        Self {
            endpoint,
            connector: Connector::new(mode),
            retry: RetryPolicy::default(),
            span,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send `payload` and return everything the server wrote back.
    pub fn exchange(&self, payload: &str) -> Result<BytesMut> {
        let _enter = self.span.enter();
        framing::validate_payload(payload)?;

        let mut stream = self.connect()?;
        info!(endpoint = %self.endpoint, tls = stream.is_tls(), "Connected to the remote server");

        framing::send_request(&mut stream, payload)?;
        info!(bytes = payload.len(), "Data sent");

        let response = framing::drain(&mut stream)?;
        info!(bytes = response.len(), "Data received");

        if let Err(e) = stream.close() {
            debug!(error = %e, "Error while closing stream");
        }
        Ok(response)
    }

    fn connect(&self) -> Result<Stream> {
        let mut attempt = 0;
        loop {
            match self.connector.connect(&self.endpoint) {
                Err(e @ Error::Connection { .. }) if attempt < self.retry.retries => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        retries = self.retry.retries,
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::thread;
    use tracing::info_span;

    #[test]
    fn test_retry_delay_backoff() {
        let policy = RetryPolicy {
            retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_exchange_reads_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut blank = String::new();
            reader.read_line(&mut blank).unwrap();
            let mut writer = stream;
            // Header claims more than is sent; the client must not care.
            writer.write_all(b"Length: 99\nshort").unwrap();
            (request, blank)
        });

        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let client = Client::plain(endpoint, info_span!("client"));
        let response = client.exchange("hello").unwrap();
        assert_eq!(&response[..], b"Length: 99\nshort");

        let (request, blank) = server.join().unwrap();
        assert_eq!(request, "hello\n");
        assert_eq!(blank, "\n");
    }

    #[test]
    fn test_invalid_payload_never_connects() {
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let client = Client::plain(endpoint, Span::none());
        assert!(matches!(client.exchange("a\nb"), Err(Error::Argument(_))));
    }

    #[test]
    fn test_retries_exhausted() {
        let port = {
            let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let client = Client::plain(endpoint, Span::none()).with_retry(RetryPolicy {
            retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });
        assert!(matches!(client.exchange("x"), Err(Error::Connection { .. })));
    }
}
