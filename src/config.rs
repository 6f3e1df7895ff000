//! Configuration for both executables.
//!
//! Values come from command-line flags and an optional TOML file. Flags
//! take precedence over the file; the file takes precedence over the
//! built-in defaults.

use crate::client::RetryPolicy;
use crate::error::{Error, Result};
use crate::framing::{self, DEFAULT_MAX_LINE_BYTES};
use crate::response::{DEFAULT_CONTENT_FILE, DEFAULT_HEADER_FILE};
use crate::transport::{Endpoint, Fingerprint, TrustPolicy, DEFAULT_BACKLOG};
use clap::builder::BoolishValueParser;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default server bind address.
pub const DEFAULT_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default server port.
pub const DEFAULT_PORT: u16 = 7777;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "exchange-server")]
#[command(version)]
#[command(about = "Answer line-delimited requests with a templated response", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to (default 127.0.0.1)
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// TCP port to bind to (default 7777)
    #[arg(long)]
    pub port: Option<u16>,

    /// Enable TLS (--ssl, --ssl true, --ssl false)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub ssl: Option<bool>,

    /// Certificate store directory (default: per-user config directory)
    #[arg(long)]
    pub cert_store: Option<PathBuf>,

    /// Response header template file
    #[arg(long)]
    pub header_file: Option<PathBuf>,

    /// Response content file
    #[arg(long)]
    pub content_file: Option<PathBuf>,

    /// Read the response files once at startup instead of per request
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub preload_templates: Option<bool>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Longest accepted request line in bytes
    #[arg(long)]
    pub max_line_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// How the client treats the server certificate.
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TrustMode {
    /// Accept any certificate (insecure)
    AcceptAny,
    /// Verify against the Mozilla root set
    SystemRoots,
    /// Accept only the certificate matching --pin
    Pinned,
}

/// Command-line arguments for the client
#[derive(Parser, Debug, Default)]
#[command(name = "exchange-client")]
#[command(version)]
#[command(about = "Send one line to the server and print its response", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server IP address
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Server TCP port
    #[arg(long)]
    pub port: Option<u16>,

    /// Payload line to send
    #[arg(long)]
    pub data: Option<String>,

    /// Enable TLS (--ssl, --ssl true, --ssl false)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub ssl: Option<bool>,

    /// Server name for the TLS handshake
    #[arg(long)]
    pub ssl_host: Option<String>,

    /// Server certificate trust policy
    #[arg(long, value_enum)]
    pub trust: Option<TrustMode>,

    /// SHA-256 fingerprint for --trust pinned
    #[arg(long)]
    pub pin: Option<String>,

    /// Connect retry attempts after the first failure
    #[arg(long)]
    pub retries: Option<u32>,

    /// Delay before the first retry, doubled on each attempt
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// TCP connect timeout (default: platform default)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` table
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub ssl: Option<bool>,
    pub cert_store: Option<PathBuf>,
    pub header_file: Option<PathBuf>,
    pub content_file: Option<PathBuf>,
    pub preload_templates: Option<bool>,
    pub backlog: Option<i32>,
    pub max_line_bytes: Option<usize>,
}

/// `[client]` table
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub data: Option<String>,
    pub ssl: Option<bool>,
    pub ssl_host: Option<String>,
    pub trust: Option<TrustMode>,
    pub pin: Option<String>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

/// `[logging]` table
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_toml(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Argument(format!("failed to read config file '{}': {e}", path.display()))
    })?;
    toml::from_str(&contents).map_err(|e| {
        Error::Argument(format!("failed to parse config file '{}': {e}", path.display()))
    })
}

fn parse_args<P: Parser, I, T>(args: I) -> Result<P>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    P::try_parse_from(args).map_err(|e| Error::Argument(e.to_string()))
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub ssl: bool,
    /// `None` means the per-user default store.
    pub cert_store: Option<PathBuf>,
    pub header_file: PathBuf,
    pub content_file: PathBuf,
    pub preload_templates: bool,
    pub backlog: i32,
    pub max_line_bytes: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new(DEFAULT_IP, DEFAULT_PORT),
            ssl: false,
            cert_store: None,
            header_file: PathBuf::from(DEFAULT_HEADER_FILE),
            content_file: PathBuf::from(DEFAULT_CONTENT_FILE),
            preload_templates: false,
            backlog: DEFAULT_BACKLOG,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load from the process arguments and the optional TOML file.
    pub fn load() -> Result<Self> {
        Self::resolve(ServerArgs::parse())
    }

    /// Same as [`ServerConfig::load`] for an explicit argument list.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::resolve(parse_args(args)?)
    }

    /// Merge CLI args with the TOML file (CLI takes precedence).
    pub fn resolve(cli: ServerArgs) -> Result<Self> {
        let toml_config = load_toml(cli.config.as_deref())?;
        let file = toml_config.server;
        let defaults = Self::default();

        let backlog = cli.backlog.or(file.backlog).unwrap_or(defaults.backlog);
        if backlog <= 0 {
            return Err(Error::Argument(format!("backlog must be positive, got {backlog}")));
        }
        let max_line_bytes = cli
            .max_line_bytes
            .or(file.max_line_bytes)
            .unwrap_or(defaults.max_line_bytes);
        if max_line_bytes == 0 {
            return Err(Error::Argument("max_line_bytes must be positive".to_string()));
        }

        Ok(Self {
            endpoint: Endpoint::new(
                cli.ip.or(file.ip).unwrap_or(defaults.endpoint.ip),
                cli.port.or(file.port).unwrap_or(defaults.endpoint.port),
            ),
            ssl: cli.ssl.or(file.ssl).unwrap_or(defaults.ssl),
            cert_store: cli.cert_store.or(file.cert_store),
            header_file: cli
                .header_file
                .or(file.header_file)
                .unwrap_or(defaults.header_file),
            content_file: cli
                .content_file
                .or(file.content_file)
                .unwrap_or(defaults.content_file),
            preload_templates: cli
                .preload_templates
                .or(file.preload_templates)
                .unwrap_or(defaults.preload_templates),
            backlog,
            max_line_bytes,
            log_level: cli
                .log_level
                .or(toml_config.logging.level)
                .unwrap_or(defaults.log_level),
        })
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub data: String,
    pub ssl: bool,
    /// Present whenever `ssl` is set.
    pub ssl_host: Option<String>,
    pub trust: TrustPolicy,
    pub retry: RetryPolicy,
    pub connect_timeout: Option<Duration>,
    pub log_level: String,
}

impl ClientConfig {
    /// Load from the process arguments and the optional TOML file.
    pub fn load() -> Result<Self> {
        Self::resolve(ClientArgs::parse())
    }

    /// Same as [`ClientConfig::load`] for an explicit argument list.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::resolve(parse_args(args)?)
    }

    /// Merge CLI args with the TOML file and validate required values.
    pub fn resolve(cli: ClientArgs) -> Result<Self> {
        let toml_config = load_toml(cli.config.as_deref())?;
        let file = toml_config.client;

        let ip = cli.ip.or(file.ip).ok_or_else(|| {
            Error::Argument("IP address is not specified. Use --ip \"{ip_address}\"".to_string())
        })?;
        let port = cli.port.or(file.port).ok_or_else(|| {
            Error::Argument("port is not specified. Use --port {port_number}".to_string())
        })?;
        let data = cli.data.or(file.data).ok_or_else(|| {
            Error::Argument("data is not specified. Use --data \"{data}\"".to_string())
        })?;
        framing::validate_payload(&data)?;

        let ssl = cli.ssl.or(file.ssl).unwrap_or(false);
        let ssl_host = cli
            .ssl_host
            .or(file.ssl_host)
            .filter(|host| !host.trim().is_empty());
        if ssl && ssl_host.is_none() {
            return Err(Error::Argument(
                "SSL enabled, but host is not specified. Use --ssl-host \"{ssl_host}\"".to_string(),
            ));
        }

        let pin = cli.pin.or(file.pin);
        let trust = match cli.trust.or(file.trust).unwrap_or(TrustMode::AcceptAny) {
            TrustMode::AcceptAny => TrustPolicy::AcceptAny,
            TrustMode::SystemRoots => TrustPolicy::SystemRoots,
            TrustMode::Pinned => {
                let pin = pin.ok_or_else(|| {
                    Error::Argument("--trust pinned requires --pin {sha256}".to_string())
                })?;
                TrustPolicy::PinnedFingerprint(pin.parse::<Fingerprint>()?)
            }
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            retries: cli.retries.or(file.retries).unwrap_or(defaults.retries),
            initial_delay: cli
                .retry_delay_ms
                .or(file.retry_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            ..defaults
        };

        let connect_timeout = cli
            .connect_timeout_ms
            .or(file.connect_timeout_ms)
            .map(Duration::from_millis)
            .filter(|t| !t.is_zero());

        Ok(Self {
            endpoint: Endpoint::new(ip, port),
            data,
            ssl,
            ssl_host,
            trust,
            retry,
            connect_timeout,
            log_level: cli
                .log_level
                .or(toml_config.logging.level)
                .unwrap_or_else(default_log_level),
        })
    }
}
