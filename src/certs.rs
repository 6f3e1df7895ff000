//! Certificate lookup for the TLS server.
//!
//! The per-user certificate store is a directory of PEM files. Each file
//! is one entry: a certificate chain (end-entity first) plus the private
//! key for it. Entries are enumerated in file name order and the first
//! one whose validity window covers today's UTC date wins.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory name under the user's config directory.
const STORE_DIR: &str = "line-exchange/certs";

/// Upper-case hex SHA-256 of a DER-encoded certificate.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// A TLS identity taken from the store.
pub struct Certificate {
    /// Full subject distinguished name.
    pub subject: String,
    /// Common name, or the file stem when the subject has none.
    pub friendly_name: String,
    /// SHA-256 thumbprint of the end-entity certificate.
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Store entry this identity was loaded from.
    pub source: PathBuf,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Certificate {
    /// Load one store entry.
    pub fn from_pem_file(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut chain = Vec::new();
        let mut key = None;

        for item in rustls_pemfile::read_all(&mut reader) {
            match item? {
                rustls_pemfile::Item::X509Certificate(cert) => chain.push(cert),
                rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => key = Some(k.into()),
                rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => key = Some(k.into()),
                rustls_pemfile::Item::Sec1Key(k) if key.is_none() => key = Some(k.into()),
                _ => continue,
            }
        }

        let end_entity = chain
            .first()
            .ok_or_else(|| invalid(format!("no certificate in {}", path.display())))?;
        let key = key.ok_or_else(|| invalid(format!("no private key in {}", path.display())))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|e| invalid(format!("bad certificate in {}: {e}", path.display())))?;

        let validity = parsed.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let subject = parsed.subject().to_string();
        let friendly_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();

        Ok(Self {
            subject,
            friendly_name,
            thumbprint: fingerprint(end_entity.as_ref()),
            not_before,
            not_after,
            source: path.to_path_buf(),
            chain,
            key,
        })
    }

    /// Whether the validity window includes the UTC date of `now`.
    pub fn is_valid_on(&self, now: DateTime<Utc>) -> bool {
        let date = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        self.not_before <= date && date <= self.not_after
    }

    /// Certificate chain, end-entity first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn clone_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("friendly_name", &self.friendly_name)
            .field("thumbprint", &self.thumbprint)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// The per-user certificate store.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    path: PathBuf,
}

impl CertificateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under `$XDG_CONFIG_HOME`, falling back to `$HOME/.config`.
    pub fn current_user() -> Self {
        Self::open(default_store_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store entries in enumeration order.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "pem"))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// First entry that is time-valid on `now`'s UTC date.
    pub fn find_valid(&self, now: DateTime<Utc>) -> Result<Certificate> {
        let entries = self.entries().map_err(|e| {
            warn!(store = %self.path.display(), error = %e, "Cannot open certificate store");
            Error::NotFound(self.path.clone())
        })?;

        for path in entries {
            match Certificate::from_pem_file(&path) {
                Ok(cert) if cert.is_valid_on(now) => return Ok(cert),
                Ok(cert) => {
                    debug!(
                        entry = %path.display(),
                        not_before = %cert.not_before,
                        not_after = %cert.not_after,
                        "Skipping certificate outside its validity window"
                    );
                }
                Err(e) => {
                    warn!(entry = %path.display(), error = %e, "Skipping unreadable store entry");
                }
            }
        }

        Err(Error::NotFound(self.path.clone()))
    }
}

/// Look up a currently valid certificate in the current user's store.
pub fn find_certificate() -> Result<Certificate> {
    CertificateStore::current_user().find_valid(Utc::now())
}

fn default_store_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join(STORE_DIR)
}

fn timestamp(secs: i64) -> io::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| invalid(format!("timestamp {secs} out of range")))
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
