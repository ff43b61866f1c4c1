//! Client TLS configuration
//!
//! Outbound `https`/`wss` connections wrap their non-blocking TCP stream in
//! an OpenSSL client session. The handshake itself is driven by
//! `StreamSocket` as readiness arrives; this module only builds the
//! connector and renders verification results.

use openssl::ssl::{Ssl, SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509VerifyResult;
use std::path::Path;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),
}

/// Client TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    connector: SslConnector,
    verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Whether the peer certificate is verified during the handshake
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Create the per-connection SSL object, with SNI and hostname
    /// verification set up for `host`.
    pub(crate) fn ssl_for(&self, host: &str) -> Result<Ssl, TlsError> {
        let config = self
            .connector
            .configure()?
            .verify_hostname(self.verify_peer)
            .use_server_name_indication(true);
        Ok(config.into_ssl(host)?)
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

/// Client configuration builder
///
/// Settings are applied when `build()` is called so the builder itself
/// stays infallible to chain.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    ca_file: Option<std::path::PathBuf>,
    cipher_list: Option<String>,
    insecure: bool,
}

impl TlsConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Trust the certificates in a PEM file in addition to the system roots
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: &str) -> Self {
        self.cipher_list = Some(ciphers.to_string());
        self
    }

    /// Enable/disable peer certificate verification (enabled by default)
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.insecure = !verify;
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut builder: SslConnectorBuilder = SslConnector::builder(SslMethod::tls_client())?;

        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        }
        if let Some(ca_file) = &self.ca_file {
            builder.set_ca_file(ca_file)?;
        }
        if let Some(ciphers) = &self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }
        if self.insecure {
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            builder.set_verify(SslVerifyMode::PEER);
        }

        Ok(TlsConfig {
            connector: builder.build(),
            verify_peer: !self.insecure,
        })
    }
}

/// Verification outcome of a TLS handshake, captured from the SSL session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub code: i64,
    pub message: String,
}

impl VerifyOutcome {
    pub(crate) fn from_result(result: X509VerifyResult) -> Self {
        VerifyOutcome {
            code: i64::from(result.as_raw()),
            message: result.error_string().to_string(),
        }
    }
}

impl Default for VerifyOutcome {
    fn default() -> Self {
        VerifyOutcome::from_result(X509VerifyResult::OK)
    }
}
