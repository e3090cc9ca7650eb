//! Error types for the proxy core

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for proxy core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the proxy core
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Key generation or signing failure, fatal to the calling handshake only
  #[error("certificate issuance error: {0}")]
  CertificateIssuance(String),

  /// Unrecognized byte pattern on a new connection
  #[error("protocol sniff error: {0}")]
  ProtocolSniff(String),

  /// TLS negotiation failure, including non-TLS traffic routed to the TLS path
  #[error("handshake error: {0}")]
  Handshake(String),

  /// Outbound connect for a CONNECT/SOCKS5 tunnel failed
  #[error("tunnel establishment error: {0}")]
  TunnelEstablishment(String),

  /// Failure surfaced by the upstream client connection manager
  #[error("upstream error: {0}")]
  Upstream(#[from] UpstreamError),

  /// HTTP building/parsing error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed inbound request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Typed failures resolved on the response future of `UpstreamClient::send`.
///
/// The caller decides whether to retry; this layer never does.
#[derive(Error, Debug)]
pub enum UpstreamError {
  /// The connect-timeout budget elapsed before the connection opened
  #[error("connect timeout after {0:?}")]
  ConnectTimeout(Duration),

  /// The remote host could not be resolved
  #[error("failed to resolve host: {0}")]
  HostResolution(String),

  /// The connection was closed before a response arrived
  #[error("connection closed before response")]
  ConnectionClosed,

  /// A configured forward proxy refused the connection
  #[error("forward proxy refused connection: {0}")]
  ProxyRefused(String),

  /// IO error while talking to the upstream
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
}

impl Error {
  /// Create a certificate issuance error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::CertificateIssuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a handshake error and log it at warning
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a protocol sniff error and log it
  pub fn sniff(msg: impl Into<String>) -> Self {
    let error = Error::ProtocolSniff(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a tunnel establishment error and log it
  pub fn tunnel(msg: impl Into<String>) -> Self {
    let error = Error::TunnelEstablishment(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}
