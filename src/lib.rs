#![doc = include_str!("../README.md")]
//!
//! ## Quick start
//!
//! ```no_run
//! use mockgate::{FnMatcher, ProxyConfig, ProxyServer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> mockgate::Result<()> {
//!   let matcher = FnMatcher::new(|request| {
//!     (request.uri().path() == "/ping").then(|| {
//!       http::Response::builder()
//!         .status(200)
//!         .body(bytes::Bytes::from_static(b"pong"))
//!         .unwrap()
//!     })
//!   });
//!   let server = ProxyServer::builder()
//!     .config(ProxyConfig::default())
//!     .matcher(matcher)
//!     .bind("127.0.0.1:1080")
//!     .await?;
//!   server.run().await
//! }
//! ```

pub mod ca;
pub mod codec;
pub mod config;
pub mod error;
pub mod matcher;
pub mod server;
pub mod sniff;
pub mod socks5;
pub mod tls;
pub mod tunnel;
pub mod upstream;

/// Fully buffered HTTP request
pub type Request = http::Request<bytes::Bytes>;
/// Fully buffered HTTP response
pub type Response = http::Response<bytes::Bytes>;

pub use ca::{CertificateAuthority, CertificateIssuer, DynamicCertificate};
pub use config::{CertificatePolicy, ForwardProxy, ForwardProxyKind, ProxyConfig};
pub use error::{Error, Result, UpstreamError};
pub use matcher::{FnMatcher, Matcher};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use sniff::{classify, Classification};
pub use tls::TlsContextCache;
pub use upstream::{NegotiatedProtocol, RemoteAddress, UpstreamClient};
