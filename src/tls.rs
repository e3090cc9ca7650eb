//! TLS context cache
//!
//! Wraps the certificate issuer behind lazily-rebuilt rustls configs: a
//! server-side context keyed by the accumulated SAN set (or per hostname,
//! depending on policy) and a permissive client-side context used for
//! outbound connections.

use crate::ca::{CertificateIssuer, DynamicCertificate};
use crate::config::CertificatePolicy;
use crate::error::{Error, Result};
use moka::future::Cache;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Immutable snapshot of a server-side TLS context.
///
/// Old snapshots may still be used by in-flight handshakes after a rebuild;
/// readers never observe a half-built one.
pub struct ServerContext {
  /// Monotonically increasing rebuild counter
  pub version: u64,
  /// The certificate this context serves
  pub certificate: Arc<DynamicCertificate>,
  /// The rustls config built from it
  pub config: Arc<rustls::ServerConfig>,
}

/// Cache of server and client TLS contexts
pub struct TlsContextCache {
  issuer: Arc<dyn CertificateIssuer>,
  policy: CertificatePolicy,
  // SharedMultiSan: last-published snapshot, replaced atomically
  shared: RwLock<Option<Arc<ServerContext>>>,
  // single-writer critical section for rebuilds
  rebuild_lock: tokio::sync::Mutex<()>,
  version: AtomicU64,
  rebuild_server: AtomicBool,
  rebuild_client: AtomicBool,
  per_host: Cache<String, Arc<ServerContext>>,
  client_contexts: RwLock<[Option<Arc<rustls::ClientConfig>>; 2]>,
}

impl TlsContextCache {
  /// Create a cache over `issuer` with the given impersonation policy
  pub fn new(issuer: Arc<dyn CertificateIssuer>, policy: CertificatePolicy) -> Self {
    Self {
      issuer,
      policy,
      shared: RwLock::new(None),
      rebuild_lock: tokio::sync::Mutex::new(()),
      version: AtomicU64::new(0),
      rebuild_server: AtomicBool::new(false),
      rebuild_client: AtomicBool::new(false),
      per_host: Cache::builder().max_capacity(1_000).build(),
      client_contexts: RwLock::new([None, None]),
    }
  }

  /// The issuer backing this cache
  pub fn issuer(&self) -> &Arc<dyn CertificateIssuer> {
    &self.issuer
  }

  /// Force the next server context lookup to reissue certificates
  pub fn schedule_server_rebuild(&self) {
    self.rebuild_server.store(true, Ordering::SeqCst);
  }

  /// Force the next client context lookup to rebuild the config
  pub fn schedule_client_rebuild(&self) {
    self.rebuild_client.store(true, Ordering::SeqCst);
  }

  /// Server-side context covering `hostname`.
  ///
  /// Registers the hostname for SAN inclusion and reissues the certificate
  /// when the SAN set grows or a rebuild is pending; otherwise returns the
  /// cached snapshot without blocking.
  pub async fn server_context(&self, hostname: &str) -> Result<Arc<ServerContext>> {
    match self.policy {
      CertificatePolicy::SharedMultiSan => self.shared_context(hostname).await,
      CertificatePolicy::PerHost => self.per_host_context(hostname).await,
    }
  }

  async fn shared_context(&self, hostname: &str) -> Result<Arc<ServerContext>> {
    if !self.rebuild_server.load(Ordering::SeqCst) {
      let published = self.shared.read().expect("tls context lock poisoned").clone();
      if let Some(snapshot) = published {
        if snapshot.certificate.hostnames.contains(hostname) {
          return Ok(snapshot);
        }
      }
    }

    let _writer = self.rebuild_lock.lock().await;
    let forced = self.rebuild_server.swap(false, Ordering::SeqCst);
    // Another writer may have covered this hostname while we waited.
    let current = self.shared.read().expect("tls context lock poisoned").clone();
    if !forced {
      if let Some(snapshot) = &current {
        if snapshot.certificate.hostnames.contains(hostname) {
          return Ok(snapshot.clone());
        }
      }
    }

    // A forced rebuild starts the SAN set over; otherwise it only grows.
    let mut hostnames = if forced {
      BTreeSet::new()
    } else {
      current
        .as_ref()
        .map(|s| s.certificate.hostnames.clone())
        .unwrap_or_default()
    };
    hostnames.insert(hostname.to_string());

    let snapshot = Arc::new(self.issue_snapshot(hostnames).await?);
    *self.shared.write().expect("tls context lock poisoned") = Some(snapshot.clone());
    tracing::debug!(
      version = snapshot.version,
      hostnames = ?snapshot.certificate.hostnames,
      "rebuilt shared server TLS context"
    );
    Ok(snapshot)
  }

  async fn per_host_context(&self, hostname: &str) -> Result<Arc<ServerContext>> {
    if self.rebuild_server.swap(false, Ordering::SeqCst) {
      self.per_host.invalidate_all();
    }
    if let Some(snapshot) = self.per_host.get(hostname).await {
      return Ok(snapshot);
    }

    let _writer = self.rebuild_lock.lock().await;
    if let Some(snapshot) = self.per_host.get(hostname).await {
      return Ok(snapshot);
    }
    let hostnames = BTreeSet::from([hostname.to_string()]);
    let snapshot = Arc::new(self.issue_snapshot(hostnames).await?);
    self
      .per_host
      .insert(hostname.to_string(), snapshot.clone())
      .await;
    Ok(snapshot)
  }

  /// Sign a certificate for `hostnames` and wrap it in a rustls config.
  ///
  /// Key generation is CPU-bound, so it runs off the event loop.
  async fn issue_snapshot(&self, hostnames: BTreeSet<String>) -> Result<ServerContext> {
    let issuer = self.issuer.clone();
    let certificate = tokio::task::spawn_blocking(move || issuer.issue_leaf(&hostnames))
      .await
      .map_err(|e| Error::certificate(format!("issuance task failed: {}", e)))??;

    let mut config = rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certificate.chain.clone(), certificate.key_der.clone_key())
      .map_err(|e| Error::handshake(format!("failed to build server TLS config: {}", e)))?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(ServerContext {
      version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
      certificate: Arc::new(certificate),
      config: Arc::new(config),
    })
  }

  /// Client-side context that trusts all server certificates (test-tool
  /// posture), optionally offering `h2` in ALPN.
  pub fn client_context(&self, http2: bool) -> Result<Arc<rustls::ClientConfig>> {
    let slot = usize::from(http2);
    if self.rebuild_client.swap(false, Ordering::SeqCst) {
      *self.client_contexts.write().expect("tls context lock poisoned") = [None, None];
    }
    if let Some(config) = &self.client_contexts.read().expect("tls context lock poisoned")[slot] {
      return Ok(config.clone());
    }

    let provider = rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
      .with_protocol_versions(rustls::ALL_VERSIONS)
      .map_err(|e| Error::handshake(format!("invalid TLS versions: {}", e)))?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    config.alpn_protocols = if http2 {
      vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()]
    } else {
      vec![ALPN_HTTP1.to_vec()]
    };

    let config = Arc::new(config);
    self.client_contexts.write().expect("tls context lock poisoned")[slot] = Some(config.clone());
    Ok(config)
  }
}

/// Accepts any server certificate; outbound trust is delegated to the
/// operator of this test tool.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
