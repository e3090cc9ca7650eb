//! Certificate Authority and leaf certificate issuance
//!
//! Generates and persists a root CA once, then signs per-hostname leaf
//! certificates on demand for TLS interception.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Leaf certificate validity period in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamps to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// CA validity reaches this many days into the past (1 year)
const CA_BACKDATE_DAYS: i64 = 365;
/// CA validity reaches this many days into the future (100 years)
const CA_LIFETIME_DAYS: i64 = 36_500;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// A leaf certificate forged for a set of hostnames, with its chain.
///
/// One logical instance is shared by every connection presenting the same SNI
/// set; it is read-mostly after creation.
#[derive(Debug)]
pub struct DynamicCertificate {
  /// Hostnames covered by the SAN list, in issue order significance
  pub hostnames: BTreeSet<String>,
  /// Leaf private key in DER form
  pub key_der: PrivateKeyDer<'static>,
  /// Certificate chain: `[leaf, ca]`
  pub chain: Vec<CertificateDer<'static>>,
  /// When this certificate was signed
  pub issued_at: OffsetDateTime,
}

impl Clone for DynamicCertificate {
  fn clone(&self) -> Self {
    Self {
      hostnames: self.hostnames.clone(),
      key_der: self.key_der.clone_key(),
      chain: self.chain.clone(),
      issued_at: self.issued_at,
    }
  }
}

/// Compile-time interface over certificate issuance.
///
/// `CertificateAuthority` is the default implementation; alternates (e.g. a
/// fixed pre-provisioned certificate) can be swapped in at build time.
pub trait CertificateIssuer: Send + Sync {
  /// The trust anchor certificate in DER form
  fn ca_certificate(&self) -> &CertificateDer<'static>;
  /// The trust anchor certificate in PEM form
  fn ca_certificate_pem(&self) -> &str;
  /// Sign a leaf certificate covering `hostnames`, chained to the CA.
  ///
  /// Pure function of its inputs plus CA identity; no I/O. Failures are
  /// fatal to the calling handshake only, never to the process.
  fn issue_leaf(&self, hostnames: &BTreeSet<String>) -> Result<DynamicCertificate>;
}

/// Certificate Authority for generating leaf certificates
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA persisted at `storage_path`, or generate and persist a new
  /// one.
  ///
  /// Idempotent: calling this twice against the same path yields
  /// byte-identical key and certificate material.
  pub async fn ensure(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, ca_cert_der, ca_cert_pem) = if ca_cert_path.exists() && ca_key_path.exists() {
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      storage_path,
    })
  }

  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer from CA cert: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "MockGate Certificate Authority");
    dn.push(DnType::OrganizationName, "MockGate");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // Backdated so restored snapshots and skewed clocks still trust it.
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(CA_BACKDATE_DAYS);
    params.not_after = now + Duration::days(CA_LIFETIME_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  /// Path of the persisted CA certificate, for client installation
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

impl CertificateIssuer for CertificateAuthority {
  fn ca_certificate(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  fn ca_certificate_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  fn issue_leaf(&self, hostnames: &BTreeSet<String>) -> Result<DynamicCertificate> {
    let first = hostnames
      .iter()
      .next()
      .ok_or_else(|| Error::certificate("cannot issue a certificate for zero hostnames"))?;

    let mut params = CertificateParams::default();

    // Random serial so every reissue is distinguishable.
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, first.as_str());
    params.distinguished_name = dn;

    let mut sans = Vec::with_capacity(hostnames.len());
    for hostname in hostnames {
      if let Ok(ip) = hostname.parse::<IpAddr>() {
        // Strict clients check iPAddress for IP targets, others dNSName;
        // include both where rcgen accepts the textual form.
        sans.push(SanType::IpAddress(ip));
        if let Ok(dns_name) = hostname.as_str().try_into() {
          sans.push(SanType::DnsName(dns_name));
        }
      } else {
        sans.push(SanType::DnsName(hostname.as_str().try_into().map_err(
          |_| Error::certificate(format!("invalid hostname: {}", hostname)),
        )?));
      }
    }
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf certificate: {}", e)))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok(DynamicCertificate {
      hostnames: hostnames.clone(),
      key_der,
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      issued_at: now,
    })
  }
}
