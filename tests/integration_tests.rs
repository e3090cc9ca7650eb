use bytes::Bytes;
use mockgate::{
  CertificateAuthority, CertificateIssuer, CertificatePolicy, FnMatcher, ProxyConfig, ProxyServer,
  TlsContextCache, UpstreamClient,
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;

fn temp_storage(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("mockgate-it-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn ping_matcher() -> Arc<FnMatcher<impl Fn(&mockgate::Request) -> Option<mockgate::Response>>> {
  FnMatcher::new(|request| {
    (request.uri().path() == "/ping").then(|| {
      http::Response::builder()
        .status(200)
        .body(Bytes::from_static(b"pong"))
        .unwrap()
    })
  })
}

async fn start_proxy(name: &str, config: ProxyConfig) -> (SocketAddr, String) {
  tracing_subscriber::fmt()
    .with_test_writer()
    .with_max_level(tracing::Level::DEBUG)
    .try_init()
    .ok();
  let mut config = config;
  config.ca_storage_path = temp_storage(name);
  let server = ProxyServer::builder()
    .config(config)
    .matcher(ping_matcher())
    .bind("127.0.0.1:0")
    .await
    .unwrap();
  let addr = server.local_addr().unwrap();
  let ca_pem = server.ca_certificate_pem();
  tokio::spawn(server.run());
  (addr, ca_pem)
}

async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 4096];
  loop {
    let n = stream.read(&mut chunk).await.unwrap();
    assert!(n > 0, "peer closed before {:?} arrived", needle);
    buf.extend_from_slice(&chunk[..n]);
    if buf.windows(needle.len()).any(|w| w == needle) {
      return buf;
    }
  }
}

#[tokio::test]
async fn ca_bootstrap_is_idempotent() {
  let dir = temp_storage("ca-idempotent");
  let first = CertificateAuthority::ensure(&dir).await.unwrap();
  let first_pem = first.ca_certificate_pem().to_string();
  let first_key = std::fs::read(dir.join("ca_key.pem")).unwrap();
  drop(first);

  let second = CertificateAuthority::ensure(&dir).await.unwrap();
  assert_eq!(second.ca_certificate_pem(), first_pem);
  assert_eq!(std::fs::read(dir.join("ca_key.pem")).unwrap(), first_key);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn shared_policy_accumulates_sans_and_versions() {
  let dir = temp_storage("san-accumulation");
  let ca = CertificateAuthority::ensure(&dir).await.unwrap();
  let cache = TlsContextCache::new(Arc::new(ca), CertificatePolicy::SharedMultiSan);

  let first = cache.server_context("a.example.com").await.unwrap();
  assert_eq!(
    first.certificate.hostnames,
    BTreeSet::from(["a.example.com".to_string()])
  );

  let second = cache.server_context("b.example.com").await.unwrap();
  assert!(second.version > first.version);
  assert_eq!(
    second.certificate.hostnames,
    BTreeSet::from(["a.example.com".to_string(), "b.example.com".to_string()])
  );

  // already covered, no reissue
  let third = cache.server_context("a.example.com").await.unwrap();
  assert_eq!(third.version, second.version);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn forced_rebuild_resets_the_san_set() {
  let dir = temp_storage("san-reset");
  let ca = CertificateAuthority::ensure(&dir).await.unwrap();
  let cache = TlsContextCache::new(Arc::new(ca), CertificatePolicy::SharedMultiSan);

  cache.server_context("a.example.com").await.unwrap();
  cache.server_context("b.example.com").await.unwrap();
  cache.schedule_server_rebuild();
  let rebuilt = cache.server_context("c.example.com").await.unwrap();
  assert_eq!(
    rebuilt.certificate.hostnames,
    BTreeSet::from(["c.example.com".to_string()])
  );
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn plaintext_request_is_matched() {
  let (addr, _) = start_proxy("plain-matched", ProxyConfig::default()).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET http://example.com/ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
    .await
    .unwrap();
  let reply = read_until(&mut client, b"pong").await;
  assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn keep_alive_serves_multiple_requests() {
  let (addr, _) = start_proxy("keep-alive", ProxyConfig::default()).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  for _ in 0..3 {
    client
      .write_all(b"GET http://example.com/ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
      .await
      .unwrap();
    read_until(&mut client, b"pong").await;
  }
}

#[tokio::test]
async fn connect_interception_decodes_the_interior() {
  let (addr, _) = start_proxy("connect-intercept", ProxyConfig::default()).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nhost: example.com:80\r\n\r\n")
    .await
    .unwrap();
  read_until(&mut client, b"\r\n\r\n").await;

  // interior bytes are re-classified and served like direct traffic
  client
    .write_all(b"GET /ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
    .await
    .unwrap();
  let reply = read_until(&mut client, b"pong").await;
  assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn socks5_interception_decodes_the_interior() {
  let (addr, _) = start_proxy("socks5-intercept", ProxyConfig::default()).await;
  let mut client = TcpStream::connect(addr).await.unwrap();

  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut choice = [0u8; 2];
  client.read_exact(&mut choice).await.unwrap();
  assert_eq!(choice, [0x05, 0x00]);

  let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
  request.extend_from_slice(b"example.com");
  request.extend_from_slice(&80u16.to_be_bytes());
  client.write_all(&request).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[..2], [0x05, 0x00]);

  client
    .write_all(b"GET /ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
    .await
    .unwrap();
  let reply = read_until(&mut client, b"pong").await;
  assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn transparent_tunnel_relays_bytes_untouched() {
  let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let echo_addr = echo.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = echo.accept().await.unwrap();
    let (mut reader, mut writer) = stream.split();
    tokio::io::copy(&mut reader, &mut writer).await.ok();
  });

  let config = ProxyConfig {
    https_interception: false,
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy("transparent-tunnel", config).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(format!("CONNECT {} HTTP/1.1\r\nhost: {}\r\n\r\n", echo_addr, echo_addr).as_bytes())
    .await
    .unwrap();
  read_until(&mut client, b"200 Connection Established\r\n\r\n").await;

  let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
  client.write_all(&payload).await.unwrap();
  let mut echoed = vec![0u8; payload.len()];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(echoed, payload);
}

#[tokio::test]
async fn transparent_tunnel_to_dead_port_returns_502() {
  let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_addr = reserved.local_addr().unwrap();
  drop(reserved);

  let config = ProxyConfig {
    https_interception: false,
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy("tunnel-502", config).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(format!("CONNECT {} HTTP/1.1\r\nhost: {}\r\n\r\n", dead_addr, dead_addr).as_bytes())
    .await
    .unwrap();
  let reply = read_until(&mut client, b"\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn unmatched_request_to_dead_upstream_returns_502() {
  let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_addr = reserved.local_addr().unwrap();
  drop(reserved);

  let (addr, _) = start_proxy("forward-502", ProxyConfig::default()).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(
      format!(
        "GET http://{}/missing HTTP/1.1\r\nhost: {}\r\n\r\n",
        dead_addr, dead_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let reply = read_until(&mut client, b"\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn tls_interception_presents_a_trusted_forged_certificate() {
  let (addr, ca_pem) = start_proxy("tls-intercept", ProxyConfig::default()).await;

  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let client_config = rustls::ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

  let tcp = TcpStream::connect(addr).await.unwrap();
  let server_name = rustls::pki_types::ServerName::try_from("example.com").unwrap();
  // verification succeeds only if the forged leaf chains to the proxy CA
  // and carries the SNI hostname in its SAN list
  let mut tls = connector.connect(server_name, tcp).await.unwrap();

  tls
    .write_all(b"GET /ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
    .await
    .unwrap();
  let reply = read_until(&mut tls, b"pong").await;
  assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

async fn tls_upstream(
  name: &str,
  alpn: &[&[u8]],
  serve_h2: bool,
) -> (SocketAddr, Arc<CertificateAuthority>) {
  let dir = temp_storage(name);
  let ca = Arc::new(CertificateAuthority::ensure(&dir).await.unwrap());
  let leaf = ca
    .issue_leaf(&BTreeSet::from(["127.0.0.1".to_string()]))
    .unwrap();
  let mut server_config = rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(leaf.chain.clone(), leaf.key_der.clone_key())
    .unwrap();
  server_config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (tcp, _) = listener.accept().await.unwrap();
    let tls = acceptor.accept(tcp).await.unwrap();
    if serve_h2 {
      let mut connection = h2::server::handshake(tls).await.unwrap();
      while let Some(request) = connection.accept().await {
        let (_request, mut respond) = request.unwrap();
        let response = http::Response::builder().status(200).body(()).unwrap();
        respond.send_response(response, true).unwrap();
      }
    } else {
      let mut tls = tls;
      read_until(&mut tls, b"\r\n\r\n").await;
      tls
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi")
        .await
        .unwrap();
    }
  });
  (addr, ca)
}

#[tokio::test]
async fn upstream_negotiates_h2_when_offered() {
  let (addr, ca) = tls_upstream("upstream-h2", &[b"h2"], true).await;
  let cache = Arc::new(TlsContextCache::new(ca, CertificatePolicy::PerHost));
  let client = UpstreamClient::new(cache, None, Duration::from_secs(5));

  let request = http::Request::builder()
    .uri(format!("https://{}/", addr))
    .body(Bytes::new())
    .unwrap();
  let response = client.send(request, None).await.unwrap();
  assert_eq!(response.status(), 200);
  assert_eq!(response.version(), http::Version::HTTP_2);
}

#[tokio::test]
async fn upstream_falls_back_to_http11() {
  let (addr, ca) = tls_upstream("upstream-h1", &[b"http/1.1"], false).await;
  let cache = Arc::new(TlsContextCache::new(ca, CertificatePolicy::PerHost));
  let client = UpstreamClient::new(cache, None, Duration::from_secs(5));

  let request = http::Request::builder()
    .uri(format!("https://{}/", addr))
    .body(Bytes::new())
    .unwrap();
  let response = client.send(request, None).await.unwrap();
  assert_eq!(response.status(), 200);
  assert_eq!(response.version(), http::Version::HTTP_11);
  assert_eq!(response.body().as_ref(), b"hi");
}

#[tokio::test]
async fn upstream_detects_h2_without_alpn() {
  // server speaks h2 but advertises nothing in ALPN; its SETTINGS preface
  // is the only protocol signal
  let (addr, ca) = tls_upstream("upstream-h2-noalpn", &[], true).await;
  let cache = Arc::new(TlsContextCache::new(ca, CertificatePolicy::PerHost));
  let client = UpstreamClient::new(cache, None, Duration::from_secs(5));

  let request = http::Request::builder()
    .uri(format!("https://{}/", addr))
    .body(Bytes::new())
    .unwrap();
  let response = client.send(request, None).await.unwrap();
  assert_eq!(response.status(), 200);
  assert_eq!(response.version(), http::Version::HTTP_2);
}

#[tokio::test]
async fn upstream_connect_failure_is_typed() {
  let dir = temp_storage("typed-connect-failure");
  let ca = Arc::new(CertificateAuthority::ensure(&dir).await.unwrap());
  let cache = Arc::new(TlsContextCache::new(ca, CertificatePolicy::PerHost));
  let client = UpstreamClient::new(cache, None, Duration::from_millis(50));

  // RFC 5737 TEST-NET address: black-holed on routed networks, fails fast
  // where outbound traffic is filtered
  let request = http::Request::builder()
    .uri("http://192.0.2.1:81/")
    .body(Bytes::new())
    .unwrap();
  let error = client.send(request, None).await.unwrap_err();
  match error {
    mockgate::Error::Upstream(mockgate::UpstreamError::ConnectTimeout(_)) => {}
    mockgate::Error::Upstream(mockgate::UpstreamError::Io(io)) => {
      assert!(
        matches!(
          io.kind(),
          std::io::ErrorKind::NetworkUnreachable
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::PermissionDenied
        ),
        "unexpected io error: {}",
        io
      );
    }
    other => panic!("expected a typed connect failure, got {}", other),
  }
  std::fs::remove_dir_all(&dir).ok();
}
