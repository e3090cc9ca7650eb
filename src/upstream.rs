//! Upstream client connection manager
//!
//! Opens outbound connections (directly or through a configured forward
//! proxy), negotiates TLS with ALPN, and exchanges exactly one request for
//! one response over the protocol the server picked.

use crate::codec::Http1Codec;
use crate::config::{ForwardProxy, ForwardProxyKind};
use crate::error::{Error, Result, UpstreamError};
use crate::sniff::Rewind;
use crate::tls::TlsContextCache;
use crate::{Request, Response};
use bytes::{Bytes, BytesMut};
use http::{header, Method, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Application protocol settled by ALPN on a secure connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
  /// `http/1.1` selected, or a plaintext connection
  Http11,
  /// `h2` selected
  Http2,
  /// The server selected something this client did not offer
  Binary,
  /// No ALPN extension in the handshake; settled by watching the first
  /// post-handshake bytes for an HTTP/2 server preface
  Undetermined,
}

impl NegotiatedProtocol {
  fn from_alpn(alpn: Option<&[u8]>) -> Self {
    match alpn {
      Some(b"h2") => NegotiatedProtocol::Http2,
      Some(b"http/1.1") => NegotiatedProtocol::Http11,
      Some(_) => NegotiatedProtocol::Binary,
      None => NegotiatedProtocol::Undetermined,
    }
  }
}

/// Where an outbound request goes, independently of its URI
#[derive(Debug, Clone)]
pub struct RemoteAddress {
  pub host: String,
  pub port: u16,
  pub secure: bool,
}

impl RemoteAddress {
  /// Derive the remote from the request URI, falling back to the `Host`
  /// header for origin-form targets
  pub fn from_request(request: &Request) -> Result<Self> {
    let secure = request.uri().scheme_str() == Some("https");
    let (host, explicit_port) = match request.uri().host() {
      Some(host) => (host.to_string(), request.uri().port_u16()),
      None => {
        let raw = request
          .headers()
          .get(header::HOST)
          .and_then(|v| v.to_str().ok())
          .ok_or_else(|| Error::invalid_request("request has neither URI host nor Host header"))?;
        match raw.rsplit_once(':') {
          Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host.to_string(), port.parse::<u16>().ok())
          }
          _ => (raw.to_string(), None),
        }
      }
    };
    let port = explicit_port.unwrap_or(if secure { 443 } else { 80 });
    Ok(Self { host, port, secure })
  }
}

/// Outbound HTTP client used when no expectation matched
pub struct UpstreamClient {
  tls: Arc<TlsContextCache>,
  forward_proxy: Option<ForwardProxy>,
  connect_timeout: Duration,
}

impl UpstreamClient {
  pub fn new(
    tls: Arc<TlsContextCache>,
    forward_proxy: Option<ForwardProxy>,
    connect_timeout: Duration,
  ) -> Self {
    Self {
      tls,
      forward_proxy,
      connect_timeout,
    }
  }

  /// Send `request` and return its response.
  ///
  /// The destination comes from `remote` when given, else from the request
  /// itself. One request, one response; retry policy belongs to the caller.
  pub async fn send(&self, request: Request, remote: Option<RemoteAddress>) -> Result<Response> {
    let remote = match remote {
      Some(remote) => remote,
      None => RemoteAddress::from_request(&request)?,
    };
    tracing::debug!(
      host = %remote.host,
      port = remote.port,
      secure = remote.secure,
      method = %request.method(),
      "forwarding upstream"
    );

    // A plain HTTP proxy carries insecure requests itself, in absolute form.
    if let Some(proxy) = &self.forward_proxy {
      if proxy.kind() == ForwardProxyKind::Http && !remote.secure {
        let stream = self.connect_tcp(proxy.host(), proxy.port()).await?;
        let request = with_absolute_uri(request, &remote)?;
        let request = with_proxy_auth(request, proxy);
        return self
          .exchange_http1(MaybeTlsStream::Plain(stream), request, true)
          .await;
      }
    }

    let stream = self.open_transport(&remote).await?;
    let protocol = match &stream {
      MaybeTlsStream::Plain(_) => NegotiatedProtocol::Http11,
      MaybeTlsStream::Tls(tls) => NegotiatedProtocol::from_alpn(tls.get_ref().1.alpn_protocol()),
    };
    match protocol {
      NegotiatedProtocol::Http2 => self.exchange_http2(stream, request, &remote).await,
      NegotiatedProtocol::Http11 => self.exchange_http1(stream, request, false).await,
      NegotiatedProtocol::Binary => Err(
        UpstreamError::ProxyRefused("server negotiated an unsupported ALPN protocol".to_string())
          .into(),
      ),
      NegotiatedProtocol::Undetermined => {
        let (protocol, stream) = observe_h2_preface(stream).await;
        if protocol == NegotiatedProtocol::Http2 {
          self.exchange_http2(stream, request, &remote).await
        } else {
          self.exchange_http1(stream, request, false).await
        }
      }
    }
  }

  /// TCP to the target (or through the forward proxy), then TLS when the
  /// target is secure
  async fn open_transport(&self, remote: &RemoteAddress) -> Result<MaybeTlsStream> {
    let stream = match &self.forward_proxy {
      None => self.connect_tcp(&remote.host, remote.port).await?,
      Some(proxy) => {
        let stream = self.connect_tcp(proxy.host(), proxy.port()).await?;
        match proxy.kind() {
          ForwardProxyKind::Http => self.http_connect_handshake(stream, proxy, remote).await?,
          ForwardProxyKind::Socks5 => self.socks5_handshake(stream, proxy, remote).await?,
        }
      }
    };
    if !remote.secure {
      return Ok(MaybeTlsStream::Plain(stream));
    }

    let config = self.tls.client_context(true)?;
    let server_name = ServerName::try_from(remote.host.clone())
      .map_err(|_| Error::handshake(format!("invalid TLS server name: {}", remote.host)))?;
    // the handshake shares the connect-timeout budget
    let handshake = TlsConnector::from(config).connect(server_name, stream);
    let tls = tokio::time::timeout(self.connect_timeout, handshake)
      .await
      .map_err(|_| UpstreamError::ConnectTimeout(self.connect_timeout))?
      .map_err(|e| Error::handshake(format!("TLS handshake with {} failed: {}", remote.host, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }

  async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
    let first: SocketAddr = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| UpstreamError::HostResolution(format!("{}: {}", host, e)))?
      .next()
      .ok_or_else(|| UpstreamError::HostResolution(format!("{}: no addresses", host)))?;
    let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(first))
      .await
      .map_err(|_| UpstreamError::ConnectTimeout(self.connect_timeout))?
      .map_err(UpstreamError::Io)?;
    stream.set_nodelay(true).map_err(UpstreamError::Io)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket2::SockRef::from(&stream)
      .set_tcp_keepalive(&keepalive)
      .map_err(UpstreamError::Io)?;
    Ok(stream)
  }

  /// `CONNECT host:port` through a plain HTTP proxy, returning the raw tunnel
  async fn http_connect_handshake(
    &self,
    stream: TcpStream,
    proxy: &ForwardProxy,
    remote: &RemoteAddress,
  ) -> Result<TcpStream> {
    let authority = format!("{}:{}", remote.host, remote.port);
    let mut connect = http::Request::builder()
      .method(Method::CONNECT)
      .uri(authority.parse::<Uri>().map_err(http::Error::from)?)
      .version(Version::HTTP_11)
      .body(Bytes::new())?;
    if let Some(auth) = proxy.basic_auth() {
      connect
        .headers_mut()
        .insert(header::PROXY_AUTHORIZATION, auth);
    }

    let mut codec = Http1Codec::new(stream);
    codec.write_request(&connect, false).await?;
    let response = codec.read_response(true).await?;
    if response.status() != StatusCode::OK {
      return Err(
        UpstreamError::ProxyRefused(format!("CONNECT returned {}", response.status())).into(),
      );
    }
    let (_leftover, stream) = codec.into_parts();
    Ok(stream)
  }

  /// SOCKS5 client handshake: no-auth or username/password, then CONNECT
  async fn socks5_handshake(
    &self,
    mut stream: TcpStream,
    proxy: &ForwardProxy,
    remote: &RemoteAddress,
  ) -> Result<TcpStream> {
    use crate::socks5::consts::*;
    const AUTH_METHOD_PASSWORD: u8 = 0x02;

    let greeting: &[u8] = if proxy.credentials().is_some() {
      &[
        SOCKS5_VERSION,
        0x02,
        SOCKS5_AUTH_METHOD_NONE,
        AUTH_METHOD_PASSWORD,
      ]
    } else {
      &[SOCKS5_VERSION, 0x01, SOCKS5_AUTH_METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    match choice[1] {
      SOCKS5_AUTH_METHOD_NONE => {}
      AUTH_METHOD_PASSWORD => {
        let (user, pass) = proxy
          .credentials()
          .ok_or_else(|| UpstreamError::ProxyRefused("proxy demands credentials".to_string()))?;
        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream.write_all(&auth).await?;
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
          return Err(
            UpstreamError::ProxyRefused("SOCKS5 authentication rejected".to_string()).into(),
          );
        }
      }
      other => {
        return Err(
          UpstreamError::ProxyRefused(format!("SOCKS5 method {:#04x} not supported", other))
            .into(),
        );
      }
    }

    let mut request = vec![
      SOCKS5_VERSION,
      SOCKS5_CMD_TCP_CONNECT,
      0x00,
      SOCKS5_ADDR_TYPE_DOMAIN_NAME,
      remote.host.len() as u8,
    ];
    request.extend_from_slice(remote.host.as_bytes());
    request.extend_from_slice(&remote.port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS5_REPLY_SUCCEEDED {
      return Err(
        UpstreamError::ProxyRefused(format!("SOCKS5 reply code {:#04x}", reply[1])).into(),
      );
    }
    // drain BND.ADDR and BND.PORT
    let addr_len = match reply[3] {
      SOCKS5_ADDR_TYPE_IPV4 => 4,
      SOCKS5_ADDR_TYPE_IPV6 => 16,
      SOCKS5_ADDR_TYPE_DOMAIN_NAME => stream.read_u8().await? as usize,
      other => {
        return Err(
          UpstreamError::ProxyRefused(format!("SOCKS5 bound address type {:#04x}", other)).into(),
        );
      }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(stream)
  }

  async fn exchange_http1<S>(
    &self,
    stream: S,
    request: Request,
    absolute_form: bool,
  ) -> Result<Response>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let head_only = request.method() == Method::HEAD;
    let mut codec = Http1Codec::new(stream);
    codec.write_request(&request, absolute_form).await?;
    codec.read_response(head_only).await
  }

  async fn exchange_http2<S>(
    &self,
    stream: S,
    request: Request,
    remote: &RemoteAddress,
  ) -> Result<Response>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let (mut send_request, connection) = h2::client::handshake(stream).await.map_err(h2_io)?;
    tokio::spawn(async move {
      if let Err(error) = connection.await {
        tracing::debug!(%error, "h2 connection terminated");
      }
    });

    let (parts, body) = request.into_parts();
    let uri = with_authority(parts.uri, remote)?;
    let mut builder = http::Request::builder()
      .method(parts.method)
      .uri(uri)
      .version(Version::HTTP_2);
    for (name, value) in &parts.headers {
      // connection-level headers are illegal in h2
      if name == header::HOST
        || name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
      {
        continue;
      }
      builder = builder.header(name, value);
    }
    let h2_request = builder.body(())?;

    send_request = send_request.ready().await.map_err(h2_io)?;
    let (response, mut send_stream) = send_request
      .send_request(h2_request, body.is_empty())
      .map_err(h2_io)?;
    if !body.is_empty() {
      send_stream.send_data(body, true).map_err(h2_io)?;
    }

    let response = response.await.map_err(h2_io)?;
    let (parts, mut recv) = response.into_parts();
    let mut body = BytesMut::new();
    while let Some(chunk) = recv.data().await {
      let chunk = chunk.map_err(h2_io)?;
      recv
        .flow_control()
        .release_capacity(chunk.len())
        .map_err(h2_io)?;
      body.extend_from_slice(&chunk);
    }
    Ok(Response::from_parts(parts, body.freeze()))
  }
}

/// How long to watch for an HTTP/2 server preface when ALPN settled nothing
const H2_PREFACE_WAIT: Duration = Duration::from_millis(300);

/// Settle the protocol for a handshake that carried no ALPN extension.
///
/// An HTTP/2 server opens with a SETTINGS frame on stream zero before the
/// client sends anything, while an HTTP/1.1 server stays silent until the
/// request arrives. The consumed bytes are replayed through the returned
/// stream.
async fn observe_h2_preface(
  mut stream: MaybeTlsStream,
) -> (NegotiatedProtocol, Rewind<MaybeTlsStream>) {
  let mut buf = BytesMut::with_capacity(9);
  let deadline = tokio::time::Instant::now() + H2_PREFACE_WAIT;
  while buf.len() < 9 {
    match tokio::time::timeout_at(deadline, stream.read_buf(&mut buf)).await {
      Ok(Ok(read)) if read > 0 => {}
      _ => break,
    }
  }
  let protocol = if is_settings_preface(&buf) {
    NegotiatedProtocol::Http2
  } else {
    NegotiatedProtocol::Http11
  };
  tracing::debug!(?protocol, "settled protocol without ALPN");
  (protocol, Rewind::new(buf.freeze(), stream))
}

/// Frame header check: SETTINGS type without the ACK flag, stream id zero,
/// payload a whole number of six-byte entries
fn is_settings_preface(buf: &[u8]) -> bool {
  if buf.len() < 9 {
    return false;
  }
  let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
  buf[3] == 0x04 && buf[4] & 0x01 == 0 && buf[5..9] == [0, 0, 0, 0] && length % 6 == 0
}

fn h2_io(error: h2::Error) -> Error {
  if error.is_io() {
    UpstreamError::Io(std::io::Error::other(error)).into()
  } else {
    UpstreamError::ConnectionClosed.into()
  }
}

fn with_absolute_uri(request: Request, remote: &RemoteAddress) -> Result<Request> {
  if request.uri().host().is_some() {
    return Ok(request);
  }
  let (mut parts, body) = request.into_parts();
  let path = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  parts.uri = format!("http://{}:{}{}", remote.host, remote.port, path)
    .parse::<Uri>()
    .map_err(http::Error::from)?;
  Ok(Request::from_parts(parts, body))
}

fn with_proxy_auth(mut request: Request, proxy: &ForwardProxy) -> Request {
  if let Some(auth) = proxy.basic_auth() {
    request
      .headers_mut()
      .insert(header::PROXY_AUTHORIZATION, auth);
  }
  request
}

fn with_authority(uri: Uri, remote: &RemoteAddress) -> Result<Uri> {
  if uri.host().is_some() {
    return Ok(uri);
  }
  let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  let scheme = if remote.secure { "https" } else { "http" };
  format!("{}://{}:{}{}", scheme, remote.host, remote.port, path)
    .parse::<Uri>()
    .map_err(|e| http::Error::from(e).into())
}

/// Outbound stream that is either raw TCP or TLS over TCP
pub enum MaybeTlsStream {
  Plain(TcpStream),
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
