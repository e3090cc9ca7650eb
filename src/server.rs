//! Proxy server: accept loop and per-connection dispatch
//!
//! Each accepted connection walks a fixed pipeline: sniff, classify, handle.
//! Tunnels answered in interception mode feed their inner bytes back into the
//! same pipeline, so HTTPS inside CONNECT inside SOCKS5 all end up at the
//! same decoded-HTTP handler.

use crate::ca::CertificateAuthority;
use crate::codec::{self, Http1Codec};
use crate::config::ProxyConfig;
use crate::error::{Error, Result, UpstreamError};
use crate::matcher::{FnMatcher, Matcher};
use crate::sniff::{self, Classification, Rewind};
use crate::socks5;
use crate::tls::TlsContextCache;
use crate::tunnel::{self, TunnelProtocol};
use crate::upstream::{RemoteAddress, UpstreamClient};
use crate::{Request, Response};
use bytes::Bytes;
use http::{header, Method, StatusCode, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

/// Any stream the dispatch pipeline can work on, fresh TCP or an unwrapped
/// tunnel interior
trait SegmentIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SegmentIo for T {}

type BoxedStream = Box<dyn SegmentIo>;

/// What is already known about a stream segment before it is classified
#[derive(Debug, Clone, Default)]
struct SegmentContext {
  /// Target of the tunnel this segment arrived through, if any
  tunnel: Option<(String, u16)>,
  /// Whether this segment was unwrapped from intercepted TLS
  secure: bool,
}

/// Builder for [`ProxyServer`]
pub struct ProxyServerBuilder {
  config: ProxyConfig,
  matcher: Option<Arc<dyn Matcher>>,
}

impl ProxyServerBuilder {
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = config;
    self
  }

  pub fn matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
    self.matcher = Some(matcher);
    self
  }

  /// Bootstrap the CA and bind the listener
  pub async fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<ProxyServer> {
    let ca = CertificateAuthority::ensure(&self.config.ca_storage_path).await?;
    let tls = Arc::new(TlsContextCache::new(
      Arc::new(ca),
      self.config.certificate_policy,
    ));
    let upstream = UpstreamClient::new(
      tls.clone(),
      self.config.forward_proxy.clone(),
      self.config.connect_timeout,
    );
    let matcher = self
      .matcher
      .unwrap_or_else(|| FnMatcher::new(|_| None) as Arc<dyn Matcher>);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "proxy listening");
    Ok(ProxyServer {
      listener,
      inner: Arc::new(ServerInner {
        config: self.config,
        tls,
        matcher,
        upstream,
      }),
    })
  }
}

struct ServerInner {
  config: ProxyConfig,
  tls: Arc<TlsContextCache>,
  matcher: Arc<dyn Matcher>,
  upstream: UpstreamClient,
}

/// Port-unified proxy server
pub struct ProxyServer {
  listener: TcpListener,
  inner: Arc<ServerInner>,
}

impl ProxyServer {
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder {
      config: ProxyConfig::default(),
      matcher: None,
    }
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// The CA certificate clients must trust, in PEM form
  pub fn ca_certificate_pem(&self) -> String {
    self.inner.tls.issuer().ca_certificate_pem().to_string()
  }

  /// The TLS context cache, for scheduling certificate rebuilds
  pub fn tls(&self) -> &Arc<TlsContextCache> {
    &self.inner.tls
  }

  /// Accept connections until the task is dropped
  pub async fn run(self) -> Result<()> {
    loop {
      let (stream, peer) = self.listener.accept().await?;
      let inner = self.inner.clone();
      tokio::spawn(async move {
        if let Err(error) = handle_connection(inner, stream, peer).await {
          tracing::debug!(%peer, %error, "connection ended with error");
        }
      });
    }
  }
}

async fn handle_connection(
  inner: Arc<ServerInner>,
  stream: TcpStream,
  peer: SocketAddr,
) -> Result<()> {
  stream.set_nodelay(true)?;
  dispatch(inner, Box::new(stream), peer, SegmentContext::default()).await
}

/// Classify one stream segment and hand it to the matching handler.
///
/// Boxed recursion: intercepted tunnel interiors re-enter here as new
/// segments.
fn dispatch(
  inner: Arc<ServerInner>,
  stream: BoxedStream,
  peer: SocketAddr,
  context: SegmentContext,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
  Box::pin(async move {
    let (classification, stream) = sniff::sniff(stream, inner.config.sniff_timeout).await?;
    tracing::trace!(%peer, ?classification, tunneled = context.tunnel.is_some(), "classified segment");
    match classification {
      Classification::Tls => intercept_tls(inner, stream, peer, context).await,
      Classification::Socks5 => handle_socks5(inner, stream, peer, context).await,
      Classification::Http => serve_http(inner, stream, peer, context).await,
      Classification::Unknown => {
        tracing::warn!(%peer, prefix = ?stream.prefix(), "unrecognized protocol, closing");
        Ok(())
      }
    }
  })
}

/// Terminate TLS with a forged certificate and feed the plaintext interior
/// back through the pipeline
async fn intercept_tls(
  inner: Arc<ServerInner>,
  stream: Rewind<BoxedStream>,
  peer: SocketAddr,
  context: SegmentContext,
) -> Result<()> {
  let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
  let start = acceptor
    .await
    .map_err(|e| Error::handshake(format!("invalid ClientHello from {}: {}", peer, e)))?;
  let sni = start.client_hello().server_name().map(str::to_string);
  let hostname = sni
    .or_else(|| context.tunnel.as_ref().map(|(host, _)| host.clone()))
    .unwrap_or_else(|| inner.config.default_sni_host.clone());
  tracing::debug!(%peer, %hostname, "intercepting TLS");

  let server_context = inner.tls.server_context(&hostname).await?;
  let tls_stream = start
    .into_stream(server_context.config.clone())
    .await
    .map_err(|e| Error::handshake(format!("TLS accept for {} failed: {}", hostname, e)))?;

  let tunnel = context
    .tunnel
    .or_else(|| Some((hostname, 443)))
    .filter(|(host, _)| !host.is_empty());
  let context = SegmentContext {
    tunnel,
    secure: true,
  };
  dispatch(inner, Box::new(tls_stream), peer, context).await
}

/// Answer a SOCKS5 CONNECT, then either intercept the interior or relay it
async fn handle_socks5(
  inner: Arc<ServerInner>,
  mut stream: Rewind<BoxedStream>,
  peer: SocketAddr,
  context: SegmentContext,
) -> Result<()> {
  socks5::accept_greeting(&mut stream).await?;
  let target = socks5::read_connect_request(&mut stream).await?;
  tracing::debug!(%peer, %target, "SOCKS5 CONNECT");

  if inner.config.https_interception {
    socks5::write_reply(&mut stream, socks5::consts::SOCKS5_REPLY_SUCCEEDED, None).await?;
    let context = SegmentContext {
      tunnel: Some((target.host(), target.port())),
      secure: context.secure,
    };
    return dispatch(inner, Box::new(stream), peer, context).await;
  }

  let mut upstream = tunnel::establish(
    &mut stream,
    &target.host(),
    target.port(),
    TunnelProtocol::Socks5,
    inner.config.connect_timeout,
  )
  .await?;
  tunnel::relay(&mut stream, &mut upstream).await?;
  Ok(())
}

/// Serve decoded HTTP/1.1 requests until the connection closes.
///
/// CONNECT requests leave this loop and move to the tunnel path.
async fn serve_http(
  inner: Arc<ServerInner>,
  stream: Rewind<BoxedStream>,
  peer: SocketAddr,
  context: SegmentContext,
) -> Result<()> {
  let (prefix, stream) = stream.into_parts();
  let mut codec = Http1Codec::with_prefix(prefix, stream);

  loop {
    let request = match codec.read_request().await {
      Ok(Some(request)) => request,
      Ok(None) => return Ok(()),
      Err(error) => {
        let response = plain_response(StatusCode::BAD_REQUEST, "");
        codec.write_response(&response).await.ok();
        return Err(error);
      }
    };

    if request.method() == Method::CONNECT {
      return handle_connect(inner, codec, request, peer, context).await;
    }

    let keep_alive = codec::wants_keep_alive(request.version(), request.headers());
    let response = respond(&inner, request, &context).await;
    codec.write_response(&response).await?;
    let close_sent = response
      .headers()
      .get(header::CONNECTION)
      .map(|v| v.as_bytes() == b"close")
      .unwrap_or(false);
    if !keep_alive || close_sent {
      return Ok(());
    }
  }
}

/// Answer a decoded request from the matcher, or forward it upstream
async fn respond(inner: &ServerInner, request: Request, context: &SegmentContext) -> Response {
  if let Some(response) = inner.matcher.matches(&request).await {
    return response;
  }

  let remote = if request.uri().host().is_some() {
    RemoteAddress::from_request(&request).ok()
  } else if let Some((host, port)) = &context.tunnel {
    Some(RemoteAddress {
      host: host.clone(),
      port: *port,
      secure: context.secure,
    })
  } else {
    RemoteAddress::from_request(&request)
      .map(|mut remote| {
        remote.secure = context.secure;
        remote
      })
      .ok()
  };
  let Some(remote) = remote else {
    return plain_response(StatusCode::BAD_REQUEST, "cannot determine request target");
  };

  match inner.upstream.send(request, Some(remote)).await {
    Ok(response) => response,
    Err(Error::Upstream(UpstreamError::ConnectTimeout(_))) => {
      plain_response(StatusCode::GATEWAY_TIMEOUT, "upstream connect timed out")
    }
    Err(error) => {
      tracing::warn!(%error, "upstream request failed");
      plain_response(StatusCode::BAD_GATEWAY, "upstream request failed")
    }
  }
}

/// Honor a CONNECT request: intercept the interior or open a transparent
/// tunnel
async fn handle_connect<S>(
  inner: Arc<ServerInner>,
  codec: Http1Codec<S>,
  request: Request,
  peer: SocketAddr,
  context: SegmentContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let authority = request
    .uri()
    .authority()
    .ok_or_else(|| Error::invalid_request("CONNECT without authority"))?;
  let host = authority.host().to_string();
  let port = authority.port_u16().unwrap_or(443);
  tracing::debug!(%peer, %host, port, "HTTP CONNECT");

  let (leftover, mut stream) = codec.into_parts();

  if inner.config.https_interception {
    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;
    let context = SegmentContext {
      tunnel: Some((host, port)),
      secure: context.secure,
    };
    let stream: BoxedStream = Box::new(Rewind::new(leftover, stream));
    return dispatch(inner, stream, peer, context).await;
  }

  let mut client = Rewind::new(leftover, stream);
  let mut upstream = tunnel::establish(
    &mut client,
    &host,
    port,
    TunnelProtocol::HttpConnect,
    inner.config.connect_timeout,
  )
  .await?;
  tunnel::relay(&mut client, &mut upstream).await?;
  Ok(())
}

fn plain_response(status: StatusCode, body: &str) -> Response {
  http::Response::builder()
    .status(status)
    .version(Version::HTTP_11)
    .header(header::CONTENT_TYPE, "text/plain")
    .body(Bytes::copy_from_slice(body.as_bytes()))
    .expect("static response is always valid")
}
