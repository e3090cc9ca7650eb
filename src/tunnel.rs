//! Tunnel establishment and transparent byte relay
//!
//! A tunnel request (HTTP CONNECT or SOCKS5 CONNECT) only gets its success
//! response after the outbound connection is open; a failed connect produces
//! the protocol's failure response and nothing else. Once relaying starts the
//! bytes are opaque.

use crate::error::{Error, Result};
use crate::socks5;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Protocol the tunnel was requested over, which fixes the shape of the
/// success and failure responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
  /// `CONNECT host:port HTTP/1.1`
  HttpConnect,
  /// SOCKS5 CONNECT command
  Socks5,
}

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";

/// Open the outbound leg of a tunnel and answer the client.
///
/// The success response is written only after the connect succeeds; on
/// failure the protocol failure response is written and the error returned so
/// the caller closes the connection.
pub async fn establish<S>(
  client: &mut S,
  host: &str,
  port: u16,
  protocol: TunnelProtocol,
  connect_timeout: Duration,
) -> Result<TcpStream>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let upstream = match connect(host, port, connect_timeout).await {
    Ok(upstream) => upstream,
    Err(error) => {
      tracing::warn!(host, port, %error, "tunnel connect failed");
      match protocol {
        TunnelProtocol::HttpConnect => {
          client.write_all(CONNECT_FAILED).await?;
          client.flush().await?;
        }
        TunnelProtocol::Socks5 => {
          socks5::write_reply(client, socks5::reply_code_for_error(&error), None).await?;
        }
      }
      return Err(Error::tunnel(format!(
        "failed to connect to {}:{}: {}",
        host, port, error
      )));
    }
  };

  match protocol {
    TunnelProtocol::HttpConnect => {
      client.write_all(CONNECT_ESTABLISHED).await?;
      client.flush().await?;
    }
    TunnelProtocol::Socks5 => {
      let bound = upstream.local_addr().ok();
      socks5::write_reply(client, socks5::consts::SOCKS5_REPLY_SUCCEEDED, bound).await?;
    }
  }
  Ok(upstream)
}

async fn connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
  match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
    Ok(result) => result,
    Err(_) => Err(std::io::Error::new(
      std::io::ErrorKind::TimedOut,
      format!("connect to {}:{} timed out", host, port),
    )),
  }
}

/// Relay bytes between the two halves until both close.
///
/// `copy_bidirectional` propagates backpressure and half-close in each
/// direction. Returns bytes moved client-to-upstream and upstream-to-client.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U) -> Result<(u64, u64)>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (sent, received) = tokio::io::copy_bidirectional(client, upstream).await?;
  tracing::debug!(sent, received, "tunnel closed");
  Ok((sent, received))
}
