//! Byte-level protocol sniffing for port unification
//!
//! Every inbound stream (and every stream inside an answered tunnel) starts as
//! bytes of unknown type. The sniffer buffers a small prefix, classifies it as
//! TLS, SOCKS5 or plaintext HTTP, and hands back a [`Rewind`] stream that
//! replays the buffered prefix so the chosen handler sees the stream from byte
//! zero.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Longest prefix needed for a decision (`OPTIONS ` and `CONNECT ` are eight
/// bytes)
const MAX_SNIFF_LEN: usize = 8;

/// Request-line prefixes that mark a stream as plaintext HTTP, each including
/// the trailing space
const HTTP_METHOD_TOKENS: [&str; 9] = [
  "GET ", "POST ", "PUT ", "HEAD ", "OPTIONS ", "PATCH ", "DELETE ", "TRACE ", "CONNECT ",
];

/// Protocol decided for a stream segment.
///
/// The decision is made exactly once per segment; an intercepted tunnel's
/// inner bytes form a new segment and are classified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// TLS record layer (handshake record, TLS 1.x)
  Tls,
  /// SOCKS5 greeting
  Socks5,
  /// Plaintext HTTP/1.x request line
  Http,
  /// None of the above; the connection is closed without a response
  Unknown,
}

/// Classify a stream prefix, or report that more bytes are needed.
///
/// Rules are checked in order: TLS first, then SOCKS5, then the HTTP method
/// tokens. Returns `None` only while the prefix is still a strict prefix of
/// some recognizable pattern and shorter than [`MAX_SNIFF_LEN`].
pub fn classify(prefix: &[u8]) -> Option<Classification> {
  if prefix.len() < 2 {
    return None;
  }
  // TLS handshake record: content type 0x16, major version 3.
  if prefix[0] == 0x16 && prefix[1] == 0x03 {
    return Some(Classification::Tls);
  }
  // SOCKS5 greeting: version 5, at least one auth method offered.
  if prefix[0] == 0x05 && prefix[1] >= 0x01 {
    return Some(Classification::Socks5);
  }
  let mut partial = false;
  for token in HTTP_METHOD_TOKENS {
    let token = token.as_bytes();
    if prefix.len() >= token.len() {
      if &prefix[..token.len()] == token {
        return Some(Classification::Http);
      }
    } else if token.starts_with(prefix) {
      partial = true;
    }
  }
  if partial && prefix.len() < MAX_SNIFF_LEN {
    None
  } else {
    Some(Classification::Unknown)
  }
}

/// Read just enough of `stream` to classify it.
///
/// Returns the classification and a [`Rewind`] stream that replays the
/// consumed prefix. A peer that sends nothing within `timeout`, or closes
/// before a decision, is a sniff error.
pub async fn sniff<S>(mut stream: S, timeout: Duration) -> Result<(Classification, Rewind<S>)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buf = BytesMut::with_capacity(MAX_SNIFF_LEN);
  loop {
    if let Some(classification) = classify(&buf) {
      return Ok((classification, Rewind::new(buf.freeze(), stream)));
    }
    let read = tokio::time::timeout(timeout, stream.read_buf(&mut buf))
      .await
      .map_err(|_| Error::sniff(format!("no classifiable bytes within {:?}", timeout)))??;
    if read == 0 {
      return Err(Error::sniff(format!(
        "connection closed after {} bytes, before classification",
        buf.len()
      )));
    }
  }
}

/// Stream wrapper that replays a consumed prefix before delegating reads.
///
/// Writes pass straight through. Works on any stream, so sniffing composes
/// with TLS-wrapped and tunneled segments, not just fresh TCP sockets.
#[derive(Debug)]
pub struct Rewind<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> Rewind<S> {
  pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
    Self { prefix, inner }
  }

  /// The not-yet-replayed prefix bytes
  pub fn prefix(&self) -> &[u8] {
    &self.prefix
  }

  /// Unwrap into the prefix and the inner stream
  pub fn into_parts(self) -> (Bytes, S) {
    (self.prefix, self.inner)
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let take = self.prefix.len().min(buf.remaining());
      let chunk = self.prefix.split_to(take);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[test]
  fn classifies_tls_client_hello() {
    assert_eq!(classify(&[0x16, 0x03, 0x01]), Some(Classification::Tls));
    assert_eq!(classify(&[0x16, 0x03]), Some(Classification::Tls));
  }

  #[test]
  fn classifies_socks5_greeting() {
    assert_eq!(classify(&[0x05, 0x01, 0x00]), Some(Classification::Socks5));
    assert_eq!(classify(&[0x05, 0x02]), Some(Classification::Socks5));
    // zero auth methods is not a valid greeting
    assert_eq!(classify(&[0x05, 0x00]), Some(Classification::Unknown));
  }

  #[test]
  fn classifies_every_http_method() {
    for token in HTTP_METHOD_TOKENS {
      let line = format!("{}/ HTTP/1.1\r\n", token);
      assert_eq!(
        classify(line.as_bytes()),
        Some(Classification::Http),
        "{}",
        token
      );
    }
  }

  #[test]
  fn waits_for_ambiguous_prefixes() {
    // "CO" could still become "CONNECT "
    assert_eq!(classify(b"CO"), None);
    assert_eq!(classify(b"CONNECT"), None);
    assert_eq!(classify(b"CONNECT "), Some(Classification::Http));
    // "CX" can no longer match anything
    assert_eq!(classify(b"CX"), Some(Classification::Unknown));
  }

  #[test]
  fn rejects_unrecognized_bytes() {
    assert_eq!(classify(b"\x00\x00\x00\x00"), Some(Classification::Unknown));
    assert_eq!(classify(b"SSH-2.0-"), Some(Classification::Unknown));
  }

  #[tokio::test]
  async fn rewind_replays_prefix_exactly_once() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
  }

  #[tokio::test]
  async fn sniff_returns_full_stream() {
    let (client, server) = tokio::io::duplex(64);
    let writer = tokio::spawn(async move {
      use tokio::io::AsyncWriteExt;
      let mut client = client;
      client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
      client.shutdown().await.unwrap();
    });
    let (classification, mut stream) = sniff(server, Duration::from_secs(1)).await.unwrap();
    assert_eq!(classification, Classification::Http);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"GET / HTTP/1.1\r\n\r\n");
    writer.await.unwrap();
  }

  #[tokio::test]
  async fn sniff_fails_on_early_close() {
    let (client, server) = tokio::io::duplex(64);
    drop(client);
    assert!(sniff(server, Duration::from_secs(1)).await.is_err());
  }
}
