//! HTTP/1.1 wire codec
//!
//! Hand-rolled head parsing and body framing over a buffered stream. One
//! codec instance owns the stream for its lifetime, so leftover bytes read
//! past a message boundary carry over to the next message on a keep-alive
//! connection.

use crate::error::{Error, Result};
use crate::{Request, Response};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Buffered HTTP/1.1 reader/writer over an arbitrary stream
pub struct Http1Codec<S> {
  stream: S,
  buf: BytesMut,
}

impl<S> Http1Codec<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  pub fn new(stream: S) -> Self {
    Self::with_prefix(Bytes::new(), stream)
  }

  /// Build a codec over a stream whose first bytes were already consumed by
  /// the sniffer
  pub fn with_prefix(prefix: Bytes, stream: S) -> Self {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    buf.extend_from_slice(&prefix);
    Self { stream, buf }
  }

  /// Give back the unconsumed buffer and the stream, for handing a CONNECT
  /// body off to the tunnel path
  pub fn into_parts(self) -> (Bytes, S) {
    (self.buf.freeze(), self.stream)
  }

  /// Read one request, or `None` if the peer closed cleanly between requests
  pub async fn read_request(&mut self) -> Result<Option<Request>> {
    let head = match self.read_head(true).await? {
      Some(head) => head,
      None => return Ok(None),
    };
    let (request_line, headers) = parse_head(&head)?;
    let mut parts = request_line.split(' ');
    let method = parts
      .next()
      .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
      .ok_or_else(|| Error::invalid_request("malformed request method"))?;
    let target = parts
      .next()
      .ok_or_else(|| Error::invalid_request("missing request target"))?;
    let version = parse_version(parts.next())?;

    let mut builder = http::Request::builder()
      .method(method.clone())
      .uri(
        target
          .parse::<Uri>()
          .map_err(|e| Error::invalid_request(format!("malformed request target: {}", e)))?,
      )
      .version(version);
    for (name, value) in &headers {
      builder = builder.header(name, value);
    }

    let body = if method == Method::CONNECT {
      Bytes::new()
    } else {
      self.read_body(&headers, false).await?
    };
    Ok(Some(builder.body(body)?))
  }

  /// Read one response. `head_only` suppresses the body (HEAD requests).
  pub async fn read_response(&mut self, head_only: bool) -> Result<Response> {
    let head = self
      .read_head(false)
      .await?
      .ok_or(crate::error::UpstreamError::ConnectionClosed)?;
    let (status_line, headers) = parse_head(&head)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parse_version(parts.next())?;
    let status = parts
      .next()
      .and_then(|code| code.parse::<StatusCode>().ok())
      .ok_or_else(|| Error::invalid_request("malformed status code"))?;

    let mut builder = http::Response::builder().status(status).version(version);
    for (name, value) in &headers {
      builder = builder.header(name, value);
    }

    let body = if head_only || !status_allows_body(status) {
      Bytes::new()
    } else {
      self.read_body(&headers, true).await?
    };
    Ok(builder.body(body)?)
  }

  pub async fn write_request(&mut self, request: &Request, absolute_form: bool) -> Result<()> {
    let bytes = serialize_request(request, absolute_form)?;
    self.stream.write_all(&bytes).await?;
    self.stream.flush().await?;
    Ok(())
  }

  pub async fn write_response(&mut self, response: &Response) -> Result<()> {
    let bytes = serialize_response(response);
    self.stream.write_all(&bytes).await?;
    self.stream.flush().await?;
    Ok(())
  }

  /// Buffer up to the `\r\n\r\n` head terminator and split it off.
  ///
  /// `at_boundary` means EOF before any byte is a clean close rather than an
  /// error.
  async fn read_head(&mut self, at_boundary: bool) -> Result<Option<Vec<u8>>> {
    loop {
      if let Some(end) = find_head_end(&self.buf) {
        let head = self.buf.split_to(end + 4);
        return Ok(Some(head[..end].to_vec()));
      }
      if self.buf.len() > MAX_HEAD_SIZE {
        return Err(Error::invalid_request("HTTP head exceeds 64 KiB"));
      }
      let read = self.stream.read_buf(&mut self.buf).await?;
      if read == 0 {
        if at_boundary && self.buf.is_empty() {
          return Ok(None);
        }
        return Err(Error::invalid_request(
          "connection closed inside an HTTP head",
        ));
      }
    }
  }

  async fn read_body(
    &mut self,
    headers: &[(HeaderName, HeaderValue)],
    close_delimited_allowed: bool,
  ) -> Result<Bytes> {
    if is_chunked(headers) {
      return self.read_chunked_body().await;
    }
    if let Some(length) = content_length(headers)? {
      return self.read_exact_body(length).await;
    }
    if close_delimited_allowed {
      // body runs to EOF
      loop {
        let read = self.stream.read_buf(&mut self.buf).await?;
        if read == 0 {
          return Ok(self.buf.split().freeze());
        }
      }
    }
    Ok(Bytes::new())
  }

  async fn read_exact_body(&mut self, length: usize) -> Result<Bytes> {
    while self.buf.len() < length {
      let read = self.stream.read_buf(&mut self.buf).await?;
      if read == 0 {
        return Err(Error::invalid_request(
          "connection closed inside an HTTP body",
        ));
      }
    }
    Ok(self.buf.split_to(length).freeze())
  }

  async fn read_chunked_body(&mut self) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
      let line = self.read_line().await?;
      let size_text = line.split(';').next().unwrap_or("").trim();
      let size = usize::from_str_radix(size_text, 16)
        .map_err(|_| Error::invalid_request(format!("malformed chunk size: {:?}", size_text)))?;
      if size == 0 {
        break;
      }
      let chunk = self.read_exact_body(size).await?;
      body.extend_from_slice(&chunk);
      let crlf = self.read_line().await?;
      if !crlf.is_empty() {
        return Err(Error::invalid_request("missing CRLF after chunk"));
      }
    }
    // drain trailers up to the empty line
    loop {
      if self.read_line().await?.is_empty() {
        break;
      }
    }
    Ok(body.freeze())
  }

  async fn read_line(&mut self) -> Result<String> {
    loop {
      if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
        let line = self.buf.split_to(pos + 2);
        return Ok(String::from_utf8_lossy(&line[..pos]).to_string());
      }
      let read = self.stream.read_buf(&mut self.buf).await?;
      if read == 0 {
        return Err(Error::invalid_request(
          "connection closed inside a chunked body",
        ));
      }
    }
  }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<(String, Vec<(HeaderName, HeaderValue)>)> {
  let text = String::from_utf8_lossy(head);
  let mut lines = text.split("\r\n");
  let start_line = lines
    .next()
    .filter(|l| !l.is_empty())
    .ok_or_else(|| Error::invalid_request("empty HTTP head"))?
    .to_string();
  let mut headers = Vec::new();
  for line in lines {
    if line.is_empty() {
      continue;
    }
    let (name, value) = line
      .split_once(':')
      .ok_or_else(|| Error::invalid_request(format!("malformed header line: {:?}", line)))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
      .map_err(|_| Error::invalid_request(format!("invalid header name: {:?}", name)))?;
    let value = HeaderValue::from_str(value.trim())
      .map_err(|_| Error::invalid_request(format!("invalid header value for {}", name)))?;
    headers.push((name, value));
  }
  Ok((start_line, headers))
}

fn parse_version(token: Option<&str>) -> Result<Version> {
  match token {
    Some("HTTP/1.1") => Ok(Version::HTTP_11),
    Some("HTTP/1.0") => Ok(Version::HTTP_10),
    other => Err(Error::invalid_request(format!(
      "unsupported HTTP version: {:?}",
      other
    ))),
  }
}

fn version_text(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

fn is_chunked(headers: &[(HeaderName, HeaderValue)]) -> bool {
  headers.iter().any(|(name, value)| {
    name == TRANSFER_ENCODING
      && value
        .to_str()
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
  })
}

fn content_length(headers: &[(HeaderName, HeaderValue)]) -> Result<Option<usize>> {
  for (name, value) in headers {
    if name == CONTENT_LENGTH {
      let length = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .ok_or_else(|| Error::invalid_request("malformed Content-Length"))?;
      return Ok(Some(length));
    }
  }
  Ok(None)
}

fn status_allows_body(status: StatusCode) -> bool {
  !(status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED)
}

/// Whether the peer expects the connection to stay open after this message
pub fn wants_keep_alive(version: Version, headers: &http::HeaderMap) -> bool {
  let connection = headers
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase());
  match version {
    Version::HTTP_10 => connection.as_deref() == Some("keep-alive"),
    _ => connection.as_deref() != Some("close"),
  }
}

/// Serialize a request head and body.
///
/// `absolute_form` emits the full URI as the request target, as required when
/// talking through a plain HTTP forward proxy.
pub fn serialize_request(request: &Request, absolute_form: bool) -> Result<Vec<u8>> {
  let uri = request.uri();
  let target = if request.method() == Method::CONNECT {
    uri
      .authority()
      .map(|a| a.to_string())
      .ok_or_else(|| Error::invalid_request("CONNECT request without authority"))?
  } else if absolute_form {
    uri.to_string()
  } else {
    uri
      .path_and_query()
      .map(|pq| pq.to_string())
      .unwrap_or_else(|| "/".to_string())
  };

  let mut out = Vec::with_capacity(256 + request.body().len());
  out.extend_from_slice(
    format!(
      "{} {} {}\r\n",
      request.method(),
      target,
      version_text(request.version())
    )
    .as_bytes(),
  );
  if !request.headers().contains_key(HOST) {
    if let Some(authority) = uri.authority() {
      out.extend_from_slice(format!("host: {}\r\n", authority.as_str()).as_bytes());
    }
  }
  for (name, value) in request.headers() {
    out.extend_from_slice(name.as_str().as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
  }
  if !request.body().is_empty() && !request.headers().contains_key(CONTENT_LENGTH) {
    out.extend_from_slice(format!("content-length: {}\r\n", request.body().len()).as_bytes());
  }
  out.extend_from_slice(b"\r\n");
  out.extend_from_slice(request.body());
  Ok(out)
}

/// Serialize a response head and body with an explicit `Content-Length`
pub fn serialize_response(response: &Response) -> Vec<u8> {
  let mut out = Vec::with_capacity(256 + response.body().len());
  out.extend_from_slice(
    format!(
      "{} {} {}\r\n",
      version_text(response.version()),
      response.status().as_u16(),
      response.status().canonical_reason().unwrap_or("")
    )
    .as_bytes(),
  );
  for (name, value) in response.headers() {
    // the body is fully buffered, so its framing headers are rewritten
    if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
      continue;
    }
    out.extend_from_slice(name.as_str().as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
  }
  if status_allows_body(response.status()) {
    out.extend_from_slice(format!("content-length: {}\r\n", response.body().len()).as_bytes());
  }
  out.extend_from_slice(b"\r\n");
  out.extend_from_slice(response.body());
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn codec_over(bytes: &[u8]) -> Http1Codec<Cursor<Vec<u8>>> {
    Http1Codec::new(Cursor::new(bytes.to_vec()))
  }

  #[tokio::test]
  async fn parses_request_with_content_length() {
    let raw = b"POST /submit HTTP/1.1\r\nhost: example.com\r\ncontent-length: 5\r\n\r\nhello";
    let request = codec_over(raw).read_request().await.unwrap().unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().path(), "/submit");
    assert_eq!(request.headers()[HOST], "example.com");
    assert_eq!(request.body().as_ref(), b"hello");
  }

  #[tokio::test]
  async fn clean_eof_between_requests_is_none() {
    assert!(codec_over(b"").read_request().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn chunked_response_decodes_to_payload() {
    let raw =
      b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let response = codec_over(raw).read_response(false).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"hello world");
  }

  #[tokio::test]
  async fn close_delimited_response_reads_to_eof() {
    let raw = b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\nstream until the end";
    let response = codec_over(raw).read_response(false).await.unwrap();
    assert_eq!(response.body().as_ref(), b"stream until the end");
  }

  #[tokio::test]
  async fn head_response_carries_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 1024\r\n\r\n";
    let response = codec_over(raw).read_response(true).await.unwrap();
    assert!(response.body().is_empty());
  }

  #[tokio::test]
  async fn pipelined_requests_share_the_buffer() {
    let raw = b"GET /a HTTP/1.1\r\nhost: x\r\n\r\nGET /b HTTP/1.1\r\nhost: x\r\n\r\n";
    let mut codec = codec_over(raw);
    let first = codec.read_request().await.unwrap().unwrap();
    let second = codec.read_request().await.unwrap().unwrap();
    assert_eq!(first.uri().path(), "/a");
    assert_eq!(second.uri().path(), "/b");
    assert!(codec.read_request().await.unwrap().is_none());
  }

  #[test]
  fn serializes_absolute_form_for_proxies() {
    let request = http::Request::builder()
      .method(Method::GET)
      .uri("http://example.com/path?q=1")
      .body(Bytes::new())
      .unwrap();
    let bytes = serialize_request(&request, true).unwrap();
    assert!(bytes.starts_with(b"GET http://example.com/path?q=1 HTTP/1.1\r\n"));
    let origin = serialize_request(&request, false).unwrap();
    assert!(origin.starts_with(b"GET /path?q=1 HTTP/1.1\r\n"));
  }

  #[test]
  fn keep_alive_defaults_follow_the_version() {
    let mut headers = http::HeaderMap::new();
    assert!(wants_keep_alive(Version::HTTP_11, &headers));
    assert!(!wants_keep_alive(Version::HTTP_10, &headers));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    assert!(!wants_keep_alive(Version::HTTP_11, &headers));
  }
}
