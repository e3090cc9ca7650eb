//! Server-side SOCKS5 framing (RFC 1928)
//!
//! Only the no-authentication method and the CONNECT command are supported;
//! everything else is refused with the matching reply code.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
pub(crate) mod consts {
  pub const SOCKS5_VERSION:                          u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE:                 u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE:       u8 = 0xff;

  pub const SOCKS5_CMD_TCP_CONNECT:                  u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4:                   u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:            u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6:                   u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED:                  u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE:            u8 = 0x01;
  pub const SOCKS5_REPLY_NETWORK_UNREACHABLE:        u8 = 0x03;
  pub const SOCKS5_REPLY_HOST_UNREACHABLE:           u8 = 0x04;
  pub const SOCKS5_REPLY_CONNECTION_REFUSED:         u8 = 0x05;
  pub const SOCKS5_REPLY_TTL_EXPIRED:                u8 = 0x06;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED:      u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Target of a SOCKS5 CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// Literal socket address (ATYP 0x01 / 0x04)
  Ip(SocketAddr),
  /// Domain name and port (ATYP 0x03), resolved later by the connector
  Domain(String, u16),
}

impl TargetAddr {
  /// Hostname or IP as text, without the port
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Target port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }
}

impl std::fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
    }
  }
}

/// Read the client greeting and accept the no-authentication method.
///
/// A greeting that does not offer method `0x00` is answered with `0xff` and
/// refused.
pub async fn accept_greeting<S>(stream: &mut S) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut header = [0u8; 2];
  stream.read_exact(&mut header).await?;
  if header[0] != consts::SOCKS5_VERSION {
    return Err(Error::invalid_request(format!(
      "unsupported SOCKS version: {:#04x}",
      header[0]
    )));
  }
  let mut methods = vec![0u8; header[1] as usize];
  stream.read_exact(&mut methods).await?;
  if !methods.contains(&consts::SOCKS5_AUTH_METHOD_NONE) {
    stream
      .write_all(&[
        consts::SOCKS5_VERSION,
        consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
      ])
      .await?;
    stream.flush().await?;
    return Err(Error::invalid_request(
      "client offered no acceptable SOCKS5 auth method",
    ));
  }
  stream
    .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NONE])
    .await?;
  stream.flush().await?;
  Ok(())
}

/// Read a CONNECT request and return its target.
///
/// Non-CONNECT commands are refused with reply `0x07`, unknown address types
/// with `0x08`; both close the exchange with an error.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut header = [0u8; 4];
  stream.read_exact(&mut header).await?;
  if header[0] != consts::SOCKS5_VERSION {
    return Err(Error::invalid_request(format!(
      "unsupported SOCKS version in request: {:#04x}",
      header[0]
    )));
  }
  if header[1] != consts::SOCKS5_CMD_TCP_CONNECT {
    write_reply(stream, consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, None).await?;
    return Err(Error::invalid_request(format!(
      "unsupported SOCKS5 command: {:#04x}",
      header[1]
    )));
  }
  let target = match header[3] {
    consts::SOCKS5_ADDR_TYPE_IPV4 => {
      let mut buf = [0u8; 6];
      stream.read_exact(&mut buf).await?;
      let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
      let port = u16::from_be_bytes([buf[4], buf[5]]);
      TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }
    consts::SOCKS5_ADDR_TYPE_IPV6 => {
      let mut buf = [0u8; 18];
      stream.read_exact(&mut buf).await?;
      let mut octets = [0u8; 16];
      octets.copy_from_slice(&buf[..16]);
      let port = u16::from_be_bytes([buf[16], buf[17]]);
      TargetAddr::Ip(SocketAddr::new(IpAddr::V6(octets.into()), port))
    }
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let len = stream.read_u8().await? as usize;
      let mut buf = vec![0u8; len + 2];
      stream.read_exact(&mut buf).await?;
      let domain = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| Error::invalid_request("SOCKS5 domain name is not valid UTF-8"))?;
      let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
      TargetAddr::Domain(domain, port)
    }
    other => {
      write_reply(stream, consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
      return Err(Error::invalid_request(format!(
        "unsupported SOCKS5 address type: {:#04x}",
        other
      )));
    }
  };
  Ok(target)
}

/// Write a reply with the given code, echoing `bound` as BND.ADDR/BND.PORT.
///
/// Failure replies carry the all-zero address.
pub async fn write_reply<S>(stream: &mut S, code: u8, bound: Option<SocketAddr>) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let mut reply = vec![consts::SOCKS5_VERSION, code, 0x00];
  match bound {
    Some(SocketAddr::V4(addr)) => {
      reply.push(consts::SOCKS5_ADDR_TYPE_IPV4);
      reply.extend_from_slice(&addr.ip().octets());
      reply.extend_from_slice(&addr.port().to_be_bytes());
    }
    Some(SocketAddr::V6(addr)) => {
      reply.push(consts::SOCKS5_ADDR_TYPE_IPV6);
      reply.extend_from_slice(&addr.ip().octets());
      reply.extend_from_slice(&addr.port().to_be_bytes());
    }
    None => {
      reply.push(consts::SOCKS5_ADDR_TYPE_IPV4);
      reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    }
  }
  stream.write_all(&reply).await?;
  stream.flush().await?;
  Ok(())
}

/// Map an outbound connect failure onto the closest SOCKS5 reply code
pub fn reply_code_for_error(error: &std::io::Error) -> u8 {
  use std::io::ErrorKind;
  match error.kind() {
    ErrorKind::ConnectionRefused => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
    ErrorKind::HostUnreachable => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
    ErrorKind::NetworkUnreachable => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
    ErrorKind::TimedOut => consts::SOCKS5_REPLY_TTL_EXPIRED,
    _ => consts::SOCKS5_REPLY_GENERAL_FAILURE,
  }
}
