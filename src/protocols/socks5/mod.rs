//! RFC 1928 wire types for the server side of the proxy.
//!
//! Only what the listener needs: the greeting (NO_AUTH), the request with its
//! three address forms, reply encoding and the UDP relay header. Everything
//! reads and writes through plain `AsyncRead`/`AsyncWrite` so it works on any
//! stream the handler happens to hold.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

/// Reply codes from RFC 1928 §6.
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            0x03 => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

/// Destination as carried on the wire: a literal address or a name the
/// proxy still has to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(name, _) => name.clone(),
        }
    }

    /// `host:port` form used as an HTTP CONNECT request target.
    pub fn target_string(&self) -> String {
        match self {
            Self::Ip(addr) => addr.to_string(),
            Self::Domain(name, port) => format!("{name}:{port}"),
        }
    }

    /// Decode ATYP + address + port from `buf`, returning the consumed length.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf.first().context("empty address")?;
        match atyp {
            0x01 => {
                if buf.len() < 7 {
                    bail!("short IPv4 address");
                }
                let ip: [u8; 4] = buf[1..5].try_into().unwrap();
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Self::Ip(SocketAddr::new(IpAddr::from(ip), port)), 7))
            }
            0x04 => {
                if buf.len() < 19 {
                    bail!("short IPv6 address");
                }
                let ip: [u8; 16] = buf[1..17].try_into().unwrap();
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Self::Ip(SocketAddr::new(IpAddr::from(ip), port)), 19))
            }
            0x03 => {
                let len = *buf.get(1).context("short domain address")? as usize;
                let end = 2 + len;
                if buf.len() < end + 2 {
                    bail!("short domain address");
                }
                let name = std::str::from_utf8(&buf[2..end])
                    .context("domain is not utf-8")?
                    .to_string();
                let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
                Ok((Self::Domain(name, port), end + 2))
            }
            other => bail!("unknown ATYP {other:#x}"),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(0x01);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(0x04);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Domain(name, port) => {
                buf.push(0x03);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let atyp = stream.read_u8().await?;
        match atyp {
            0x01 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;
                let (addr, _) = Self::parse(&[&[0x01][..], &buf[..]].concat())?;
                Ok(addr)
            }
            0x04 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;
                let (addr, _) = Self::parse(&[&[0x04][..], &buf[..]].concat())?;
                Ok(addr)
            }
            0x03 => {
                let len = stream.read_u8().await? as usize;
                let mut buf = vec![0u8; len + 2];
                stream.read_exact(&mut buf).await?;
                let name = std::str::from_utf8(&buf[..len])
                    .context("domain is not utf-8")?
                    .to_string();
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok(Self::Domain(name, port))
            }
            other => bail!("unknown ATYP {other:#x}"),
        }
    }
}

/// Method negotiation. Only NO_AUTH is offered back; anything else gets
/// `0xff` and an error so the caller closes the session.
pub async fn greet<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let version = stream.read_u8().await.context("reading greeting")?;
    if version != VERSION {
        bail!("unsupported SOCKS version {version}");
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
        bail!("client offers no acceptable auth method");
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Command, Address)> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await.context("reading request")?;
    if header[0] != VERSION {
        bail!("unsupported SOCKS version {} in request", header[0]);
    }
    let command = Command::from_byte(header[1])
        .with_context(|| format!("unknown command {:#x}", header[1]))?;
    let address = Address::read(stream).await?;
    Ok((command, address))
}

pub async fn write_reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: u8,
    bind: SocketAddr,
) -> Result<()> {
    let mut buf = Vec::with_capacity(22);
    buf.push(VERSION);
    buf.push(code);
    buf.push(0x00);
    Address::Ip(bind).encode(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Header prefixed to every datagram on the UDP relay (RFC 1928 §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub fragment: u8,
    pub dest: Address,
}

impl UdpHeader {
    /// Split a relay datagram into its header and the payload offset.
    pub fn parse(datagram: &[u8]) -> Result<(Self, usize)> {
        if datagram.len() < 4 {
            bail!("short UDP relay datagram");
        }
        let fragment = datagram[2];
        let (dest, consumed) = Address::parse(&datagram[3..])?;
        Ok((Self { fragment, dest }, 3 + consumed))
    }

    pub fn encode(dest: &Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + payload.len());
        buf.extend_from_slice(&[0x00, 0x00, 0x00]);
        dest.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }
}
