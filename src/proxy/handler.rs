//! Per-connection protocol handling.
//!
//! The listener speaks both SOCKS5 and HTTP CONNECT on one port: the first
//! byte decides (SOCKS5 always opens with 0x05). Request-phase failures are
//! answered with the matching SOCKS reply code before the close; once the
//! relay is running, errors just tear the session down.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::ProxyError;
use crate::protocols::socks5::{self, reply, Address, Command};
use crate::proxy::{udp, ServerContext};

/// Streams the relay copies between; concrete types differ per mode.
trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

type BoxedStream = Box<dyn SessionStream>;

pub async fn serve_connection(ctx: Arc<ServerContext>, mut stream: TcpStream, peer: SocketAddr) {
    let result = async {
        let mut first = [0u8; 1];
        let n = stream.peek(&mut first).await?;
        if n == 0 {
            return Ok(());
        }
        if first[0] == socks5::VERSION {
            serve_socks(&ctx, &mut stream).await
        } else {
            serve_http_connect(&ctx, &mut stream).await
        }
    }
    .await;

    if let Err(err) = result {
        debug!(%peer, "session ended: {err:#}");
    }
}

async fn serve_socks(ctx: &ServerContext, stream: &mut TcpStream) -> anyhow::Result<()> {
    socks5::greet(stream).await?;
    let (command, address) = socks5::read_request(stream).await?;

    match command {
        Command::Connect => {
            let upstream = match connect_destination(ctx, &address).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    let code = err
                        .downcast_ref::<ProxyError>()
                        .map_or(reply::GENERAL_FAILURE, ProxyError::socks_reply);
                    socks5::write_reply(stream, code, unspecified_bind()).await?;
                    return Err(err.context(format!("connect to {}", address.target_string())));
                }
            };
            let bind = stream.local_addr().unwrap_or_else(|_| unspecified_bind());
            socks5::write_reply(stream, reply::SUCCEEDED, bind).await?;
            info!(target = %address.target_string(), "session established");
            relay(stream, upstream).await
        }
        Command::UdpAssociate => {
            if !ctx.config.worker_full_relay() {
                socks5::write_reply(stream, reply::COMMAND_NOT_SUPPORTED, unspecified_bind()).await?;
                bail!("udp associate requested without worker relay");
            }
            udp::run_associate(ctx, stream).await
        }
        Command::Bind => {
            socks5::write_reply(stream, reply::COMMAND_NOT_SUPPORTED, unspecified_bind()).await?;
            bail!("bind command is not supported");
        }
    }
}

async fn serve_http_connect(ctx: &ServerContext, stream: &mut TcpStream) -> anyhow::Result<()> {
    let head = read_head(stream).await?;
    let address = match parse_connect_line(&head) {
        Ok(address) => address,
        Err(err) => {
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(err);
        }
    };

    let upstream = match connect_destination(ctx, &address).await {
        Ok(upstream) => upstream,
        Err(err) => {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(err.context(format!("connect to {}", address.target_string())));
        }
    };
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    info!(target = %address.target_string(), "http connect session established");
    relay(stream, upstream).await
}

/// Open the upstream half of a session according to the operating mode.
async fn connect_destination(ctx: &ServerContext, address: &Address) -> anyhow::Result<BoxedStream> {
    if ctx.config.worker_full_relay() {
        let target = unmask_target(ctx, address);
        let stream = worker_connect(ctx, &target).await?;
        return Ok(Box::new(stream));
    }

    let port = address.port();
    let ip = match address {
        Address::Ip(addr) => addr.ip(),
        Address::Domain(name, _) => ctx.resolver.resolve(name).await?,
    };
    let stream = ctx
        .dialer
        .fragmented_dial(SocketAddr::new(ip, port))
        .await
        .map_err(ProxyError::ConnectFailed)?;
    Ok(Box::new(stream))
}

/// Placeholder addresses go back to the hostname that minted them, so the
/// worker sees the name and resolves it on its side of the chokepoint.
fn unmask_target(ctx: &ServerContext, address: &Address) -> String {
    match address {
        Address::Ip(addr) => match ctx.resolver.unmask(addr.ip()) {
            Some(name) => format!("{name}:{}", addr.port()),
            None => addr.to_string(),
        },
        Address::Domain(name, port) => format!("{name}:{port}"),
    }
}

/// HTTP CONNECT through the worker. The TLS session to the worker is itself
/// fragmented; after the 2xx the connection is an opaque byte pipe.
async fn worker_connect(
    ctx: &ServerContext,
    target: &str,
) -> anyhow::Result<impl AsyncRead + AsyncWrite + Unpin + Send> {
    let url = Url::parse(&ctx.config.worker_address).context("worker address")?;
    let host = url.host_str().context("worker address has no host")?.to_string();
    let port = url.port().unwrap_or(443);
    let addr = match ctx.config.worker_pinned_addr() {
        Some(addr) => addr,
        None => SocketAddr::new(ctx.resolver.resolve_direct(&host).await?, port),
    };

    let mut stream = ctx.dialer.tls_dial(&host, addr, true).await?;
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {host}\r\nProxy-Connection: Keep-Alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    read_connect_response(&mut stream).await?;
    Ok(stream)
}

async fn relay<A>(client: &mut TcpStream, mut upstream: A) -> anyhow::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(sent, received, "session finished");
            Ok(())
        }
        Err(err) => {
            warn!("relay failed: {err}");
            Err(ProxyError::RelayIo(err).into())
        }
    }
}

fn unspecified_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Read an HTTP request head up to the blank line.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            bail!("oversized request head");
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            bail!("client closed during request head");
        }
        head.push(byte[0]);
    }
    Ok(head)
}

/// `CONNECT host:port HTTP/1.1` → destination address.
fn parse_connect_line(head: &[u8]) -> anyhow::Result<Address> {
    let text = std::str::from_utf8(head).context("request head is not utf-8")?;
    let line = text.lines().next().context("empty request head")?;
    let mut parts = line.split_whitespace();
    let method = parts.next().context("missing method")?;
    if !method.eq_ignore_ascii_case("CONNECT") {
        bail!("unsupported method {method}");
    }
    let target = parts.next().context("missing connect target")?;

    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(Address::Ip(addr));
    }
    let (host, port) = target.rsplit_once(':').context("target without port")?;
    let port: u16 = port.parse().context("invalid target port")?;
    if host.is_empty() {
        bail!("empty connect host");
    }
    Ok(Address::Domain(host.to_string(), port))
}

/// Relay response to our CONNECT; anything but a 2xx is a failed dial.
async fn read_connect_response<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<()> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            bail!("oversized relay response");
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            bail!("relay closed during connect");
        }
        head.push(byte[0]);
    }
    let text = std::str::from_utf8(&head).context("relay response is not utf-8")?;
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .context("relay response without status")?
        .parse()
        .context("relay status is not numeric")?;
    if !(200..300).contains(&status) {
        bail!("relay refused connect: status {status}");
    }
    Ok(())
}
