//! Outbound connection establishment.
//!
//! Every outbound TCP connection the proxy makes goes through [`Dialer`]: the
//! direct per-session dials, the DoH client's HTTPS connection, the worker
//! CONNECT relay and the WebSocket tunnel. The dialer owns the fragmentation
//! plan and the TLS connector, so callers only decide whether the first
//! record on a given connection should be fragmented.

pub mod fragment;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub use fragment::{FragmentPlan, FragmentedStream};

use crate::config::Config;

pub struct Dialer {
    plan: FragmentPlan,
    low_level: bool,
    tls: TlsConnector,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("plan", &self.plan)
            .field("low_level", &self.low_level)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    pub fn new(config: &Config) -> Self {
        Self {
            plan: plan_from_config(config),
            low_level: config.enable_low_level_sockets,
            tls: tls_connector(),
        }
    }

    pub fn plan(&self) -> FragmentPlan {
        self.plan.clone()
    }

    /// Plain TCP connect. Nagle is always off; low-level mode additionally
    /// builds the socket by hand and clamps the MSS so the kernel cannot
    /// coalesce fragment-sized writes back into one segment.
    pub async fn tcp_dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = if self.low_level {
            connect_low_level(addr).await?
        } else {
            TcpStream::connect(addr).await?
        };
        stream.set_nodelay(true)?;
        debug!(%addr, low_level = self.low_level, "connected");
        Ok(stream)
    }

    /// TCP connect whose first outbound TLS record will be fragmented.
    pub async fn fragmented_dial(&self, addr: SocketAddr) -> io::Result<FragmentedStream<TcpStream>> {
        let stream = self.tcp_dial(addr).await?;
        Ok(FragmentedStream::new(stream, self.plan.clone()))
    }

    /// TLS session over a dialer-owned TCP connection. With `fragment_hello`
    /// set, the ClientHello produced by the handshake below is what gets cut
    /// into chunks.
    pub async fn tls_dial(
        &self,
        host: &str,
        addr: SocketAddr,
        fragment_hello: bool,
    ) -> anyhow::Result<TlsStream<FragmentedStream<TcpStream>>> {
        let tcp = self
            .tcp_dial(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let wrapped = if fragment_hello {
            FragmentedStream::new(tcp, self.plan.clone())
        } else {
            FragmentedStream::passthrough(tcp, self.plan.clone())
        };
        let server_name =
            ServerName::try_from(host.to_string()).with_context(|| format!("invalid server name {host:?}"))?;
        let stream = self
            .tls
            .connect(server_name, wrapped)
            .await
            .with_context(|| format!("tls handshake with {host}"))?;
        Ok(stream)
    }
}

fn plan_from_config(config: &Config) -> FragmentPlan {
    let range = |r: &[u64; 2]| (r[0] as usize, r[1] as usize);
    FragmentPlan {
        tls_header_length: config.tls_header_length,
        before_sni: range(&config.chunks_length_before_sni),
        sni: range(&config.sni_chunks_length),
        after_sni: range(&config.chunks_length_after_sni),
        delay: (config.delay_between_chunks[0], config.delay_between_chunks[1]),
        padding: config.tls_padding_enabled.then(|| range(&config.tls_padding_size)),
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        warn!("native root store: {err}");
    }
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn connect_low_level(addr: SocketAddr) -> io::Result<TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    #[cfg(target_os = "linux")]
    clamp_mss(&socket)?;
    socket.set_nonblocking(true)?;
    TcpSocket::from_std_stream(socket.into()).connect(addr).await
}

#[cfg(target_os = "linux")]
fn clamp_mss(socket: &socket2::Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let mss: libc::c_int = 536;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &mss as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn plan_mirrors_the_config_ranges() {
        let config = Config {
            tls_padding_enabled: true,
            tls_padding_size: [16, 64],
            chunks_length_before_sni: [1, 3],
            sni_chunks_length: [1, 1],
            chunks_length_after_sni: [10, 20],
            delay_between_chunks: [2, 7],
            ..Config::default()
        };
        let plan = plan_from_config(&config);
        assert_eq!(plan.tls_header_length, 5);
        assert_eq!(plan.before_sni, (1, 3));
        assert_eq!(plan.sni, (1, 1));
        assert_eq!(plan.after_sni, (10, 20));
        assert_eq!(plan.delay, (2, 7));
        assert_eq!(plan.padding, Some((16, 64)));
    }

    #[test]
    fn padding_disabled_means_no_padding_range() {
        let plan = plan_from_config(&Config::default());
        assert_eq!(plan.padding, None);
    }

    #[tokio::test]
    async fn fragmented_dial_delivers_bytes_intact() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let dialer = Dialer::new(&Config::default());
        let mut stream = dialer.fragmented_dial(addr).await.unwrap();
        let payload = b"not tls, just bytes";
        stream.write_all(payload).await.unwrap();
        stream.flush().await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(server.await.unwrap(), payload);
    }
}
