//! Listener and wiring.
//!
//! [`Server::bind`] builds the whole object graph (dialer, resolver, tunnel
//! registry) and claims the listening socket; [`Server::run`] accepts until
//! a [`ServerHandle::shutdown`] arrives, then tears down the tunnels. One
//! task per accepted connection, nothing shared but the context.

pub mod handler;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::dialer::Dialer;
use crate::errors::ProxyError;
use crate::protocols::dns::DnsResolver;
use crate::tunnel::{TunnelConfig, WsTunnel};

/// Everything a session task needs, shared read-only.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub dialer: Arc<Dialer>,
    pub resolver: Arc<DnsResolver>,
    pub tunnel: Arc<WsTunnel>,
    /// WebSocket endpoint derived from the worker address, present only in
    /// full relay mode.
    pub worker_ws_endpoint: Option<String>,
}

#[derive(Debug)]
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

/// Cheap clonable handle that stops a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self, ProxyError> {
        let dialer = Arc::new(Dialer::new(&config));
        let resolver = Arc::new(
            DnsResolver::new(&config, dialer.clone())
                .map_err(|err| ProxyError::ConfigInvalid(err.to_string()))?,
        );
        let tunnel = Arc::new(WsTunnel::new(
            dialer.clone(),
            resolver.clone(),
            TunnelConfig {
                short_client_id: config.short_client_id.clone(),
                pinned_addr: config.worker_pinned_addr(),
                read_timeout: Duration::from_secs(config.udp_read_timeout),
                write_timeout: Duration::from_secs(config.udp_write_timeout),
                idle_timeout: Duration::from_secs(config.link_idle_timeout),
            },
        ));

        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(ProxyError::BindFailed)?;

        let worker_ws_endpoint = worker_ws_endpoint(&config);
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                dialer,
                resolver,
                tunnel,
                worker_ws_endpoint,
            }),
            listener,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: self.stop_tx.clone(),
        }
    }

    /// Accept until the handle says stop, then close every tunnel.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(addr = %self.ctx.config.bind_address, "socks/http proxy listening");
        loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(handler::serve_connection(ctx, stream, peer));
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
        info!("shutting down");
        self.ctx.tunnel.shutdown();
        Ok(())
    }
}

/// The UDP tunnel upgrades on the same worker URL, with the scheme swapped.
fn worker_ws_endpoint(config: &Config) -> Option<String> {
    if !config.worker_full_relay() {
        return None;
    }
    let address = &config.worker_address;
    let endpoint = if let Some(rest) = address.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = address.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        address.clone()
    };
    Some(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn direct_config(bind: &str) -> Config {
        let mut config = Config {
            bind_address: bind.to_string(),
            ..Config::default()
        };
        config.finalize().unwrap();
        config
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_server() -> (SocketAddr, ServerHandle) {
        let server = Server::bind(direct_config("127.0.0.1:0")).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    #[tokio::test]
    async fn socks_connect_relays_in_direct_mode() {
        let echo = spawn_echo().await;
        let (proxy, handle) = spawn_server().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        let SocketAddr::V4(echo_v4) = echo else { unreachable!() };
        request.extend_from_slice(&echo_v4.ip().octets());
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], 0x00, "expected success reply");
        let mut bind_rest = [0u8; 6];
        client.read_exact(&mut bind_rest).await.unwrap();

        client.write_all(b"ping through the proxy").await.unwrap();
        let mut echoed = [0u8; 22];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping through the proxy");

        handle.shutdown();
    }

    #[tokio::test]
    async fn socks_connect_to_refused_port_reports_0x05() {
        let (proxy, handle) = spawn_server().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        // Port 1 on loopback refuses immediately.
        let request = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x01];
        client.write_all(&request).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], crate::protocols::socks5::reply::CONNECTION_REFUSED);

        handle.shutdown();
    }

    #[tokio::test]
    async fn bind_command_gets_not_supported() {
        let (proxy, handle) = spawn_server().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        let request = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
        client.write_all(&request).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], 0x07);

        handle.shutdown();
    }

    #[tokio::test]
    async fn http_connect_relays_on_the_same_port() {
        let echo = spawn_echo().await;
        let (proxy, handle) = spawn_server().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");

        client.write_all(b"opaque bytes").await.unwrap();
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque bytes");

        handle.shutdown();
    }

    #[tokio::test]
    async fn udp_associate_without_worker_is_refused() {
        let (proxy, handle) = spawn_server().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        let request = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00];
        client.write_all(&request).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], 0x07);

        handle.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let server = Server::bind(direct_config("127.0.0.1:0")).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let running = tokio::spawn(server.run());

        handle.shutdown();
        running.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn ws_endpoint_swaps_the_scheme() {
        let mut config = Config {
            worker_enabled: true,
            worker_dns_only: false,
            worker_address: "https://worker.example.dev/relay".into(),
            ..Config::default()
        };
        assert_eq!(
            worker_ws_endpoint(&config).as_deref(),
            Some("wss://worker.example.dev/relay")
        );

        config.worker_dns_only = true;
        assert_eq!(worker_ws_endpoint(&config), None);
    }

    #[test]
    fn binding_a_bad_address_is_fatal() {
        let config = Config {
            bind_address: "203.0.113.77:1".into(), // not a local address
            ..Config::default()
        };
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(Server::bind(config))
            .unwrap_err();
        assert!(matches!(err, ProxyError::BindFailed(_)));
    }
}
