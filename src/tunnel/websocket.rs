//! Persistent UDP-over-WebSocket multiplexer.
//!
//! One WebSocket per worker endpoint carries every UDP bind as a numbered
//! channel. The first [`WsTunnel::attach`] spawns a supervisor task that
//! dials the worker and runs a reader and a writer over the link; whichever
//! side fails first drags the other down with it, the connection is closed
//! once, and the supervisor reconnects with capped jittered backoff while
//! traffic is recent. A link silent for longer than the idle timeout is
//! dropped from the registry instead of reconnected, so tunnels self-heal
//! under load and disappear when nobody uses them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use fastwebsockets::{
    handshake, Frame, OpCode, Payload, WebSocket, WebSocketError, WebSocketRead, WebSocketWrite,
};
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::dialer::Dialer;
use crate::protocols::dns::DnsResolver;
use crate::tunnel::{decode_frame, encode_frame, UdpPacket, MAX_FRAME_LEN};

/// Depth of the shared write queue and of each bind's delivery queue.
const QUEUE_DEPTH: usize = 512;
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub short_client_id: String,
    /// Worker transport address pinned in the config, bypassing resolution.
    pub pinned_addr: Option<SocketAddr>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

type BindMap = Arc<Mutex<HashMap<u16, mpsc::Sender<UdpPacket>>>>;

struct Tunnel {
    write_tx: mpsc::Sender<UdpPacket>,
    binds: BindMap,
    next_channel: u16,
    supervisor: JoinHandle<()>,
}

pub struct WsTunnel {
    dialer: Arc<Dialer>,
    resolver: Arc<DnsResolver>,
    config: Arc<TunnelConfig>,
    tunnels: Arc<Mutex<HashMap<String, Tunnel>>>,
}

impl std::fmt::Debug for WsTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTunnel")
            .field("dialer", &self.dialer)
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WsTunnel {
    pub fn new(dialer: Arc<Dialer>, resolver: Arc<DnsResolver>, config: TunnelConfig) -> Self {
        Self {
            dialer,
            resolver,
            config: Arc::new(config),
            tunnels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a UDP bind on the endpoint's tunnel, creating the tunnel on
    /// first use. Returns the shared write queue and the bind's channel id.
    pub fn attach(
        &self,
        endpoint: &str,
        bind_tx: mpsc::Sender<UdpPacket>,
    ) -> anyhow::Result<(mpsc::Sender<UdpPacket>, u16)> {
        let mut tunnels = self.tunnels.lock();
        if let Some(tunnel) = tunnels.get_mut(endpoint) {
            if tunnel.supervisor.is_finished() {
                // Supervisor lost the race between dropping the link and this
                // attach; start over with a fresh tunnel.
                tunnels.remove(endpoint);
            } else {
                let channel = tunnel
                    .next_channel
                    .checked_add(1)
                    .context("tunnel channel ids exhausted")?;
                tunnel.next_channel = channel;
                tunnel.binds.lock().insert(channel, bind_tx);
                return Ok((tunnel.write_tx.clone(), channel));
            }
        }

        let (write_tx, write_rx) = mpsc::channel(QUEUE_DEPTH);
        let binds: BindMap = Arc::new(Mutex::new(HashMap::from([(1u16, bind_tx)])));
        let supervisor = tokio::spawn(supervise(
            endpoint.to_string(),
            write_rx,
            binds.clone(),
            self.dialer.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.tunnels.clone(),
        ));
        tunnels.insert(
            endpoint.to_string(),
            Tunnel {
                write_tx: write_tx.clone(),
                binds,
                next_channel: 1,
                supervisor,
            },
        );
        Ok((write_tx, 1))
    }

    /// Unregister a bind. Frames still in flight for the channel are dropped
    /// by the reader from now on.
    pub fn detach(&self, endpoint: &str, channel: u16) {
        if let Some(tunnel) = self.tunnels.lock().get(endpoint) {
            tunnel.binds.lock().remove(&channel);
        }
    }

    /// Tear down every tunnel immediately.
    pub fn shutdown(&self) {
        let mut tunnels = self.tunnels.lock();
        for (endpoint, tunnel) in tunnels.drain() {
            debug!(%endpoint, "closing tunnel");
            tunnel.supervisor.abort();
        }
    }

    #[cfg(test)]
    fn is_established(&self, endpoint: &str) -> bool {
        self.tunnels.lock().contains_key(endpoint)
    }
}

async fn supervise(
    endpoint: String,
    mut write_rx: mpsc::Receiver<UdpPacket>,
    binds: BindMap,
    dialer: Arc<Dialer>,
    resolver: Arc<DnsResolver>,
    config: Arc<TunnelConfig>,
    registry: Arc<Mutex<HashMap<String, Tunnel>>>,
) {
    // A fresh tunnel earns a full idle window before it may be dropped.
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let mut failures: u32 = 0;

    loop {
        let ws = match dial_websocket(&endpoint, &dialer, &resolver, &config).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(%endpoint, "tunnel dial failed: {err:#}");
                if last_activity.lock().elapsed() > config.idle_timeout {
                    break;
                }
                failures += 1;
                tokio::time::sleep(reconnect_backoff(failures)).await;
                continue;
            }
        };
        failures = 0;
        info!(%endpoint, "tunnel established");

        let (read_half, write_half) = ws.split(tokio::io::split);
        let (control_tx, control_rx) = mpsc::channel::<Frame<'static>>(8);

        let outcome = tokio::select! {
            r = write_loop(write_half, &mut write_rx, control_rx, &config, &last_activity) => r.context("tunnel writer"),
            r = read_loop(read_half, &binds, control_tx, &config, &last_activity) => r.context("tunnel reader"),
        };
        // Both halves are dropped here, which closes the socket exactly once
        // no matter which side ended first.
        match outcome {
            Ok(()) => debug!(%endpoint, "tunnel link closed"),
            Err(err) => warn!(%endpoint, "tunnel link error: {err:#}"),
        }

        if last_activity.lock().elapsed() > config.idle_timeout {
            break;
        }
    }

    registry.lock().remove(&endpoint);
    info!(%endpoint, "idle tunnel dropped");
}

async fn write_loop<S: AsyncWrite + Unpin>(
    mut ws: WebSocketWrite<S>,
    write_rx: &mut mpsc::Receiver<UdpPacket>,
    mut control_rx: mpsc::Receiver<Frame<'static>>,
    config: &TunnelConfig,
    last_activity: &Mutex<Instant>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            frame = control_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                ws.write_frame(frame).await?;
            }
            packet = write_rx.recv() => {
                // All write handles gone means no bind will ever use this
                // tunnel again.
                let Some(packet) = packet else { return Ok(()) };
                let wire = encode_frame(&config.short_client_id, &packet);
                timeout(config.write_timeout, ws.write_frame(Frame::binary(Payload::Owned(wire.to_vec()))))
                    .await
                    .context("tunnel write timed out")??;
                *last_activity.lock() = Instant::now();
            }
        }
    }
}

async fn read_loop<S: AsyncRead + Unpin>(
    mut ws: WebSocketRead<S>,
    binds: &BindMap,
    control_tx: mpsc::Sender<Frame<'static>>,
    config: &TunnelConfig,
    last_activity: &Mutex<Instant>,
) -> anyhow::Result<()> {
    // Pings and close echoes the parser obligates us to send are shipped to
    // the writer, the only side allowed to touch the socket's write half.
    let mut obligated = |frame: Frame<'_>| {
        let owned = Frame::new(frame.fin, frame.opcode, None, Payload::Owned(frame.payload.to_vec()));
        let tx = control_tx.clone();
        async move { tx.send(owned).await.map_err(|_| WebSocketError::ConnectionClosed) }
    };

    loop {
        let frame = timeout(config.read_timeout, ws.read_frame(&mut obligated))
            .await
            .context("tunnel read timed out")??;
        match frame.opcode {
            OpCode::Binary => {
                let Some(packet) = decode_frame(&frame.payload) else {
                    continue;
                };
                let target = binds.lock().get(&packet.channel).cloned();
                match target {
                    Some(tx) => {
                        // A full bind queue drops the datagram, UDP-style;
                        // one slow consumer must not stall the shared reader.
                        if tx.try_send(packet).is_ok() {
                            *last_activity.lock() = Instant::now();
                        }
                    }
                    None => trace!(channel = packet.channel, "frame for stale channel dropped"),
                }
            }
            OpCode::Close => return Ok(()),
            _ => {}
        }
    }
}

async fn dial_websocket(
    endpoint: &str,
    dialer: &Dialer,
    resolver: &DnsResolver,
    config: &TunnelConfig,
) -> anyhow::Result<WebSocket<TokioIo<Upgraded>>> {
    let url = Url::parse(endpoint).with_context(|| format!("tunnel endpoint {endpoint:?}"))?;
    let host = url.host_str().context("tunnel endpoint has no host")?.to_string();
    let use_tls = matches!(url.scheme(), "wss" | "https");
    let port = url.port().unwrap_or(if use_tls { 443 } else { 80 });
    let addr = match config.pinned_addr {
        Some(addr) => addr,
        None => SocketAddr::new(resolver.resolve_direct(&host).await?, port),
    };

    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target = format!("{target}?{query}");
    }
    let request = Request::builder()
        .method("GET")
        .uri(target)
        .header(HOST, host.as_str())
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header("Sec-WebSocket-Key", handshake::generate_key())
        .header("Sec-WebSocket-Version", "13")
        .body(Empty::<Bytes>::new())?;

    let (mut ws, _) = if use_tls {
        // The worker is exactly the host the censor is watching for; its
        // ClientHello gets the same treatment as any destination.
        let stream = dialer.tls_dial(&host, addr, true).await?;
        handshake::client(&SpawnExecutor, request, stream).await?
    } else {
        let stream = dialer.tcp_dial(addr).await?;
        handshake::client(&SpawnExecutor, request, stream).await?
    };
    ws.set_max_message_size(MAX_FRAME_LEN);
    Ok(ws)
}

fn reconnect_backoff(failures: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(1 << failures.min(4).saturating_sub(1));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp.min(RECONNECT_CAP) + jitter
}

struct SpawnExecutor;

impl<Fut> hyper::rt::Executor<Fut> for SpawnExecutor
where
    Fut: std::future::Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    fn execute(&self, fut: Fut) {
        tokio::spawn(fut);
    }
}
