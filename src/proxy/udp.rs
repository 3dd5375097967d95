//! UDP ASSOCIATE sessions over the worker tunnel.
//!
//! The proxy binds an ephemeral local UDP socket, advertises it in the SOCKS
//! reply and pumps datagrams between that socket and a tunnel channel. The
//! SOCKS UDP header stays on the datagram in both directions; the worker is
//! the one that interprets it. The association lives exactly as long as the
//! TCP control connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocols::socks5::{self, reply};
use crate::proxy::ServerContext;
use crate::tunnel::UdpPacket;

const BIND_QUEUE_DEPTH: usize = 512;
const MAX_DATAGRAM: usize = 64 * 1024;

type LastPeer = Arc<Mutex<Option<SocketAddr>>>;

pub async fn run_associate<S>(ctx: &ServerContext, control: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let endpoint = ctx
        .worker_ws_endpoint
        .clone()
        .context("udp associate without worker relay")?;

    let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await?);
    let local = socket.local_addr()?;
    let (bind_tx, bind_rx) = mpsc::channel::<UdpPacket>(BIND_QUEUE_DEPTH);
    let (tunnel_tx, channel) = ctx.tunnel.attach(&endpoint, bind_tx)?;

    socks5::write_reply(control, reply::SUCCEEDED, local).await?;
    debug!(%local, channel, "udp associate open");

    // The client's source address is learned from its first datagram;
    // replies go to wherever the client last sent from.
    let client_addr: LastPeer = Arc::new(Mutex::new(None));

    let control_closed = async {
        // Nothing meaningful arrives on the control stream after the reply;
        // its EOF is the teardown signal.
        let mut sink = [0u8; 256];
        loop {
            match control.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    };

    let outcome = tokio::select! {
        r = pump_to_tunnel(socket.clone(), client_addr.clone(), tunnel_tx, channel) => r,
        r = pump_to_client(socket.clone(), client_addr.clone(), bind_rx) => r,
        _ = control_closed => Ok(()),
    };

    ctx.tunnel.detach(&endpoint, channel);
    debug!(%local, channel, "udp associate closed");
    outcome
}

/// Client datagrams, SOCKS UDP header included, become tunnel packets on
/// this association's channel.
async fn pump_to_tunnel(
    socket: Arc<UdpSocket>,
    client_addr: LastPeer,
    tunnel_tx: mpsc::Sender<UdpPacket>,
    channel: u16,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        *client_addr.lock() = Some(from);
        let packet = UdpPacket {
            channel,
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        if tunnel_tx.send(packet).await.is_err() {
            anyhow::bail!("tunnel write queue closed");
        }
    }
}

/// Tunnel packets for this channel go back to the client verbatim.
async fn pump_to_client(
    socket: Arc<UdpSocket>,
    client_addr: LastPeer,
    mut bind_rx: mpsc::Receiver<UdpPacket>,
) -> anyhow::Result<()> {
    while let Some(packet) = bind_rx.recv().await {
        let Some(to) = *client_addr.lock() else {
            trace!("reply arrived before any client datagram, dropped");
            continue;
        };
        socket.send_to(&packet.data, to).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_datagrams_reach_the_tunnel_queue_with_their_channel() {
        let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        let local = socket.local_addr().unwrap();
        let client_addr: LastPeer = Arc::new(Mutex::new(None));
        let (tunnel_tx, mut tunnel_rx) = mpsc::channel(8);

        let pump = tokio::spawn(pump_to_tunnel(socket, client_addr.clone(), tunnel_tx, 3));

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let datagram = socks5::UdpHeader::encode(
            &socks5::Address::Domain("dns.example".into(), 53),
            b"payload",
        );
        sender.send_to(&datagram, local).await.unwrap();

        let packet = tunnel_rx.recv().await.unwrap();
        assert_eq!(packet.channel, 3);
        assert_eq!(&packet.data[..], &datagram[..]);
        assert_eq!(*client_addr.lock(), Some(sender.local_addr().unwrap()));

        pump.abort();
    }

    #[tokio::test]
    async fn tunnel_packets_come_back_to_the_last_client_address() {
        let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        let local = socket.local_addr().unwrap();
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_addr: LastPeer = Arc::new(Mutex::new(Some(receiver.local_addr().unwrap())));
        let (bind_tx, bind_rx) = mpsc::channel(8);

        let pump = tokio::spawn(pump_to_client(socket, client_addr, bind_rx));

        bind_tx
            .send(UdpPacket {
                channel: 3,
                data: Bytes::from_static(b"reply bytes"),
            })
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply bytes");
        assert_eq!(from, local);

        drop(bind_tx);
        pump.await.unwrap().unwrap();
    }
}
