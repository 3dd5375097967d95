//! UDP transport over the worker link.

pub mod websocket;

use bytes::{BufMut, Bytes, BytesMut};

pub use websocket::{TunnelConfig, WsTunnel};

/// One datagram in flight on a tunnel channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub channel: u16,
    pub data: Bytes,
}

/// Channel 0 is reserved on the wire; binds are numbered from 1.
pub const RESERVED_CHANNEL: u16 = 0;

/// Upper bound on a single tunnel message.
pub const MAX_FRAME_LEN: usize = 32 * 1024;

/// Client→worker frame: `client id ‖ channel (u16 be) ‖ payload`.
pub fn encode_frame(client_id: &str, packet: &UdpPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(client_id.len() + 2 + packet.data.len());
    buf.extend_from_slice(client_id.as_bytes());
    buf.put_u16(packet.channel);
    buf.extend_from_slice(&packet.data);
    buf.freeze()
}

/// Worker→client frame: `channel (u16 be) ‖ payload`. Anything shorter than
/// a channel id is noise.
pub fn decode_frame(frame: &[u8]) -> Option<UdpPacket> {
    if frame.len() < 2 {
        return None;
    }
    Some(UdpPacket {
        channel: u16::from_be_bytes([frame[0], frame[1]]),
        data: Bytes::copy_from_slice(&frame[2..]),
    })
}
