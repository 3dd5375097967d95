//! fraglet — a local SOCKS5/HTTP circumvention proxy.
//!
//! The proxy accepts SOCKS5 and HTTP CONNECT sessions on the loopback
//! interface and forwards them to their real destinations while making the
//! first bytes of each TLS connection useless to deep packet inspection:
//! the ClientHello is cut into randomized chunks around the SNI extension
//! and flushed with randomized pauses. Name resolution runs over DoH with a
//! TTL cache, a hosts overlay and a synthetic-address allocator; optional
//! worker modes relay TCP over HTTPS CONNECT and UDP over a persistent
//! WebSocket tunnel.

pub mod config;
pub mod dialer;
pub mod errors;
pub mod protocols;
pub mod proxy;
pub mod tunnel;
