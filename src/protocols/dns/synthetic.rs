//! Synthetic address allocator.
//!
//! When a destination name must travel to the worker unresolved, the SOCKS
//! client still needs some IP to connect to locally. Those placeholder
//! addresses are carved sequentially out of `198.18.0.0/15`, the RFC 2544
//! benchmarking block, which no real host should occupy. The name that minted
//! an address is remembered for the whole process lifetime so the dialer can
//! unmask it again when the session is actually established.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::errors::ProxyError;

const BASE: u32 = u32::from_be_bytes([198, 18, 0, 0]);
/// A /15 holds 2^17 addresses; the all-zero host is never handed out.
const SPAN: u32 = 1 << 17;

#[derive(Default)]
struct Registry {
    next_offset: u32,
    by_name: HashMap<String, Ipv4Addr>,
    by_addr: HashMap<Ipv4Addr, String>,
}

#[derive(Default)]
pub struct SyntheticAllocator {
    registry: Mutex<Registry>,
}

impl SyntheticAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address belongs to the reserved block this allocator mints from.
    pub fn is_synthetic(addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        (BASE..BASE + SPAN).contains(&value)
    }

    /// Mint (or return the already minted) placeholder address for `name`.
    pub fn mint(&self, name: &str) -> Result<Ipv4Addr, ProxyError> {
        let mut registry = self.registry.lock();
        if let Some(addr) = registry.by_name.get(name) {
            return Ok(*addr);
        }

        registry.next_offset += 1;
        if registry.next_offset >= SPAN {
            return Err(ProxyError::resolution_failed(
                name,
                std::io::Error::other("synthetic address block exhausted"),
            ));
        }
        let addr = Ipv4Addr::from(BASE + registry.next_offset);
        registry.by_name.insert(name.to_string(), addr);
        registry.by_addr.insert(addr, name.to_string());
        Ok(addr)
    }

    /// The name that minted `addr`, if it is one of ours.
    pub fn reverse(&self, addr: Ipv4Addr) -> Option<String> {
        self.registry.lock().by_addr.get(&addr).cloned()
    }
}
