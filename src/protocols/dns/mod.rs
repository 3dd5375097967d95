//! Name resolution.
//!
//! [`DnsResolver`] composes the hosts overlay, the synthetic allocator, the
//! TTL cache and the DoH client into the single `resolve` call the SOCKS
//! handler uses. Resolution order: literal IPs pass through, hosts rules
//! override, full worker relay mints a synthetic placeholder, and everything
//! else is answered from the cache backed by DoH (or the system resolver
//! when no DoH endpoint is configured).

pub mod cache;
pub mod doh;
pub mod hosts;
pub mod synthetic;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;
use url::Url;

pub use cache::Cache;
pub use doh::{DohClient, QueryType};
pub use hosts::{HostLookup, HostsOverlay};
pub use synthetic::SyntheticAllocator;

use crate::config::Config;
use crate::dialer::Dialer;
use crate::errors::ProxyError;

pub struct DnsResolver {
    cache: Cache<Vec<IpAddr>>,
    hosts: Arc<HostsOverlay>,
    synthetic: SyntheticAllocator,
    doh: Option<DohClient>,
    worker_full_relay: bool,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("worker_full_relay", &self.worker_full_relay)
            .finish_non_exhaustive()
    }
}

impl DnsResolver {
    pub fn new(config: &Config, dialer: Arc<Dialer>) -> anyhow::Result<Self> {
        let hosts = Arc::new(HostsOverlay::new(config.hosts.clone()));
        let doh = if config.uses_doh() {
            let endpoint = Url::parse(&config.remote_dns_addr)?;
            Some(DohClient::new(
                endpoint,
                dialer,
                hosts.clone(),
                config.fragment_dns(),
                Duration::from_secs(config.dns_request_timeout),
            ))
        } else {
            debug!(addr = %config.remote_dns_addr, "no doh endpoint, using the system resolver");
            None
        };

        Ok(Self {
            cache: Cache::new(Duration::from_secs(config.dns_cache_ttl)),
            hosts,
            synthetic: SyntheticAllocator::new(),
            doh,
            worker_full_relay: config.worker_full_relay(),
        })
    }

    /// Resolve a destination name on behalf of a SOCKS session.
    pub async fn resolve(&self, name: &str) -> Result<IpAddr, ProxyError> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.hosts.lookup(name) {
            HostLookup::Override(ip) => return Ok(ip),
            HostLookup::System => return system_lookup(name).await,
            HostLookup::Miss => {}
        }
        if self.worker_full_relay {
            // The real name travels inside the worker request at dial time;
            // the client only needs a local placeholder to connect to.
            return Ok(IpAddr::V4(self.synthetic.mint(name)?));
        }
        self.lookup_upstream(name).await
    }

    /// Resolution that never mints placeholders, for names the proxy itself
    /// must reach directly (the worker, the DoH endpoint in DNS-only mode).
    pub async fn resolve_direct(&self, name: &str) -> Result<IpAddr, ProxyError> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.hosts.lookup(name) {
            HostLookup::Override(ip) => return Ok(ip),
            HostLookup::System => return system_lookup(name).await,
            HostLookup::Miss => {}
        }
        self.lookup_upstream(name).await
    }

    /// The name behind a placeholder address, if `addr` is one.
    pub fn unmask(&self, addr: IpAddr) -> Option<String> {
        match addr {
            IpAddr::V4(v4) if SyntheticAllocator::is_synthetic(v4) => self.synthetic.reverse(v4),
            _ => None,
        }
    }

    async fn lookup_upstream(&self, name: &str) -> Result<IpAddr, ProxyError> {
        let Some(doh) = &self.doh else {
            return system_lookup(name).await;
        };
        let key = format!("{name}|{}", QueryType::A.label());
        let addrs = self
            .cache
            .get_or_load(&key, || doh.resolve(name, QueryType::A))
            .await?;
        pick_address(&addrs).ok_or_else(|| {
            ProxyError::resolution_failed(name, std::io::Error::other("answer carried no usable address"))
        })
    }
}

/// Prefer IPv4 answers; the synthetic block and most worker deployments are
/// v4-only, so sessions stay symmetric.
fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

async fn system_lookup(name: &str) -> Result<IpAddr, ProxyError> {
    let addrs: Vec<SocketAddr> = lookup_host((name, 0))
        .await
        .map_err(|err| ProxyError::resolution_failed(name, err))?
        .collect();
    let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
    pick_address(&ips)
        .ok_or_else(|| ProxyError::resolution_failed(name, std::io::Error::other("no addresses returned")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostRule;

    fn resolver(config: &Config) -> DnsResolver {
        DnsResolver::new(config, Arc::new(Dialer::new(config))).unwrap()
    }

    #[tokio::test]
    async fn literal_addresses_pass_through() {
        let r = resolver(&Config::default());
        assert_eq!(
            r.resolve("203.0.113.9").await.unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            r.resolve("2001:db8::1").await.unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn hosts_override_wins_without_any_network() {
        let config = Config {
            hosts: vec![HostRule {
                pattern: "*.corp".into(),
                address: "10.0.0.1".into(),
            }],
            // Guarantee any upstream attempt would fail loudly.
            remote_dns_addr: "https://doh.invalid/dns-query".into(),
            ..Config::default()
        };
        let r = resolver(&config);
        assert_eq!(r.resolve("api.corp").await.unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn full_worker_relay_mints_placeholders() {
        let config = Config {
            worker_enabled: true,
            worker_dns_only: false,
            worker_address: "https://worker.example.dev/".into(),
            ..Config::default()
        };
        let r = resolver(&config);

        let ip = r.resolve("blocked.example").await.unwrap();
        let IpAddr::V4(v4) = ip else { panic!("expected v4 placeholder") };
        assert!(SyntheticAllocator::is_synthetic(v4));
        assert_eq!(r.unmask(ip).as_deref(), Some("blocked.example"));

        // Stable across repeated requests for the same name.
        assert_eq!(r.resolve("blocked.example").await.unwrap(), ip);
    }

    #[tokio::test]
    async fn unmask_ignores_ordinary_addresses() {
        let r = resolver(&Config::default());
        assert_eq!(r.unmask("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn ipv4_is_preferred_when_mixed() {
        let addrs = vec![
            "2606:2800:220:1::1".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
        ];
        assert_eq!(pick_address(&addrs), Some("93.184.216.34".parse().unwrap()));
        let v6_only: Vec<IpAddr> = vec!["2606:2800:220:1::1".parse().unwrap()];
        assert_eq!(pick_address(&v6_only), Some(v6_only[0]));
        assert_eq!(pick_address(&[]), None);
    }
}
