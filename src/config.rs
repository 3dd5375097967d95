//! Runtime configuration.
//!
//! The on-disk format is a JSON object whose key names are kept verbatim
//! from the widely deployed config files for this kind of proxy, so existing
//! deployments keep loading without edits (`TLSHeaderLength`,
//! `ChunksLengthBeforeSni`, ...). Everything is optional; defaults produce a
//! working direct-mode proxy on `127.0.0.1:8085`.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use rand::Rng;
use serde::Deserialize;
use url::Url;

use crate::errors::ProxyError;

/// An inclusive `[lo, hi]` integer range as it appears in the config file.
pub type Range = [u64; 2];

/// One hosts-overlay rule. `Pattern` is an exact name or a `*.suffix`
/// wildcard; `Address` is an IP literal, or `127.0.0.1`/`localhost` to mean
/// "resolve with the system resolver".
#[derive(Debug, Clone, Deserialize)]
pub struct HostRule {
    #[serde(rename = "Pattern", alias = "Domain")]
    pub pattern: String,
    #[serde(rename = "Address", alias = "IP")]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "BindAddress")]
    pub bind_address: String,

    /// DoH endpoint (`https://...`). Anything else falls back to the
    /// operating system resolver.
    #[serde(rename = "RemoteDNSAddr")]
    pub remote_dns_addr: String,

    #[serde(rename = "WorkerAddress")]
    pub worker_address: String,
    /// Optional `ip:port` pin for the worker, bypassing DNS entirely.
    #[serde(rename = "WorkerIPPortAddress")]
    pub worker_ip_port_address: String,
    #[serde(rename = "WorkerEnabled")]
    pub worker_enabled: bool,
    #[serde(rename = "WorkerDNSOnly")]
    pub worker_dns_only: bool,

    #[serde(rename = "EnableLowLevelSockets")]
    pub enable_low_level_sockets: bool,
    #[serde(rename = "EnableDNSFragmentation")]
    pub enable_dns_fragmentation: bool,

    #[serde(rename = "TLSHeaderLength")]
    pub tls_header_length: usize,
    #[serde(rename = "TLSPaddingEnabled")]
    pub tls_padding_enabled: bool,
    #[serde(rename = "TLSPaddingSize")]
    pub tls_padding_size: Range,

    /// Seconds. Caps both the cache entry lifetime and the TTL taken from
    /// upstream answers.
    #[serde(rename = "DnsCacheTTL")]
    pub dns_cache_ttl: u64,
    /// Seconds.
    #[serde(rename = "DnsRequestTimeout")]
    pub dns_request_timeout: u64,

    #[serde(rename = "ChunksLengthBeforeSni")]
    pub chunks_length_before_sni: Range,
    #[serde(rename = "SniChunksLength")]
    pub sni_chunks_length: Range,
    #[serde(rename = "ChunksLengthAfterSni")]
    pub chunks_length_after_sni: Range,
    /// Milliseconds between consecutive chunk flushes.
    #[serde(rename = "DelayBetweenChunks")]
    pub delay_between_chunks: Range,

    /// Seconds without a completed read before the tunnel reader gives up
    /// and the link reconnects.
    #[serde(rename = "UdpReadTimeout")]
    pub udp_read_timeout: u64,
    /// Seconds allowed for one tunnel frame write.
    #[serde(rename = "UdpWriteTimeout")]
    pub udp_write_timeout: u64,
    /// Seconds of link silence after which an established tunnel is dropped
    /// instead of reconnected.
    #[serde(rename = "LinkIdleTimeout")]
    pub link_idle_timeout: u64,

    /// 8 ASCII characters identifying this client on tunnel frames.
    /// Generated at load time when left empty.
    #[serde(rename = "ShortClientID")]
    pub short_client_id: String,

    #[serde(rename = "Hosts")]
    pub hosts: Vec<HostRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8085".to_string(),
            remote_dns_addr: "https://1.1.1.1/dns-query".to_string(),
            worker_address: String::new(),
            worker_ip_port_address: String::new(),
            worker_enabled: false,
            worker_dns_only: false,
            enable_low_level_sockets: false,
            enable_dns_fragmentation: false,
            tls_header_length: 5,
            tls_padding_enabled: false,
            tls_padding_size: [40, 100],
            dns_cache_ttl: 300,
            dns_request_timeout: 10,
            chunks_length_before_sni: [1, 5],
            sni_chunks_length: [1, 5],
            chunks_length_after_sni: [5, 20],
            delay_between_chunks: [10, 30],
            udp_read_timeout: 120,
            udp_write_timeout: 30,
            link_idle_timeout: 120,
            short_client_id: String::new(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.finalize()?;
        Ok(config)
    }

    /// Fills generated fields and rejects values the rest of the crate
    /// relies on never seeing.
    pub fn finalize(&mut self) -> Result<(), ProxyError> {
        if self.short_client_id.is_empty() {
            self.short_client_id = generate_client_id();
        }

        if self.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ProxyError::ConfigInvalid(format!(
                "BindAddress {:?} is not an ip:port pair",
                self.bind_address
            )));
        }
        if self.tls_header_length < 1 {
            return Err(ProxyError::ConfigInvalid("TLSHeaderLength must be at least 1".into()));
        }
        for (name, range) in [
            ("TLSPaddingSize", &self.tls_padding_size),
            ("ChunksLengthBeforeSni", &self.chunks_length_before_sni),
            ("SniChunksLength", &self.sni_chunks_length),
            ("ChunksLengthAfterSni", &self.chunks_length_after_sni),
            ("DelayBetweenChunks", &self.delay_between_chunks),
        ] {
            if range[0] > range[1] {
                return Err(ProxyError::ConfigInvalid(format!(
                    "{name} range [{}, {}] has lo > hi",
                    range[0], range[1]
                )));
            }
        }
        if self.short_client_id.len() != 8 || !self.short_client_id.is_ascii() {
            return Err(ProxyError::ConfigInvalid(
                "ShortClientID must be exactly 8 ASCII characters".into(),
            ));
        }
        if self.worker_enabled {
            let url = Url::parse(&self.worker_address).map_err(|err| {
                ProxyError::ConfigInvalid(format!("WorkerAddress {:?}: {err}", self.worker_address))
            })?;
            if url.host_str().is_none() {
                return Err(ProxyError::ConfigInvalid("WorkerAddress has no host".into()));
            }
            if !self.worker_ip_port_address.is_empty()
                && self.worker_ip_port_address.parse::<SocketAddr>().is_err()
            {
                return Err(ProxyError::ConfigInvalid(format!(
                    "WorkerIPPortAddress {:?} is not an ip:port pair",
                    self.worker_ip_port_address
                )));
            }
        }
        if self.dns_cache_ttl == 0 {
            return Err(ProxyError::ConfigInvalid("DnsCacheTTL must be positive".into()));
        }
        Ok(())
    }

    /// True when this run resolves names over DoH rather than the system
    /// resolver.
    pub fn uses_doh(&self) -> bool {
        self.remote_dns_addr.starts_with("https://")
    }

    /// DoH ClientHello fragmentation is forced in worker-DNS-only mode, where
    /// the DoH endpoint itself is the censored party.
    pub fn fragment_dns(&self) -> bool {
        (self.worker_enabled && self.worker_dns_only) || self.enable_dns_fragmentation
    }

    /// Full worker relay: TCP via CONNECT, UDP via the WebSocket tunnel.
    pub fn worker_full_relay(&self) -> bool {
        self.worker_enabled && !self.worker_dns_only
    }

    pub fn worker_pinned_addr(&self) -> Option<SocketAddr> {
        self.worker_ip_port_address.parse().ok()
    }
}

fn generate_client_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let mut config = Config::default();
        config.finalize().unwrap();
        assert_eq!(config.short_client_id.len(), 8);
        assert!(config.uses_doh());
        assert!(!config.worker_full_relay());
    }

    #[test]
    fn parses_deployed_key_names() {
        let raw = r#"{
            "BindAddress": "127.0.0.1:1080",
            "TLSHeaderLength": 5,
            "ChunksLengthBeforeSni": [1, 3],
            "SniChunksLength": [1, 1],
            "ChunksLengthAfterSni": [10, 20],
            "DelayBetweenChunks": [0, 0],
            "WorkerEnabled": true,
            "WorkerDNSOnly": false,
            "WorkerAddress": "https://worker.example.dev/dns-query",
            "WorkerIPPortAddress": "188.114.96.0:443",
            "Hosts": [{"Pattern": "*.corp", "Address": "10.0.0.1"}]
        }"#;
        let mut config: Config = serde_json::from_str(raw).unwrap();
        config.finalize().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:1080");
        assert_eq!(config.sni_chunks_length, [1, 1]);
        assert!(config.worker_full_relay());
        assert_eq!(config.worker_pinned_addr().unwrap().port(), 443);
        assert_eq!(config.hosts[0].pattern, "*.corp");
    }

    #[test]
    fn rejects_inverted_range() {
        let mut config = Config {
            delay_between_chunks: [30, 10],
            ..Config::default()
        };
        let err = config.finalize().unwrap_err();
        assert!(err.to_string().contains("DelayBetweenChunks"));
    }

    #[test]
    fn rejects_bad_bind_address() {
        let mut config = Config {
            bind_address: "not-an-addr".into(),
            ..Config::default()
        };
        assert!(config.finalize().is_err());
    }

    #[test]
    fn worker_mode_requires_parseable_url() {
        let mut config = Config {
            worker_enabled: true,
            worker_address: "nonsense".into(),
            ..Config::default()
        };
        assert!(config.finalize().is_err());
    }
}
