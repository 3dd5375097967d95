//! DNS-over-HTTPS client speaking the `application/dns-json` dialect.
//!
//! Queries ride on a connection opened through the dialer, so the DoH
//! endpoint's own ClientHello is fragmented whenever DNS fragmentation is
//! turned on. Every failure mode (connect, timeout, HTTP status, JSON shape)
//! collapses into one resolution-failed error with the cause attached.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::lookup_host;
use tracing::debug;
use url::Url;

use crate::dialer::Dialer;
use crate::errors::ProxyError;
use crate::protocols::dns::hosts::{HostLookup, HostsOverlay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Aaaa,
}

impl QueryType {
    /// RR type number as used in the JSON answer section.
    pub fn record(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Aaaa => 28,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DnsJsonAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DnsJsonResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonAnswer>,
}

pub struct DohClient {
    endpoint: Url,
    dialer: Arc<Dialer>,
    hosts: Arc<HostsOverlay>,
    fragment_hello: bool,
    timeout: Duration,
}

impl DohClient {
    pub fn new(
        endpoint: Url,
        dialer: Arc<Dialer>,
        hosts: Arc<HostsOverlay>,
        fragment_hello: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            dialer,
            hosts,
            fragment_hello,
            timeout,
        }
    }

    /// Resolve `name`, returning the matching addresses and the answer TTL
    /// (minimum over the returned records, at least one second).
    pub async fn resolve(&self, name: &str, qtype: QueryType) -> Result<(Vec<IpAddr>, Duration), ProxyError> {
        match tokio::time::timeout(self.timeout, self.query(name, qtype)).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(err)) => Err(ProxyError::ResolutionFailed {
                name: name.to_string(),
                source: err.into(),
            }),
            Err(_) => Err(ProxyError::resolution_failed(
                name,
                io::Error::new(io::ErrorKind::TimedOut, "doh query timed out"),
            )),
        }
    }

    async fn query(&self, name: &str, qtype: QueryType) -> anyhow::Result<(Vec<IpAddr>, Duration)> {
        let host = self.endpoint.host_str().context("doh endpoint has no host")?.to_string();
        let port = self.endpoint.port().unwrap_or(443);
        let addr = self.endpoint_addr(&host, port).await?;

        let stream = self.dialer.tls_dial(&host, addr, self.fragment_hello).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("doh http handshake")?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("doh connection closed: {err}");
            }
        });

        let mut path = self.endpoint.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        let uri = format!("{path}?name={name}&type={}", qtype.label());
        let request = Request::builder()
            .uri(uri)
            .header(HOST, host.as_str())
            .header(ACCEPT, "application/dns-json")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await.context("doh request")?;
        if !response.status().is_success() {
            bail!("doh endpoint answered {}", response.status());
        }
        let body = response.into_body().collect().await.context("doh body")?.to_bytes();
        parse_answers(&body, qtype, name)
    }

    /// The endpoint itself must resolve without DoH: literal IPs and hosts
    /// overrides first, the system resolver as the last resort.
    async fn endpoint_addr(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        if let HostLookup::Override(ip) = self.hosts.lookup(host) {
            return Ok(SocketAddr::new(ip, port));
        }
        lookup_host((host, port))
            .await
            .with_context(|| format!("system lookup of doh endpoint {host}"))?
            .next()
            .with_context(|| format!("doh endpoint {host} has no addresses"))
    }
}

fn parse_answers(body: &[u8], qtype: QueryType, name: &str) -> anyhow::Result<(Vec<IpAddr>, Duration)> {
    let parsed: DnsJsonResponse = serde_json::from_slice(body).context("doh json")?;
    if parsed.status != 0 {
        bail!("doh rcode {} for {name}", parsed.status);
    }

    let mut addrs = Vec::new();
    let mut min_ttl = u32::MAX;
    for answer in parsed.answer.iter().filter(|a| a.rr_type == qtype.record()) {
        match answer.data.parse::<IpAddr>() {
            Ok(ip) => {
                addrs.push(ip);
                min_ttl = min_ttl.min(answer.ttl);
            }
            Err(_) => debug!(data = %answer.data, "skipping unparsable rr data"),
        }
    }
    if addrs.is_empty() {
        bail!("no {} records for {name}", qtype.label());
    }
    Ok((addrs, Duration::from_secs(min_ttl.max(1) as u64)))
}
