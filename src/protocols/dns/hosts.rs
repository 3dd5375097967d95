//! Hosts-file style overlay consulted before any network resolution.
//!
//! Rules are checked in insertion order, exact names before wildcards. A
//! `*.suffix` pattern matches by DNS-suffix semantics: `*.foo.bar` matches
//! `x.foo.bar` and `x.y.foo.bar` but never `foo.bar` itself.

use std::net::IpAddr;

use tracing::warn;

use crate::config::HostRule;

/// Outcome of an overlay lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLookup {
    /// No rule matched; continue with normal resolution.
    Miss,
    /// A rule matched but points back at the local machine, which means
    /// "resolve this name with the system resolver".
    System,
    /// A rule matched with a concrete address that overrides resolution.
    Override(IpAddr),
}

pub struct HostsOverlay {
    rules: Vec<HostRule>,
}

impl HostsOverlay {
    pub fn new(rules: Vec<HostRule>) -> Self {
        Self { rules }
    }

    pub fn lookup(&self, name: &str) -> HostLookup {
        let name = name.trim_end_matches('.').to_ascii_lowercase();

        for rule in &self.rules {
            if rule.pattern.eq_ignore_ascii_case(&name) {
                return self.materialize(rule);
            }
        }
        for rule in &self.rules {
            if Self::wildcard_matches(&rule.pattern, &name) {
                return self.materialize(rule);
            }
        }
        HostLookup::Miss
    }

    fn wildcard_matches(pattern: &str, name: &str) -> bool {
        let Some(suffix) = pattern.strip_prefix('*') else {
            return false;
        };
        // "*.foo.bar" keeps the leading dot, so bare "foo.bar" cannot match.
        suffix.starts_with('.') && name.len() > suffix.len() && name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
    }

    fn materialize(&self, rule: &HostRule) -> HostLookup {
        if rule.address == "127.0.0.1" || rule.address.eq_ignore_ascii_case("localhost") {
            return HostLookup::System;
        }
        match rule.address.parse::<IpAddr>() {
            Ok(ip) => HostLookup::Override(ip),
            Err(_) => {
                warn!(pattern = %rule.pattern, address = %rule.address, "hosts rule address is not an IP, ignoring rule");
                HostLookup::Miss
            }
        }
    }
}
