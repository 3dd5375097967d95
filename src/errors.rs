//! Error kinds surfaced by the proxy core.
//!
//! Startup errors ([`ProxyError::ConfigInvalid`], [`ProxyError::BindFailed`])
//! abort the process. Per-session errors close that session only and are
//! translated to a SOCKS5 reply code before the close. Tunnel errors never
//! reach a session that is not mid-transfer.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

use crate::protocols::socks5::reply;

/// Enumeration of the proxy's failure classes.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// The configuration file failed validation. Fatal at startup.
    ConfigInvalid(String),

    /// The listener socket could not be bound. Fatal at startup.
    BindFailed(io::Error),

    /// A hostname could not be resolved to an address.
    ResolutionFailed {
        name: String,
        source: Box<dyn Error + Send + Sync>,
    },

    /// The destination (or the worker relay) refused or timed out.
    ConnectFailed(io::Error),

    /// The client asked for a command this proxy does not implement.
    NotSupported(&'static str),

    /// I/O failure while relaying an established session.
    RelayIo(io::Error),

    /// I/O failure on the worker WebSocket link.
    TunnelIo(String),
}

impl ProxyError {
    /// SOCKS5 reply code matching this error, for failures that happen
    /// while the request is still being answered.
    pub fn socks_reply(&self) -> u8 {
        match self {
            Self::ResolutionFailed { .. } => reply::HOST_UNREACHABLE,
            Self::ConnectFailed(_) => reply::CONNECTION_REFUSED,
            Self::NotSupported(_) => reply::COMMAND_NOT_SUPPORTED,
            _ => reply::GENERAL_FAILURE,
        }
    }

    pub fn resolution_failed(name: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        Self::ResolutionFailed {
            name: name.into(),
            source: Box::new(source),
        }
    }
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigInvalid(reason) => write!(f, "invalid configuration: {reason}"),
            Self::BindFailed(err) => write!(f, "cannot bind listener: {err}"),
            Self::ResolutionFailed { name, .. } => write!(f, "resolution failed for {name}"),
            Self::ConnectFailed(err) => write!(f, "connect failed: {err}"),
            Self::NotSupported(what) => write!(f, "not supported: {what}"),
            Self::RelayIo(err) => write!(f, "relay i/o error: {err}"),
            Self::TunnelIo(reason) => write!(f, "tunnel i/o error: {reason}"),
        }
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BindFailed(err) | Self::ConnectFailed(err) | Self::RelayIo(err) => Some(err),
            Self::ResolutionFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
