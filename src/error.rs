//! Error classification for the proxy.
//!
//! Startup errors end the process. Connection and protocol errors are
//! scoped to the client connection that raised them.

use crate::config::ConfigError;
use crate::request::RequestError;
use std::io;
use thiserror::Error;

/// Which side of the relay an I/O error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Upstream,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Client => f.write_str("client"),
            Peer::Upstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to resolve upstream address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to upstream '{addr}': {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("{peer} I/O error: {source}")]
    Io {
        peer: Peer,
        #[source]
        source: io::Error,
    },

    #[error("upstream closed the connection")]
    UpstreamClosed,

    #[error("malformed request: {0}")]
    Protocol(#[from] RequestError),
}

impl ProxyError {
    pub fn client(source: io::Error) -> Self {
        ProxyError::Io {
            peer: Peer::Client,
            source,
        }
    }

    pub fn upstream(source: io::Error) -> Self {
        ProxyError::Io {
            peer: Peer::Upstream,
            source,
        }
    }

    /// True for errors that leave nothing to serve.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ProxyError::Config(_)
                | ProxyError::Resolve { .. }
                | ProxyError::Bind { .. }
                | ProxyError::Connect { .. }
                | ProxyError::Signal(_)
        )
    }

    /// True when the upstream handle can no longer be trusted.
    pub fn breaks_upstream(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamClosed
                | ProxyError::Io {
                    peer: Peer::Upstream,
                    ..
                }
        )
    }
}
