//! Acceptor for client connections.
//!
//! Binds a loopback listener with a backlog of one and serves clients
//! strictly one at a time over a single, long-lived upstream connection.
//! Connection and protocol errors close the affected client only; upstream
//! failures also drop the upstream handle, which is re-established before
//! the next client is served.

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::ProxyError;
use crate::relay::{CachePolicy, Relay};
use crate::shutdown::Shutdown;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{
    Ipv4Addr, Shutdown as SocketShutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use tracing::{debug, error, info, warn};

/// Pending connections allowed while a client is being served.
const LISTEN_BACKLOG: i32 = 1;

/// Proxy server instance
pub struct Server {
    config: Config,
    policy: CachePolicy,
    cache: ResponseCache,
    upstream_addrs: Vec<SocketAddr>,
    upstream: Option<TcpStream>,
}

impl Server {
    /// Create a new server instance, resolving the upstream address.
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        let upstream_addrs: Vec<SocketAddr> = config
            .upstream
            .to_socket_addrs()
            .map_err(|source| ProxyError::Resolve {
                addr: config.upstream.clone(),
                source,
            })?
            .collect();

        if upstream_addrs.is_empty() {
            return Err(ProxyError::Resolve {
                addr: config.upstream.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            });
        }

        Ok(Server {
            policy: CachePolicy::new(config.cache_prefix.clone(), config.cache_write),
            config,
            cache: ResponseCache::new(),
            upstream_addrs,
            upstream: None,
        })
    }

    /// Connect upstream, bind the listener, and serve until a shutdown signal.
    pub fn run(&mut self) -> Result<(), ProxyError> {
        self.ensure_upstream()?;

        let listener = bind_listener(self.config.port)?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            port: self.config.port,
            source,
        })?;

        let shutdown = Shutdown::new(local_addr);
        shutdown.install()?;

        info!(address = %local_addr, upstream = %self.config.upstream, "Proxy listening");
        self.serve(listener, &shutdown)
    }

    /// Accept and serve clients one at a time until shutdown is requested.
    pub fn serve(&mut self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), ProxyError> {
        if let Some(upstream) = &self.upstream {
            shutdown.watch_upstream(upstream);
        }

        loop {
            let accepted = listener.accept();
            if shutdown.is_requested() {
                break;
            }

            match accepted {
                Ok((stream, peer)) => self.handle_client(stream, peer, shutdown),
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }

        if let Some(upstream) = self.upstream.take() {
            let _ = upstream.shutdown(SocketShutdown::Both);
        }
        info!(
            cached_paths = self.cache.len(),
            hits = self.cache.stats().hits,
            misses = self.cache.stats().misses,
            stores = self.cache.stats().stores,
            "Proxy stopped"
        );
        Ok(())
    }

    /// Run one client through the relay and close it.
    fn handle_client(&mut self, mut client: TcpStream, peer: SocketAddr, shutdown: &Shutdown) {
        info!(peer = %peer, "Client connected");

        // Tracked before anything that can block, so a signal always reaches it.
        shutdown.watch_client(&client);
        if shutdown.is_requested() {
            debug!(peer = %peer, "Shutdown pending, closing client");
        } else {
            self.relay_client(&mut client, peer, shutdown);
        }
        shutdown.release_client();

        let _ = client.shutdown(SocketShutdown::Both);
    }

    fn relay_client(&mut self, client: &mut TcpStream, peer: SocketAddr, shutdown: &Shutdown) {
        if let Err(e) = client.set_read_timeout(self.config.read_timeout) {
            warn!(peer = %peer, error = %e, "Failed to set client read timeout");
        }

        if self.upstream.is_none() {
            match self.ensure_upstream() {
                Ok(upstream) => shutdown.watch_upstream(upstream),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Upstream unavailable, closing client");
                    return;
                }
            }
        }
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };

        match Relay::new(client, upstream, &mut self.cache, &self.policy).run() {
            Ok(summary) => info!(
                peer = %peer,
                requests = summary.requests,
                cache_hits = summary.cache_hits,
                forwarded = summary.forwarded,
                cached_paths = self.cache.len(),
                "Client disconnected"
            ),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Closing client connection");
                if e.breaks_upstream() {
                    warn!("Dropping upstream connection, will reconnect");
                    self.upstream = None;
                }
            }
        }
    }

    /// Return the upstream connection, connecting if there is none.
    fn ensure_upstream(&mut self) -> Result<&TcpStream, ProxyError> {
        if self.upstream.is_none() {
            let stream = connect_upstream(&self.upstream_addrs).map_err(|source| {
                ProxyError::Connect {
                    addr: self.config.upstream.clone(),
                    source,
                }
            })?;
            stream
                .set_read_timeout(self.config.read_timeout)
                .map_err(ProxyError::upstream)?;
            info!(upstream = %self.config.upstream, "Connected to upstream");
            self.upstream = Some(stream);
        }

        self.upstream
            .as_ref()
            .ok_or(ProxyError::UpstreamClosed)
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }
}

/// Bind a blocking loopback listener with a minimal backlog.
pub fn bind_listener(port: u16) -> Result<TcpListener, ProxyError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let bind = || -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    };
    bind().map_err(|source| ProxyError::Bind { port, source })
}

/// Connect to the first reachable upstream address.
fn connect_upstream(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no upstream addresses");

    for addr in addrs {
        let attempt = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| {
                socket.set_nodelay(true)?;
                socket.connect(&(*addr).into())?;
                Ok(socket)
            });

        match attempt {
            Ok(socket) => return Ok(socket.into()),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Upstream connect attempt failed");
                last_err = e;
            }
        }
    }

    Err(last_err)
}
