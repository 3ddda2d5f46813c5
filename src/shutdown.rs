//! Signal-driven shutdown.
//!
//! A single handler is registered for SIGINT and SIGTERM. When it fires it
//! raises the shutdown flag, shuts down the upstream socket and any active
//! client socket so blocked reads return, and connects to the listener once
//! so a blocked `accept` wakes up and sees the flag.

use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Shared shutdown state between the signal handler and the acceptor.
#[derive(Debug)]
pub struct Shutdown {
    requested: AtomicBool,
    wake_addr: SocketAddr,
    upstream: Mutex<Option<TcpStream>>,
    client: Mutex<Option<TcpStream>>,
}

impl Shutdown {
    /// `wake_addr` is the listener's local address.
    pub fn new(wake_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            wake_addr,
            upstream: Mutex::new(None),
            client: Mutex::new(None),
        })
    }

    /// Install the process signal handler.
    pub fn install(self: &Arc<Self>) -> Result<(), ctrlc::Error> {
        let shutdown = Arc::clone(self);
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            shutdown.trigger();
        })
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown and unblock the acceptor.
    pub fn trigger(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }

        for slot in [&self.upstream, &self.client] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(stream) = guard.take() {
                    let _ = stream.shutdown(SocketShutdown::Both);
                }
            }
        }

        if let Err(e) = TcpStream::connect(self.wake_addr) {
            debug!(error = %e, "Wake-up connection failed");
        }
    }

    /// Track a clone of the upstream socket so a signal can close it.
    pub fn watch_upstream(&self, stream: &TcpStream) {
        Self::watch(&self.upstream, stream);
    }

    /// Track a clone of the active client socket for the session's lifetime.
    pub fn watch_client(&self, stream: &TcpStream) {
        Self::watch(&self.client, stream);
    }

    pub fn release_client(&self) {
        if let Ok(mut guard) = self.client.lock() {
            guard.take();
        }
    }

    fn watch(slot: &Mutex<Option<TcpStream>>, stream: &TcpStream) {
        match stream.try_clone() {
            Ok(clone) => {
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(clone);
                }
            }
            Err(e) => debug!(error = %e, "Could not clone socket for shutdown tracking"),
        }
    }
}
