//! UDP transport on top of tokio.
//!
//! Every datagram is framed as `[sender id: u64 LE] [payload]`. A background
//! task receives datagrams and invokes the subscribed handler; sends use
//! `try_send_to` so the synchronous [`Transport`] API never blocks the tick.
//! A datagram from an unknown sender registers that sender's address and
//! raises `PeerJoined` before the data itself.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ensemble_config::NetworkConfig;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::transport::{EventHandler, PeerId, Transport, TransportEvent};

/// Size of the sender-id prefix on every datagram.
pub const HEADER_LEN: usize = 8;

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Default)]
struct Shared {
    peers: Mutex<HashMap<PeerId, SocketAddr>>,
    handler: Mutex<Option<EventHandler>>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn learn(&self, peer: PeerId, addr: SocketAddr) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, addr)
            .is_none()
    }
}

/// A [`Transport`] over a single UDP socket.
pub struct UdpTransport {
    local_id: PeerId,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpTransport {
    /// Bind a socket and start the receive task. Must be called inside a
    /// tokio runtime.
    pub async fn bind(local_id: PeerId, addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(Self::recv_loop(
            local_id,
            Arc::clone(&socket),
            Arc::clone(&shared),
            shutdown_rx,
        ));
        tracing::info!(%local_id, %local_addr, "UDP transport bound");

        Ok(Arc::new(Self {
            local_id,
            local_addr,
            socket,
            shared,
            shutdown_tx,
        }))
    }

    /// Bind to the address and port from the network config.
    pub async fn bind_from_config(local_id: PeerId, config: &NetworkConfig) -> io::Result<Arc<Self>> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Self::bind(local_id, addr).await
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a peer's address. Raises `PeerJoined` if it was unknown.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.learn(peer, addr) {
            self.shared.emit(TransportEvent::PeerJoined(peer));
        }
    }

    /// Forget a peer. Raises `PeerLeft` if it was known.
    pub fn remove_peer(&self, peer: PeerId) {
        let removed = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
        if removed.is_some() {
            self.shared.emit(TransportEvent::PeerLeft(peer));
        }
    }

    fn frame(&self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + bytes.len());
        out.extend_from_slice(&self.local_id.0.to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    async fn recv_loop(
        local_id: PeerId,
        socket: Arc<UdpSocket>,
        shared: Arc<Shared>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => Self::handle_datagram(local_id, &shared, &buf[..n], from),
                        Err(e) => {
                            if shared.closed.load(Ordering::Acquire) {
                                break;
                            }
                            tracing::debug!("UDP receive error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(%local_id, "UDP receive loop stopped");
    }

    fn handle_datagram(local_id: PeerId, shared: &Shared, datagram: &[u8], from: SocketAddr) {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let Some((header, payload)) = datagram.split_first_chunk::<HEADER_LEN>() else {
            tracing::trace!(%from, len = datagram.len(), "runt datagram dropped");
            return;
        };
        let sender = PeerId(u64::from_le_bytes(*header));
        if !sender.is_valid() || sender == local_id {
            tracing::trace!(%from, %sender, "datagram with invalid sender dropped");
            return;
        }
        if shared.learn(sender, from) {
            shared.emit(TransportEvent::PeerJoined(sender));
        }
        shared.emit(TransportEvent::DataReceived(sender, payload.to_vec()));
    }
}

impl Transport for UdpTransport {
    fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn send(&self, peer: PeerId, bytes: &[u8]) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let addr = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .copied();
        let Some(addr) = addr else {
            return false;
        };
        match self.socket.try_send_to(&self.frame(bytes), addr) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(%peer, %addr, "UDP send failed: {e}");
                false
            }
        }
    }

    fn broadcast(&self, bytes: &[u8]) {
        let peers: Vec<PeerId> = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for peer in peers {
            self.send(peer, bytes);
        }
    }

    fn subscribe(&self, handler: EventHandler) {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn unsubscribe(&self) {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.unsubscribe();
        tracing::info!(local_id = %self.local_id, "UDP transport shut down");
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
