//! Passive open: a socket in LISTEN that accepts many peers.
//!
//! One UDP socket serves every accepted connection.  A background demux task
//! owns the read side of that socket and routes each datagram by source
//! address:
//!
//! ```text
//!                 ┌──────────── demux task ────────────┐
//!  UDP socket ──▶ │ table[peer]? ──yes──▶ mpsc → child │──▶ receive loop
//!                 │      │                             │
//!                 │      no ── SYN? ──▶ spawn child    │
//!                 │             └─ otherwise discard   │
//!                 └────────────────────────────────────┘
//! ```
//!
//! A child is handed to [`Listener::accept`] once its handshake completes.
//! Dropping the listener stops new handshakes and resets every child that was
//! never accepted.  Accepted children keep being routed to until the last one
//! has closed; only then is the socket released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::segment::{flags, Segment};
use crate::socket::Socket;

/// Datagrams a child may have queued before further ones are dropped.
const CHILD_QUEUE: usize = 256;

/// Pause after a hard receive error before reading the socket again.
const RECV_BACKOFF: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Connection table
// ---------------------------------------------------------------------------

/// Peer address → inbound queue of the connection serving it.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    routes: Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    emptied: Notify,
}

impl ConnectionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, peer: SocketAddr, tx: mpsc::Sender<Vec<u8>>) {
        self.lock().insert(peer, tx);
    }

    fn route(&self, peer: SocketAddr) -> Option<mpsc::Sender<Vec<u8>>> {
        self.lock().get(&peer).cloned()
    }

    /// Called by a child's receive loop once it reaches CLOSED.
    pub(crate) fn remove(&self, peer: SocketAddr) {
        let mut routes = self.lock();
        routes.remove(&peer);
        if routes.is_empty() {
            self.emptied.notify_one();
        }
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A bound socket accepting inbound connections.
pub struct Listener {
    local_addr: SocketAddr,
    accept_rx: mpsc::UnboundedReceiver<Connection>,
}

impl Listener {
    /// Bind `addr` and start listening.
    pub async fn bind(addr: SocketAddr, config: Config) -> Result<Self> {
        let socket = Socket::bind(addr).await?;
        Self::listen(socket, config)
    }

    /// Listen on an already bound socket, e.g. one carrying a fault model.
    pub fn listen(socket: Socket, config: Config) -> Result<Self> {
        config.validate()?;
        let local_addr = socket.local_addr;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        log::info!("[tcp] listening on {local_addr}");
        tokio::spawn(demux(Arc::new(socket), config, accept_tx));
        Ok(Self {
            local_addr,
            accept_rx,
        })
    }

    /// Wait for the next peer to complete the handshake.
    pub async fn accept(&mut self) -> Result<Connection> {
        let conn = self.accept_rx.recv().await.ok_or(Error::ConnectionReset)?;
        log::info!("[tcp] accepted {}", conn.peer_addr());
        Ok(conn)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Closing first makes any later handoff fail, so the child resets
        // itself instead of landing in a queue nobody reads.
        self.accept_rx.close();
        while let Ok(conn) = self.accept_rx.try_recv() {
            log::debug!("[tcp] listener dropped; resetting unaccepted {}", conn.peer_addr());
            conn.abort();
        }
    }
}

/// Route datagrams from the shared socket to per-peer connections.
async fn demux(
    socket: Arc<Socket>,
    config: Config,
    accept_tx: mpsc::UnboundedSender<Connection>,
) {
    let table = Arc::new(ConnectionTable::default());
    let mut listener_gone = false;

    loop {
        if listener_gone && table.is_empty() {
            break;
        }
        tokio::select! {
            received = socket.recv_from() => {
                let (bytes, from) = match received {
                    Ok(d) => d,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionReset
                                | std::io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        log::trace!("[tcp] transient listener receive error: {e}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("[tcp] listener receive on {} failed: {e}", socket.local_addr);
                        tokio::time::sleep(RECV_BACKOFF).await;
                        continue;
                    }
                };
                if let Some(tx) = table.route(from) {
                    if tx.try_send(bytes).is_err() {
                        log::debug!("[tcp] queue for {from} full or closed; dropping datagram");
                    }
                    continue;
                }
                if listener_gone {
                    continue;
                }

                let syn = match Segment::decode(&bytes) {
                    Ok(segment) => segment,
                    Err(e) => {
                        log::debug!("[tcp] ← discard from {from}: {e}");
                        continue;
                    }
                };
                if !syn.header.has(flags::SYN) || syn.header.has(flags::ACK) {
                    log::debug!(
                        "[tcp] ← discard {} from unknown peer {from}",
                        flags::names(syn.header.flags)
                    );
                    continue;
                }

                log::debug!("[tcp] ← SYN from {from}");
                let (tx, rx) = mpsc::channel(CHILD_QUEUE);
                table.insert(from, tx);
                Connection::open_passive(
                    Arc::clone(&socket),
                    from,
                    config.clone(),
                    syn,
                    accept_tx.clone(),
                    rx,
                    Arc::clone(&table),
                )
                .await;
            }
            _ = accept_tx.closed(), if !listener_gone => {
                log::debug!("[tcp] listener on {} dropped", socket.local_addr);
                listener_gone = true;
            }
            _ = table.emptied.notified(), if listener_gone => {}
        }
    }
    log::debug!("[tcp] demux on {} finished", socket.local_addr);
}
