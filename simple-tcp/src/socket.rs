//! Async UDP datagram channel.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` exposing the
//! only contract the transport relies on:
//! - [`Socket::send_to`]: fire one datagram at a destination,
//! - [`Socket::recv_from`]: wait for the next datagram and its source.
//!
//! Nothing here is reliable.  A socket built with [`Socket::bind_with_faults`]
//! routes every send through a [`Simulator`] that may drop, corrupt,
//! duplicate or delay it.  All protocol logic lives elsewhere.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::MAX_DATAGRAM;
use crate::simulator::{Fate, FaultConfig, Simulator};

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    faults: Option<Arc<Simulator>>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            faults: None,
        })
    }

    /// Bind a socket whose outbound datagrams pass through a fault model.
    pub async fn bind_with_faults(local_addr: SocketAddr, faults: FaultConfig) -> io::Result<Self> {
        let mut socket = Self::bind(local_addr).await?;
        socket.faults = Some(Arc::new(Simulator::new(faults)));
        Ok(socket)
    }

    /// The fault model, if any.
    pub fn simulator(&self) -> Option<&Simulator> {
        self.faults.as_deref()
    }

    /// Send `datagram` to `dest`.
    ///
    /// With a fault model attached, a dropped datagram still reports success
    /// and a delayed one is handed to a background task.
    pub async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        let Some(sim) = &self.faults else {
            self.inner.send_to(datagram, dest).await?;
            return Ok(());
        };

        match sim.judge(datagram) {
            Fate::Drop => Ok(()),
            Fate::Deliver { bytes, delays } => {
                for delay in delays {
                    if delay.is_zero() {
                        self.inner.send_to(&bytes, dest).await?;
                    } else {
                        let inner = Arc::clone(&self.inner);
                        let bytes = bytes.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = inner.send_to(&bytes, dest).await {
                                log::debug!("[sim] delayed send to {dest} failed: {e}");
                            }
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Receive the next datagram.
    ///
    /// Returns `(bytes, sender_address)`.  Cancel-safe.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }
}
