//! One reliable, connection-oriented byte stream.
//!
//! # Architecture
//!
//! ```text
//!  Application tasks                       Receive loop (one task)
//!   send / recv / flush / close             select! { datagram, timer }
//!        │                                          │
//!        ▼                                          ▼
//!  ┌──────────────────────── Shared ───────────────────────────┐
//!  │  Mutex<Inner>                                              │
//!  │    ├── ConnectionState                                     │
//!  │    ├── SendBuffer   (SND.UNA / SND.NXT, in-flight queue)   │
//!  │    ├── RecvBuffer   (RCV.NXT, unread bytes, window)        │
//!  │    ├── RttEstimator                                        │
//!  │    ├── TimerHandle  (retransmit / persist / time-wait)     │
//!  │    └── outbox       (segments built under the lock)        │
//!  │  Notify             (wakes blocked application calls)      │
//!  │  tx_order           (keeps the outbox FIFO on the wire)    │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state change happens with the `Inner` lock held and never across an
//! `.await`.  Segments produced while the lock is held are pushed to the
//! outbox; the caller then drops the lock and calls
//! [`Shared::transmit_pending`], which drains the outbox in order.
//!
//! The receive loop is the only task that reads from the network and the only
//! one that reacts to timer expiry.  Application calls block on a
//! [`Notify`] and re-check their condition after every wake-up.

use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{Discard, Error, Result};
use crate::listener::ConnectionTable;
use crate::recv_buffer::{Delivery, RecvBuffer};
use crate::rtt::RttEstimator;
use crate::segment::{flags, seq_le, seq_lt, Header, Segment};
use crate::send_buffer::{SendBuffer, Transmit};
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::stats::{Counters, Stats};
use crate::timer::{self, TimerEvents, TimerHandle, TimerPurpose};

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// A handle to one connection.
///
/// Cheap to clone; every clone drives the same connection, so one task may
/// `recv` while another `send`s.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Active open: send a SYN from `socket` to `peer` and wait for the
    /// handshake to complete.
    ///
    /// The SYN is retransmitted on every retransmission timeout until
    /// [`Config::syn_retries`] is exhausted, at which point
    /// [`Error::ConnectionFailed`] is returned.
    pub async fn connect(socket: Socket, peer: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(socket);
        let (shared, events) = Shared::new(Arc::clone(&socket), peer, config, None);
        let conn = Self { shared };

        log::info!("[tcp] {} connecting to {peer}", socket.local_addr);
        conn.shared.lock().open_active(Instant::now());
        tokio::spawn(receive_loop(
            Arc::clone(&conn.shared),
            Inbound::Socket(socket),
            events,
        ));
        conn.shared.transmit_pending().await;

        conn.wait_for(|inner| match inner.state {
            ConnectionState::Closed => Some(Err(inner
                .error
                .clone()
                .unwrap_or(Error::ConnectionFailed))),
            s if s.is_synchronized() => Some(Ok(())),
            _ => None,
        })
        .await?;
        Ok(conn)
    }

    /// Passive open for a peer whose SYN the listener just received.
    ///
    /// Answers the SYN with a SYN+ACK and spawns the receive loop.  Once the
    /// handshake completes the connection is handed to `accept_tx`.
    pub(crate) async fn open_passive(
        socket: Arc<Socket>,
        peer: SocketAddr,
        config: Config,
        syn: Segment,
        accept_tx: mpsc::UnboundedSender<Connection>,
        inbound: mpsc::Receiver<Vec<u8>>,
        table: Arc<ConnectionTable>,
    ) {
        let (shared, events) = Shared::new(socket, peer, config, Some(accept_tx));
        {
            let mut inner = shared.lock();
            inner.set_state(ConnectionState::Listen);
            inner.on_segment(syn, Instant::now());
        }
        tokio::spawn(receive_loop(
            Arc::clone(&shared),
            Inbound::Demux { rx: inbound, table },
            events,
        ));
        shared.transmit_pending().await;
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Queue `data` for reliable, in-order delivery.
    ///
    /// Returns once the bytes are buffered, which may be before they are on
    /// the wire if the peer's window is closed.  Use [`flush`](Self::flush)
    /// to wait for acknowledgement.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        {
            let mut inner = self.shared.lock();
            if let Some(e) = &inner.error {
                return Err(e.clone());
            }
            if !inner.state.can_send() {
                return Err(Error::NotConnected { state: inner.state });
            }
            if data.is_empty() {
                return Ok(0);
            }
            inner.counters.started.get_or_insert_with(Instant::now);
            inner.counters.bytes_queued += data.len() as u64;
            inner.send.enqueue(data);
            inner.push_data(Instant::now());
        }
        self.shared.transmit_pending().await;
        Ok(data.len())
    }

    /// Read up to `max` bytes, waiting until at least one is available.
    ///
    /// Returns an empty vector at end of stream: the peer has closed and
    /// every byte it sent has been read.
    pub async fn recv(&self, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let out = self
            .wait_for(|inner| {
                if inner.recv.buffered() > 0 {
                    let data = inner.recv.read(max);
                    inner.counters.bytes_received += data.len() as u64;
                    if inner.recv.take_window_update() && inner.state != ConnectionState::Closed {
                        log::debug!("[tcp] window reopened to {}", inner.recv.window());
                        inner.queue_ack();
                    }
                    return Some(Ok(data));
                }
                if inner.recv.fin_received() {
                    return Some(Ok(Vec::new()));
                }
                if let Some(e) = &inner.error {
                    return Some(Err(e.clone()));
                }
                match inner.state {
                    ConnectionState::Closed
                    | ConnectionState::Listen
                    | ConnectionState::SynSent
                    | ConnectionState::SynReceived => {
                        Some(Err(Error::NotConnected { state: inner.state }))
                    }
                    _ => None,
                }
            })
            .await;
        self.shared.transmit_pending().await;
        out
    }

    /// Wait until every byte queued so far (and a queued FIN) has been
    /// acknowledged by the peer.
    pub async fn flush(&self) -> Result<()> {
        self.wait_for(|inner| {
            if let Some(e) = &inner.error {
                return Some(Err(e.clone()));
            }
            if inner.send.is_drained() {
                return Some(Ok(()));
            }
            if inner.state == ConnectionState::Closed {
                return Some(Err(Error::NotConnected { state: inner.state }));
            }
            None
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Graceful close of our direction of the stream.
    ///
    /// Queues a FIN behind any unsent data and waits until the peer has
    /// acknowledged it.  The peer may keep sending; keep calling
    /// [`recv`](Self::recv) until it returns end of stream.
    ///
    /// If the FIN is not acknowledged within [`Config::close_timeout`] the
    /// connection is forced to CLOSED.
    pub async fn close(&self) -> Result<()> {
        let close_timeout = {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Established => {
                    inner.send.queue_fin();
                    inner.set_state(ConnectionState::FinWait1);
                    inner.push_data(Instant::now());
                }
                ConnectionState::CloseWait => {
                    inner.send.queue_fin();
                    inner.set_state(ConnectionState::LastAck);
                    inner.push_data(Instant::now());
                }
                ConnectionState::Listen
                | ConnectionState::SynSent
                | ConnectionState::SynReceived => inner.enter_closed(),
                _ => {}
            }
            inner.config.close_timeout
        };
        self.shared.transmit_pending().await;
        self.shared.notify.notify_waiters();

        let done = timeout(
            close_timeout,
            self.wait_for(|inner| inner.state.local_close_complete().then_some(())),
        )
        .await;
        if done.is_err() {
            log::warn!("[tcp] FIN not acknowledged within {close_timeout:?}; forcing CLOSED");
            self.shared.lock().enter_closed();
            self.shared.notify.notify_waiters();
        }

        match self.shared.lock().error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Snapshot of counters and timing estimates.
    pub fn stats(&self) -> Stats {
        let inner = self.shared.lock();
        let c = &inner.counters;
        Stats {
            retransmissions: c.retransmissions,
            data_segments_sent: c.data_segments_sent,
            window_probes: c.window_probes,
            bytes_queued: c.bytes_queued,
            bytes_acked: c.bytes_acked,
            bytes_received: c.bytes_received,
            corrupt_discards: c.corrupt_discards,
            out_of_order_discards: c.out_of_order_discards,
            invalid_state_discards: c.invalid_state_discards,
            estimated_rtt: inner.rtt.estimated_rtt(),
            dev_rtt: inner.rtt.dev_rtt(),
            timeout_interval: inner.rtt.rto(),
            elapsed: c.started.map(|t| t.elapsed()).unwrap_or_default(),
            bytes_in_flight: inner.send.in_flight_bytes(),
            peer_window: inner.send.peer_window(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.lock().local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Our initial sequence number.
    pub fn initial_sequence(&self) -> u32 {
        self.shared.lock().iss
    }

    /// Tear down a connection that was never handed to the application.
    pub(crate) fn abort(&self) {
        self.shared.fail(Error::ConnectionReset);
    }

    /// Block until `check` yields a value.
    ///
    /// `check` runs with the lock held and must not block.
    async fn wait_for<T>(&self, mut check: impl FnMut(&mut Inner) -> Option<T>) -> T {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut inner = self.shared.lock();
                check(&mut inner)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    /// Held while draining the outbox so concurrent drains stay in order.
    tx_order: tokio::sync::Mutex<()>,
    peer: SocketAddr,
    /// Present on listener-spawned connections until they are handed out.
    accept_tx: Option<mpsc::UnboundedSender<Connection>>,
}

impl Shared {
    fn new(
        socket: Arc<Socket>,
        peer: SocketAddr,
        config: Config,
        accept_tx: Option<mpsc::UnboundedSender<Connection>>,
    ) -> (Arc<Self>, TimerEvents) {
        let (inner, events) = Inner::new(socket, peer, config);
        let shared = Arc::new(Self {
            inner: Mutex::new(inner),
            notify: Notify::new(),
            tx_order: tokio::sync::Mutex::new(()),
            peer,
            accept_tx,
        });
        (shared, events)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put every queued segment on the wire, oldest first.
    async fn transmit_pending(&self) {
        let _order = self.tx_order.lock().await;
        let (segments, socket) = {
            let mut inner = self.lock();
            (mem::take(&mut inner.outbox), inner.socket.clone())
        };
        let Some(socket) = socket else {
            return;
        };
        for segment in segments {
            if let Err(e) = socket.send_to(&segment.encode(), self.peer).await {
                log::error!("[tcp] send to {} failed: {e}", self.peer);
                self.lock().fail(e.into());
                self.notify.notify_waiters();
                return;
            }
        }
    }

    /// A listener child nobody can accept any more.
    fn orphaned(&self) -> bool {
        self.accept_tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    async fn on_datagram(self: &Arc<Self>, bytes: &[u8]) {
        if self.orphaned() && self.lock().state == ConnectionState::SynReceived {
            log::debug!("[tcp] listener gone; resetting {}", self.peer);
            self.fail(Error::ConnectionReset);
            return;
        }
        let established = {
            let mut inner = self.lock();
            let before = inner.state;
            match Segment::decode(bytes) {
                Ok(segment) => inner.on_segment(segment, Instant::now()),
                Err(e) => inner.discard(e.into()),
            }
            before == ConnectionState::SynReceived
                && inner.state.is_synchronized()
                && inner.state != ConnectionState::Closed
        };
        self.transmit_pending().await;

        if established {
            if let Some(tx) = &self.accept_tx {
                let conn = Connection {
                    shared: Arc::clone(self),
                };
                if tx.send(conn).is_err() {
                    log::debug!("[tcp] listener gone; resetting {}", self.peer);
                    self.lock().fail(Error::ConnectionReset);
                }
            }
        }
        self.notify.notify_waiters();
    }

    async fn on_timer(&self, generation: u64) {
        self.lock().on_timer(generation, Instant::now());
        self.transmit_pending().await;
        self.notify.notify_waiters();
    }

    fn fail(&self, err: Error) {
        self.lock().fail(err);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ConnectionState::Closed
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Where a connection's inbound datagrams come from.
enum Inbound {
    /// Client side: the connection owns the socket and reads it directly.
    Socket(Arc<Socket>),
    /// Server side: the listener reads the shared socket and forwards
    /// datagrams from this peer.
    Demux {
        rx: mpsc::Receiver<Vec<u8>>,
        table: Arc<ConnectionTable>,
    },
}

impl Inbound {
    /// Next datagram from `peer`, or `None` if the source is gone.
    async fn next(&mut self, peer: SocketAddr) -> Option<Result<Vec<u8>>> {
        match self {
            Inbound::Socket(socket) => loop {
                match socket.recv_from().await {
                    Ok((bytes, from)) if from == peer => return Some(Ok(bytes)),
                    Ok((_, from)) => log::trace!("[tcp] ignoring datagram from {from}"),
                    // ICMP unreachable surfacing on some platforms; the
                    // channel is allowed to lose datagrams.
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionReset
                                | std::io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        log::trace!("[tcp] transient receive error: {e}")
                    }
                    Err(e) => return Some(Err(e.into())),
                }
            },
            Inbound::Demux { rx, .. } => rx.recv().await.map(Ok),
        }
    }

    fn release(&self, peer: SocketAddr) {
        if let Inbound::Demux { table, .. } = self {
            table.remove(peer);
        }
    }
}

/// Drive one connection until it reaches CLOSED.
async fn receive_loop(shared: Arc<Shared>, mut inbound: Inbound, mut timer: TimerEvents) {
    let peer = shared.peer;
    log::debug!("[tcp] receive loop for {peer} started");

    while !shared.is_closed() {
        tokio::select! {
            datagram = inbound.next(peer) => match datagram {
                Some(Ok(bytes)) => shared.on_datagram(&bytes).await,
                Some(Err(e)) => {
                    log::error!("[tcp] receive from {peer} failed: {e}");
                    shared.fail(e);
                }
                None => shared.fail(Error::ConnectionReset),
            },
            fired = timer.expired() => match fired {
                Some(generation) => shared.on_timer(generation).await,
                None => break,
            },
        }
    }

    inbound.release(peer);
    shared.notify.notify_waiters();
    log::debug!("[tcp] receive loop for {peer} finished");
}

// ---------------------------------------------------------------------------
// Protocol state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    local_addr: SocketAddr,
    peer: SocketAddr,
    /// Dropped on entering CLOSED.
    socket: Option<Arc<Socket>>,
    iss: u32,
    /// Peer's initial sequence number, once its SYN has been seen.
    irs: Option<u32>,
    send: SendBuffer,
    recv: RecvBuffer,
    rtt: RttEstimator,
    timer: TimerHandle,
    /// Consecutive retransmission timeouts without forward progress.
    retries: u32,
    counters: Counters,
    /// First terminal error; reported to every later call.
    error: Option<Error>,
    outbox: Vec<Segment>,
    config: Config,
}

impl Inner {
    fn new(socket: Arc<Socket>, peer: SocketAddr, config: Config) -> (Self, TimerEvents) {
        let iss: u32 = rand::random();
        let (timer, events) = timer::timer();
        let inner = Self {
            state: ConnectionState::Closed,
            local_addr: socket.local_addr,
            peer,
            socket: Some(socket),
            iss,
            irs: None,
            send: SendBuffer::new(iss, config.mss, config.send_window, config.rtt_sampling),
            recv: RecvBuffer::new(0, config.recv_window),
            rtt: RttEstimator::new(&config),
            timer,
            retries: 0,
            counters: Counters::default(),
            error: None,
            outbox: Vec::new(),
            config,
        };
        (inner, events)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("[tcp] {} {} → {}", self.peer, self.state, next);
            self.state = next;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Build a segment for `tx` and push it to the outbox.
    ///
    /// Every segment but the active opener's SYN carries an ACK.
    fn queue(&mut self, tx: Transmit) {
        let ack = self.irs.is_some();
        let header = Header {
            src_port: self.local_addr.port(),
            dst_port: self.peer.port(),
            seq: tx.seq,
            ack: if ack { self.recv.ack_number() } else { 0 },
            flags: tx.control | if ack { flags::ACK } else { 0 },
            window: self.recv.advertise(),
            checksum: 0,
        };
        log::debug!(
            "[tcp] → {} seq={} ack={} len={} win={}",
            flags::names(header.flags),
            header.seq,
            header.ack,
            tx.payload.len(),
            header.window
        );
        self.outbox.push(Segment {
            header,
            payload: tx.payload,
        });
    }

    fn queue_ack(&mut self) {
        self.queue(Transmit {
            seq: self.send.next_seq(),
            control: 0,
            payload: Vec::new(),
        });
    }

    /// Send whatever the window allows, then settle the timer.
    fn push_data(&mut self, now: Instant) {
        if !self.state.is_synchronized() || self.state == ConnectionState::Closed {
            return;
        }
        for tx in self.send.try_send(now) {
            if !tx.payload.is_empty() {
                self.counters.data_segments_sent += 1;
            }
            self.queue(tx);
        }
        self.schedule_timer(false);
    }

    /// Arm the timer for whatever the send side is waiting on.
    ///
    /// `restart` re-arms a running retransmission timer, used when an ACK
    /// advanced the window and the oldest segment is now a newer one.
    fn schedule_timer(&mut self, restart: bool) {
        if matches!(
            self.state,
            ConnectionState::TimeWait | ConnectionState::Closed
        ) {
            return;
        }
        let purpose = self.timer.purpose();
        if self.send.has_in_flight() {
            if restart || purpose != Some(TimerPurpose::Retransmit) {
                self.timer.arm(self.rtt.rto(), TimerPurpose::Retransmit);
            }
        } else if self.send.window_probe().is_some() {
            if purpose != Some(TimerPurpose::Persist) {
                self.timer
                    .arm(self.config.persist_interval, TimerPurpose::Persist);
            }
        } else if purpose.is_some() {
            self.timer.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn open_active(&mut self, now: Instant) {
        let syn = self.send.syn(now);
        self.queue(syn);
        self.set_state(ConnectionState::SynSent);
        self.schedule_timer(true);
    }

    fn enter_time_wait(&mut self) {
        self.set_state(ConnectionState::TimeWait);
        self.timer
            .arm(self.config.time_wait, TimerPurpose::TimeWait);
    }

    fn enter_closed(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.timer.shutdown();
        self.socket = None;
    }

    fn fail(&mut self, err: Error) {
        if self.state == ConnectionState::Closed {
            return;
        }
        log::warn!("[tcp] {} failed: {err}", self.peer);
        self.error.get_or_insert(err);
        self.enter_closed();
    }

    fn discard(&mut self, reason: Discard) {
        match &reason {
            Discard::CorruptSegment(_) => self.counters.corrupt_discards += 1,
            Discard::OutOfOrderSegment { .. } => self.counters.out_of_order_discards += 1,
            Discard::InvalidStateTransition { .. } => self.counters.invalid_state_discards += 1,
            Discard::StaleAck { .. } => {
                log::trace!("[tcp] ← {reason}");
                return;
            }
        }
        log::debug!("[tcp] ← discard: {reason}");
    }

    fn reject(&mut self, header: &Header) {
        let state = self.state;
        self.discard(Discard::InvalidStateTransition {
            state,
            flags: header.flags,
        });
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn on_segment(&mut self, segment: Segment, now: Instant) {
        let h = &segment.header;
        log::debug!(
            "[tcp] ← {} seq={} ack={} len={} win={}",
            flags::names(h.flags),
            h.seq,
            h.ack,
            segment.payload.len(),
            h.window
        );
        if h.dst_port != self.local_addr.port() {
            return self.reject(h);
        }

        match self.state {
            ConnectionState::Closed => self.reject(h),
            ConnectionState::Listen => self.on_listen(segment, now),
            ConnectionState::SynSent => self.on_syn_sent(segment, now),
            ConnectionState::SynReceived => self.on_syn_received(segment, now),
            _ => self.on_synchronized(segment, now),
        }
    }

    fn on_listen(&mut self, segment: Segment, now: Instant) {
        let h = segment.header;
        if !h.has(flags::SYN) || h.has(flags::ACK) {
            return self.reject(&h);
        }
        self.irs = Some(h.seq);
        self.recv = RecvBuffer::new(h.seq.wrapping_add(1), self.config.recv_window);
        self.send.set_peer_window(h.window);

        let syn = self.send.syn(now);
        self.queue(syn);
        self.set_state(ConnectionState::SynReceived);
        self.schedule_timer(true);
    }

    fn on_syn_sent(&mut self, segment: Segment, now: Instant) {
        let h = segment.header;
        if !h.has(flags::SYN) || !h.has(flags::ACK) || h.ack != self.iss.wrapping_add(1) {
            return self.reject(&h);
        }
        self.irs = Some(h.seq);
        self.recv = RecvBuffer::new(h.seq.wrapping_add(1), self.config.recv_window);
        self.process_ack(h.ack, h.window, now);
        self.send.set_peer_window(h.window);
        self.set_state(ConnectionState::Established);
        self.queue_ack();
        self.push_data(now);
    }

    fn on_syn_received(&mut self, segment: Segment, now: Instant) {
        let h = segment.header.clone();
        if h.has(flags::SYN) && !h.has(flags::ACK) {
            if Some(h.seq) == self.irs {
                // Our SYN+ACK was lost; answer the retransmitted SYN at once.
                self.queue(Transmit {
                    seq: self.iss,
                    control: flags::SYN,
                    payload: Vec::new(),
                });
                return;
            }
            return self.reject(&h);
        }
        if h.has(flags::SYN) || !h.has(flags::ACK) || h.ack != self.iss.wrapping_add(1) {
            return self.reject(&h);
        }

        self.process_ack(h.ack, h.window, now);
        self.set_state(ConnectionState::Established);
        // The handshake ACK may have been lost and this is the first data
        // (or FIN) segment, which acknowledges our SYN just the same.
        if !segment.payload.is_empty() || h.has(flags::FIN) {
            self.on_synchronized(segment, now);
        }
    }

    fn on_synchronized(&mut self, segment: Segment, now: Instant) {
        let h = segment.header;
        if h.has(flags::SYN) {
            if h.has(flags::ACK) && Some(h.seq) == self.irs {
                // Peer missed our handshake ACK and resent its SYN+ACK.
                self.queue_ack();
            } else {
                self.reject(&h);
            }
            return;
        }
        if !h.has(flags::ACK) {
            return self.reject(&h);
        }

        self.process_ack(h.ack, h.window, now);
        if self.state == ConnectionState::Closed {
            return;
        }

        let mut reply = false;
        if !segment.payload.is_empty() {
            reply = true;
            let expected = self.recv.ack_number();
            match self.recv.on_segment(h.seq, &segment.payload) {
                Delivery::Accepted(n) => {
                    log::trace!("[tcp] accepted {n} bytes, rcv_nxt={}", self.recv.ack_number())
                }
                Delivery::Duplicate | Delivery::OutOfOrder => {
                    self.discard(Discard::OutOfOrderSegment {
                        seq: h.seq,
                        expected,
                    })
                }
                Delivery::NoRoom => {
                    log::debug!("[tcp] no room for {} bytes", segment.payload.len())
                }
            }
        } else if !h.has(flags::FIN) && seq_lt(h.seq, self.recv.ack_number()) {
            // Window probe or an old duplicate: tell the peer where we are.
            reply = true;
        }

        if h.has(flags::FIN) {
            reply = true;
            self.on_fin(h.seq.wrapping_add(segment.payload.len() as u32));
        }

        if reply {
            self.queue_ack();
        }
        self.push_data(now);
    }

    fn on_fin(&mut self, fin_seq: u32) {
        if self.recv.on_fin(fin_seq) {
            log::info!("[tcp] {} closed its side", self.peer);
            match self.state {
                ConnectionState::Established => self.set_state(ConnectionState::CloseWait),
                ConnectionState::FinWait1 => self.set_state(ConnectionState::Closing),
                ConnectionState::FinWait2 => self.enter_time_wait(),
                _ => {}
            }
        } else if self.recv.is_duplicate_fin(fin_seq) {
            // Our ACK of its FIN was lost.
            if self.state == ConnectionState::TimeWait {
                self.enter_time_wait();
            }
        } else {
            let expected = self.recv.ack_number();
            self.discard(Discard::OutOfOrderSegment {
                seq: fin_seq,
                expected,
            });
        }
    }

    fn process_ack(&mut self, ack: u32, window: u16, now: Instant) {
        let Some(progress) = self.send.on_ack(ack, now) else {
            let base = self.send.base();
            if seq_lt(ack, base) {
                self.discard(Discard::StaleAck { ack, base });
            }
            // An ACK beyond anything we sent carries no usable window.
            if seq_le(ack, self.send.next_seq()) {
                self.send.update_window(ack, window);
            }
            return;
        };

        self.retries = 0;
        self.counters.bytes_acked += progress.bytes as u64;
        if let Some(sample) = progress.rtt_sample {
            self.rtt.record_sample(sample);
            log::trace!(
                "[tcp] rtt sample={sample:?} est={:?} rto={:?}",
                self.rtt.estimated_rtt(),
                self.rtt.rto()
            );
        }
        self.send.update_window(ack, window);

        if progress.fin_acked {
            match self.state {
                ConnectionState::FinWait1 => self.set_state(ConnectionState::FinWait2),
                ConnectionState::Closing => self.enter_time_wait(),
                ConnectionState::LastAck => return self.enter_closed(),
                _ => {}
            }
        }
        self.schedule_timer(true);
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    fn on_timer(&mut self, generation: u64, now: Instant) {
        if !self.timer.is_current(generation) {
            return;
        }
        match self.timer.purpose() {
            Some(TimerPurpose::TimeWait) => self.enter_closed(),
            Some(TimerPurpose::Persist) => self.on_persist(),
            Some(TimerPurpose::Retransmit) => self.on_retransmit_timeout(now),
            None => {}
        }
    }

    fn on_persist(&mut self) {
        match self.send.window_probe() {
            Some(probe) => {
                self.counters.window_probes += 1;
                log::debug!("[tcp] peer window closed; probing");
                self.queue(probe);
                self.timer
                    .arm(self.config.persist_interval, TimerPurpose::Persist);
            }
            None => {
                self.timer.cancel();
                self.schedule_timer(false);
            }
        }
    }

    fn on_retransmit_timeout(&mut self, now: Instant) {
        self.retries += 1;
        let handshake = !self.state.is_synchronized();
        let limit = if handshake {
            Some(self.config.syn_retries)
        } else {
            self.config.max_retransmissions
        };
        if limit.is_some_and(|limit| self.retries > limit) {
            return self.fail(if handshake {
                Error::ConnectionFailed
            } else {
                Error::ConnectionTimedOut
            });
        }

        let resend = self.send.on_timeout(now);
        log::warn!(
            "[tcp] timeout (rto={:?}, attempt {}): resending {} segment(s) from seq={}",
            self.rtt.rto(),
            self.retries,
            resend.len(),
            self.send.base()
        );
        self.counters.retransmissions += resend.len() as u64;
        for tx in resend {
            self.queue(tx);
        }
        self.timer.arm(self.rtt.rto(), TimerPurpose::Retransmit);
    }
}
