//! `simple-tcp`: a simplified TCP, i.e. a reliable, ordered, flow-controlled byte
//! stream carried over unreliable UDP datagrams.
//!
//! # Architecture
//!
//! ```text
//!   Application          send / recv / flush / close
//!        │
//!  ┌─────▼───────────────────────────────────────────┐
//!  │  Connection                                     │
//!  │   ├── state machine (CLOSED … TIME_WAIT)        │
//!  │   ├── SendBuffer ── in flight, retransmission   │
//!  │   ├── RecvBuffer ── in-order delivery, window   │
//!  │   ├── RttEstimator / timer                      │
//!  │   └── receive loop task                         │
//!  └─────┬───────────────────────────────▲───────────┘
//!        │ Segment::encode               │ Segment::decode
//!  ┌─────▼───────────────────────────────┴───────────┐
//!  │  Socket (tokio UdpSocket + optional Simulator)  │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! Client side:
//!
//! ```ignore
//! let socket = Socket::bind("127.0.0.1:0".parse()?).await?;
//! let conn = Connection::connect(socket, server, Config::default()).await?;
//! conn.send(b"hello world").await?;
//! conn.close().await?;
//! ```
//!
//! Server side:
//!
//! ```ignore
//! let mut listener = Listener::bind("0.0.0.0:9000".parse()?, Config::default()).await?;
//! let conn = listener.accept().await?;
//! loop {
//!     let data = conn.recv(4096).await?;
//!     if data.is_empty() {
//!         break; // peer closed
//!     }
//! }
//! conn.close().await?;
//! ```
//!
//! Modules:
//! - [`segment`]      wire format, checksum, sequence arithmetic
//! - [`socket`]       async UDP datagram channel
//! - [`simulator`]    loss / corruption / duplication / delay injection
//! - [`state`]        connection states
//! - [`send_buffer`]  unacknowledged bytes, windowing, retransmit set
//! - [`recv_buffer`]  in-order reassembly and advertised window
//! - [`rtt`]          smoothed RTT and timeout interval
//! - [`timer`]        the single per-connection timer
//! - [`connection`]   state machine, receive loop, application API
//! - [`listener`]     passive open and per-peer demultiplexing
//! - [`config`], [`stats`], [`error`]

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod recv_buffer;
pub mod rtt;
pub mod segment;
pub mod send_buffer;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;

pub use config::Config;
pub use connection::Connection;
pub use error::{Error, Result};
pub use listener::Listener;
pub use simulator::FaultConfig;
pub use socket::Socket;
pub use state::ConnectionState;
pub use stats::Stats;
