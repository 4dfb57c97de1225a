//! Entry point for `simple-tcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  The server accepts connections and counts what it reads; the client
//! sends a block of bytes and prints transfer statistics.  Both can inject
//! faults into their outbound datagrams.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use simple_tcp::segment::internet_checksum;
use simple_tcp::{Config, Connection, FaultConfig, Listener, Socket};

/// Reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and read until each peer closes.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        #[command(flatten)]
        net: NetArgs,
    },
    /// Connect, send data, close and print statistics.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Number of generated bytes to send.
        #[arg(long, default_value_t = 10 * 1024, conflicts_with = "file")]
        bytes: usize,
        /// Send the contents of this file instead of generated bytes.
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        net: NetArgs,
    },
}

#[derive(Args)]
struct NetArgs {
    /// Probability of dropping an outbound datagram.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Probability of flipping one bit of an outbound datagram.
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,
    /// Maximum extra delay per datagram, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
    /// Seed for the fault model.
    #[arg(long)]
    seed: Option<u64>,
    /// Receive buffer size advertised to the peer.
    #[arg(long, default_value_t = 4096)]
    window: usize,
    /// Maximum payload bytes per segment.
    #[arg(long, default_value_t = 1024)]
    mss: usize,
}

impl NetArgs {
    fn config(&self) -> Config {
        Config::default()
            .with_mss(self.mss)
            .with_recv_window(self.window)
    }

    fn faults(&self) -> anyhow::Result<Option<FaultConfig>> {
        for (name, p) in [("loss", self.loss), ("corrupt", self.corrupt)] {
            if !(0.0..=1.0).contains(&p) {
                bail!("--{name} must be between 0 and 1, got {p}");
            }
        }
        if self.loss == 0.0 && self.corrupt == 0.0 && self.delay_ms == 0 {
            return Ok(None);
        }
        let mut faults = FaultConfig {
            loss_rate: self.loss,
            corrupt_rate: self.corrupt,
            ..FaultConfig::default()
        };
        if self.delay_ms > 0 {
            faults = faults.with_delay(Duration::ZERO..=Duration::from_millis(self.delay_ms));
        }
        if let Some(seed) = self.seed {
            faults = faults.with_seed(seed);
        }
        Ok(Some(faults))
    }

    async fn bind(&self, addr: SocketAddr) -> anyhow::Result<Socket> {
        let socket = match self.faults()? {
            Some(faults) => Socket::bind_with_faults(addr, faults).await,
            None => Socket::bind(addr).await,
        };
        socket.with_context(|| format!("binding {addr}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { bind, net } => run_server(bind, net).await,
        Mode::Client {
            server,
            bytes,
            file,
            net,
        } => {
            let data = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => (0..bytes).map(|i| (i % 251) as u8).collect(),
            };
            run_client(server, data, net).await
        }
    }
}

async fn run_server(bind: SocketAddr, net: NetArgs) -> anyhow::Result<()> {
    let socket = net.bind(bind).await?;
    let mut listener = Listener::listen(socket, net.config())?;
    log::info!("Server listening on {}", listener.local_addr());

    loop {
        let conn = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = serve(conn).await {
                log::error!("connection failed: {e:#}");
            }
        });
    }
}

async fn serve(conn: Connection) -> anyhow::Result<()> {
    let peer = conn.peer_addr();
    let mut received = Vec::new();
    loop {
        let chunk = conn.recv(64 * 1024).await?;
        if chunk.is_empty() {
            break;
        }
        received.extend_from_slice(&chunk);
    }
    conn.close().await?;
    println!(
        "{peer}: received {} bytes, checksum {:#06x}",
        received.len(),
        internet_checksum(&received)
    );
    Ok(())
}

async fn run_client(server: SocketAddr, data: Vec<u8>, net: NetArgs) -> anyhow::Result<()> {
    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = net.bind(local).await?;
    let conn = Connection::connect(socket, server, net.config())
        .await
        .with_context(|| format!("connecting to {server}"))?;
    log::info!("Connected {} → {server}", conn.local_addr());

    conn.send(&data).await?;
    conn.flush().await?;
    let stats = conn.stats();
    conn.close().await?;

    println!("sent {} bytes, checksum {:#06x}", data.len(), internet_checksum(&data));
    println!("retransmissions:  {}", stats.retransmissions);
    println!("window probes:    {}", stats.window_probes);
    println!("estimated RTT:    {:?}", stats.estimated_rtt);
    println!("timeout interval: {:?}", stats.timeout_interval);
    println!("elapsed:          {:?}", stats.elapsed);
    println!("throughput:       {:.3} Mbit/s", stats.throughput_mbps());
    Ok(())
}
