use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use pingtunnel::config::{ClientConfig, TunnelConfig, TunnelMode};
use pingtunnel::endpoint::client::Client;
use pingtunnel::endpoint::server::Server;
use pingtunnel_transport::config::StreamConfig;
use tracing::Level;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Relay local traffic through the tunnel
    Client {
        /// local address for application connections / datagrams
        #[clap(short, long)]
        listen: SocketAddr,

        /// the tunnel server's host name or IPv4 address
        #[clap(short, long)]
        server: String,

        /// where the server relays traffic to, as host:port
        #[clap(short, long)]
        target: String,

        /// seconds without traffic before a connection is closed
        #[clap(long, default_value_t = 60)]
        timeout: u64,

        #[clap(long, default_value_t = 0)]
        key: i32,

        /// relay TCP connections instead of UDP datagrams
        #[clap(long, default_value_t = false)]
        tcp: bool,

        #[clap(long, default_value_t = StreamConfig::DEFAULT_SEND_BUFFER_SIZE)]
        tcp_buffer_size: usize,

        #[clap(long, default_value_t = StreamConfig::DEFAULT_MAX_WINDOW)]
        tcp_max_window: u32,

        #[clap(long, default_value_t = 400)]
        tcp_resend_ms: u64,
    },
    /// Answer tunnel clients, relaying their traffic to its targets
    Server {
        /// seconds without traffic before a connection is closed
        #[clap(long, default_value_t = 60)]
        timeout: u64,

        #[clap(long, default_value_t = 0)]
        key: i32,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.command {
        Command::Client { listen, server, target, timeout, key, tcp, tcp_buffer_size, tcp_max_window, tcp_resend_ms } => {
            let mode = if tcp {
                TunnelMode::Stream(StreamConfig::new(tcp_buffer_size, tcp_max_window, Duration::from_millis(tcp_resend_ms)))
            }
            else {
                TunnelMode::Datagram
            };

            let config = ClientConfig {
                tunnel: TunnelConfig::new(Duration::from_secs(timeout), key),
                listen_addr: listen,
                server: resolve_ipv4(&server).await?,
                target,
                mode,
            };
            Client::bind(config).await?
                .run().await
        }
        Command::Server { timeout, key } => {
            Server::bind(TunnelConfig::new(Duration::from_secs(timeout), key)).await?
                .run().await
        }
    }
}

async fn resolve_ipv4(host: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = host.parse() {
        return Ok(addr);
    }

    tokio::net::lookup_host((host, 0)).await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("{} has no IPv4 address", host))
}
