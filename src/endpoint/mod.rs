//! The client and server roles of the tunnel.
//!
//! Each endpoint runs a main loop that exclusively owns its [connection_table::ConnectionTable].
//!  It consumes three inputs:
//!  * the inbound queue filled by the ICMP receive loop
//!  * [LocalEvent]s sent by tasks on the application side (accepted connections, datagrams,
//!    terminated connections)
//!  * the housekeeping ticker for reaping idle connections and reporting throughput
//!
//! Every connection has a task of its own that owns the connection's local socket (and, in TCP
//!  mode, its delivery manager). The main loop hands inbound payloads to that task through a
//!  bounded channel, and the task sends its envelopes directly through the shared
//!  [crate::channel::IcmpChannel]. Removing a connection from the table drops the channel's
//!  sender, which terminates the task.

pub mod client;
pub mod connection_table;
pub mod datagram_relay;
pub mod server;
pub mod stream_relay;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use pingtunnel_transport::config::StreamConfig;
use pingtunnel_transport::frame::Frame;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;
use crate::channel::IcmpChannel;
use crate::config::TunnelConfig;
use crate::endpoint::connection_table::ConnectionTable;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::stats::{Throughput, ThroughputSnapshot};

/// Events from the application side of an endpoint to its main loop
#[derive(Debug)]
pub enum LocalEvent {
    /// client, TCP mode: a new local connection
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// client, UDP mode: a datagram received on the local socket
    Datagram { from: SocketAddr, data: Bytes },
    /// a connection's task terminated
    Closed { connection_id: String },
}

/// The time of a connection's most recent traffic in either direction. It is touched by the
///  main loop for inbound envelopes and by the connection's task for local traffic.
#[derive(Debug)]
pub struct ActivityStamp {
    origin: Instant,
    millis_since_origin: AtomicU64,
}

impl ActivityStamp {
    pub fn new() -> ActivityStamp {
        ActivityStamp {
            origin: Instant::now(),
            millis_since_origin: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let millis = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.millis_since_origin.fetch_max(millis, Ordering::Relaxed);
    }

    pub fn idle_time(&self) -> Duration {
        let last_active = Duration::from_millis(self.millis_since_origin.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last_active)
    }
}

impl Default for ActivityStamp {
    fn default() -> Self {
        ActivityStamp::new()
    }
}

/// Everything needed to send envelopes for a single connection to the peer endpoint
#[derive(Clone)]
pub struct ConnectionRoute {
    pub connection_id: String,
    pub peer: Ipv4Addr,
    pub echo_id: u16,
    pub key: i32,
    pub response: bool,
    pub target: String,
    pub stream: Option<StreamConfig>,
    pub channel: Arc<IcmpChannel>,
}

impl ConnectionRoute {
    pub async fn send_data(&self, payload: Bytes) -> anyhow::Result<()> {
        let envelope = Envelope {
            kind: EnvelopeKind::Data,
            response: self.response,
            key: self.key,
            connection_id: self.connection_id.clone(),
            target: self.target.clone(),
            stream: self.stream.clone(),
            payload,
        };
        self.channel.send(self.peer, self.echo_id, &envelope).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(frame.serialized_len());
        frame.ser(&mut buf);
        self.send_data(buf.freeze()).await
    }
}

/// Reap inactive connections and report throughput, returning the throughput of the elapsed
///  interval
fn housekeeping(table: &mut ConnectionTable, config: &TunnelConfig, throughput: &Throughput) -> ThroughputSnapshot {
    for connection in table.remove_inactive(config.timeout) {
        match connection.local {
            Some(local) => info!("closing connection {} for {}", connection.connection_id, local),
            None => info!("closing connection {}", connection.connection_id),
        }
    }

    let snapshot = throughput.take();
    info!("{}, {} open connections", snapshot.per_second(config.housekeeping_interval), table.len());
    snapshot
}

/// Report the termination of a connection's task to the main loop
async fn notify_closed(events: &mpsc::Sender<LocalEvent>, connection_id: String) {
    // the main loop being gone means the endpoint is shutting down anyway
    let _ = events.send(LocalEvent::Closed { connection_id }).await;
}

#[cfg(test)]
mod tests {
    use tokio::time;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_activity_stamp() {
        let activity = ActivityStamp::new();
        assert_eq!(activity.idle_time(), Duration::ZERO);

        time::advance(Duration::from_secs(3)).await;
        assert_eq!(activity.idle_time(), Duration::from_secs(3));

        activity.touch();
        assert_eq!(activity.idle_time(), Duration::ZERO);

        time::advance(Duration::from_millis(1500)).await;
        assert_eq!(activity.idle_time(), Duration::from_millis(1500));
    }
}
