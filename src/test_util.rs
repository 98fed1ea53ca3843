//! An in-memory stand-in for the network between ICMP endpoints, for testing clients and servers
//!  without raw socket privileges. It is part of the regular (non-#[cfg(test)]) code so that
//!  integration tests can use it.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;
use crate::channel::RawSocket;

type Inbox = mpsc::UnboundedSender<(Ipv4Addr, Bytes)>;

struct NetworkState {
    hosts: FxHashMap<Ipv4Addr, Inbox>,
    rng: StdRng,
    loss_rate: f64,
}

/// A network of hosts exchanging ICMP packets. Packets are delivered instantly and in order,
///  except for those that are dropped at the configured loss rate.
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    /// The seed makes packet loss reproducible
    pub fn new(seed: u64) -> Arc<MemoryNetwork> {
        Arc::new(MemoryNetwork {
            state: Mutex::new(NetworkState {
                hosts: FxHashMap::default(),
                rng: StdRng::seed_from_u64(seed),
                loss_rate: 0.0,
            }),
        })
    }

    /// The probability for each packet to be lost, between 0.0 and 1.0
    pub fn set_loss(&self, loss_rate: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.loss_rate = loss_rate;
        }
    }

    /// Attach a host to the network, returning its raw socket. Attaching an address a second
    ///  time detaches the previous socket.
    pub fn socket(self: &Arc<Self>, addr: Ipv4Addr) -> Arc<MemorySocket> {
        let (send, recv) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.hosts.insert(addr, send);
        }
        Arc::new(MemorySocket {
            network: self.clone(),
            addr,
            inbox: tokio::sync::Mutex::new(recv),
        })
    }

    fn deliver(&self, from: Ipv4Addr, to: Ipv4Addr, packet: Bytes) -> anyhow::Result<()> {
        let mut state = self.state.lock()
            .map_err(|_| anyhow!("memory network is poisoned"))?;

        let loss_rate = state.loss_rate;
        if loss_rate > 0.0 && state.rng.gen::<f64>() < loss_rate {
            trace!("losing packet from {} to {}", from, to);
            return Ok(());
        }

        match state.hosts.get(&to) {
            Some(inbox) => {
                // a detached host is like a host that is down
                let _ = inbox.send((from, packet));
            }
            None => trace!("no host at {}", to),
        }
        Ok(())
    }
}

/// A host's raw socket on a [MemoryNetwork]. Like a raw socket on Linux, it delivers
///  received ICMP packets with an IPv4 header in front.
pub struct MemorySocket {
    network: Arc<MemoryNetwork>,
    addr: Ipv4Addr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Ipv4Addr, Bytes)>>,
}

impl MemorySocket {
    fn with_ip_header(&self, from: Ipv4Addr, packet: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + packet.len());
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(u16::try_from(20 + packet.len()).unwrap_or(u16::MAX));
        buf.put_u32(0);
        buf.put_u8(64); // ttl
        buf.put_u8(1); // ICMP
        buf.put_u16(0);
        buf.put_slice(&from.octets());
        buf.put_slice(&self.addr.octets());
        buf.put_slice(packet);
        buf.freeze()
    }
}

#[async_trait]
impl RawSocket for MemorySocket {
    async fn send_to(&self, packet: &[u8], to: Ipv4Addr) -> anyhow::Result<()> {
        self.network.deliver(self.addr, to, Bytes::copy_from_slice(packet))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Ipv4Addr)> {
        let (from, packet) = self.inbox.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("socket {} was detached from the network", self.addr))?;

        let packet = self.with_ip_header(from, &packet);
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok((len, from))
    }
}

#[cfg(test)]
mod tests {
    use crate::icmp::echo::strip_ip_header;
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[tokio::test]
    async fn test_delivery() {
        let network = MemoryNetwork::new(1);
        let a = network.socket(A);
        let b = network.socket(B);

        a.send_to(b"abc", B).await.unwrap();
        a.send_to(b"xyz", Ipv4Addr::new(10, 0, 0, 99)).await.unwrap();

        let mut buf = [0u8; 100];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, A);
        assert_eq!(strip_ip_header(&buf[..len]), b"abc");
    }

    #[tokio::test]
    async fn test_total_loss() {
        let network = MemoryNetwork::new(1);
        let a = network.socket(A);
        let b = network.socket(B);

        network.set_loss(1.0);
        a.send_to(b"lost", B).await.unwrap();
        network.set_loss(0.0);
        a.send_to(b"kept", B).await.unwrap();

        let mut buf = [0u8; 100];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(strip_ip_header(&buf[..len]), b"kept");
    }
}
