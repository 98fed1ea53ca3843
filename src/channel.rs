use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::icmp::echo::{strip_ip_header, EchoHeader, IcmpType};
use crate::stats::Throughput;

/// Maximum size of a raw packet including the IP header
const MAX_PACKET_SIZE: usize = 65536;

/// The raw packet I/O the tunnel needs from the operating system: sending and receiving
///  complete ICMP messages to / from IPv4 hosts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RawSocket: Send + Sync {
    async fn send_to(&self, packet: &[u8], to: Ipv4Addr) -> anyhow::Result<()>;

    /// Receive a single packet, returning its length and sender. The packet may or may not
    ///  start with an IPv4 header, depending on the platform.
    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Ipv4Addr)>;
}

/// A raw ICMPv4 socket. Opening it requires elevated privileges (root or CAP_NET_RAW on
///  Linux).
pub struct IcmpSocket {
    socket: UdpSocket,
}

impl IcmpSocket {
    pub fn open() -> anyhow::Result<IcmpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .context("error opening raw ICMP socket - this requires root privileges or CAP_NET_RAW")?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(IcmpSocket {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }
}

#[async_trait]
impl RawSocket for IcmpSocket {
    async fn send_to(&self, packet: &[u8], to: Ipv4Addr) -> anyhow::Result<()> {
        self.socket.send_to(packet, SocketAddr::new(IpAddr::V4(to), 0)).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Ipv4Addr)> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            match from.ip() {
                IpAddr::V4(addr) => return Ok((len, addr)),
                IpAddr::V6(addr) => trace!("ignoring packet from IPv6 address {}", addr),
            }
        }
    }
}

/// A received envelope that passed all filters
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundPacket {
    pub from: Ipv4Addr,
    pub echo_id: u16,
    pub envelope: Envelope,
}

/// Decides which packets on the shared raw socket are addressed to this endpoint. Everything
///  else is expected noise and dropped silently.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketFilter {
    pub icmp_type: IcmpType,
    pub key: i32,
    /// the expected value of the envelope's response flag
    pub response: bool,
    /// the echo id that identifies this process' packets, if any
    pub echo_id: Option<u16>,
}

impl PacketFilter {
    /// A client accepts only the server's echo replies that carry its own echo id
    pub fn client(key: i32, echo_id: u16) -> PacketFilter {
        PacketFilter {
            icmp_type: IcmpType::EchoReply,
            key,
            response: true,
            echo_id: Some(echo_id),
        }
    }

    /// A server accepts echo requests of any client
    pub fn server(key: i32) -> PacketFilter {
        PacketFilter {
            icmp_type: IcmpType::EchoRequest,
            key,
            response: false,
            echo_id: None,
        }
    }

    pub fn accepts(&self, header: &EchoHeader, envelope: &Envelope) -> bool {
        if header.icmp_type != self.icmp_type {
            trace!("dropping ICMP {:?}", header.icmp_type);
            return false;
        }
        if let Some(echo_id) = self.echo_id {
            if header.echo_id != echo_id {
                trace!("dropping packet for echo id {}", header.echo_id);
                return false;
            }
        }
        if envelope.key != self.key {
            debug!("dropping envelope with mismatched key");
            return false;
        }
        if envelope.response != self.response {
            trace!("dropping envelope with response flag {}", envelope.response);
            return false;
        }
        true
    }
}

/// The sending side of the ICMP channel. It is shared by all connections of an endpoint, and
///  every envelope goes out as a single self-contained packet.
pub struct IcmpChannel {
    socket: Arc<dyn RawSocket>,
    send_type: IcmpType,
    sequence: AtomicU16,
    throughput: Arc<Throughput>,
}

impl IcmpChannel {
    pub fn new(socket: Arc<dyn RawSocket>, send_type: IcmpType, throughput: Arc<Throughput>) -> IcmpChannel {
        IcmpChannel {
            socket,
            send_type,
            sequence: AtomicU16::new(0),
            throughput,
        }
    }

    pub async fn send(&self, to: Ipv4Addr, echo_id: u16, envelope: &Envelope) -> anyhow::Result<()> {
        //NB: fetch_add wraps around on overflow
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let packet = envelope.encode(EchoHeader {
            icmp_type: self.send_type,
            echo_id,
            sequence,
        });

        trace!("sending {:?} envelope to {} (echo id {}, seq {}, {} bytes)", envelope.kind, to, echo_id, sequence, packet.len());
        self.socket.send_to(&packet, to).await?;
        if envelope.kind == EnvelopeKind::Data {
            self.throughput.on_sent(envelope.payload.len());
        }
        Ok(())
    }
}

/// Read packets off the raw socket until it fails or the queue's receiver is gone, pushing
///  all packets that decode and pass the filter onto the queue. The loop never waits for the
///  queue: if it is full, the packet is dropped.
pub async fn run_receive_loop(
    socket: Arc<dyn RawSocket>,
    filter: PacketFilter,
    queue: mpsc::Sender<InboundPacket>,
    throughput: Arc<Throughput>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;

        let (header, envelope) = match Envelope::decode(strip_ip_header(&buf[..len])) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!("dropping undecodable packet from {}: {}", from, e);
                throughput.on_dropped();
                continue;
            }
        };

        if !filter.accepts(&header, &envelope) {
            continue;
        }
        if envelope.kind == EnvelopeKind::Data {
            throughput.on_received(envelope.payload.len());
        }

        let packet = InboundPacket {
            from,
            echo_id: header.echo_id,
            envelope,
        };
        match queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                debug!("inbound queue is full - dropping packet from {}", packet.from);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("inbound queue closed, terminating receive loop");
                return Ok(());
            }
        }
    }
}

/// Spawn [run_receive_loop] as a task, logging its termination
pub fn spawn_receive_loop(
    socket: Arc<dyn RawSocket>,
    filter: PacketFilter,
    queue: mpsc::Sender<InboundPacket>,
    throughput: Arc<Throughput>,
) {
    tokio::spawn(async move {
        if let Err(e) = run_receive_loop(socket, filter, queue, throughput).await {
            error!("ICMP receive loop terminated: {}", e);
        }
    });
}
