use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn};
use crate::channel::{spawn_receive_loop, IcmpChannel, IcmpSocket, InboundPacket, PacketFilter, RawSocket};
use crate::config::{ClientConfig, TunnelMode};
use crate::endpoint::connection_table::{ConnectionRelay, ConnectionTable, LogicalConnection};
use crate::endpoint::datagram_relay::LocalDatagramRelay;
use crate::endpoint::stream_relay::StreamRelay;
use crate::endpoint::{housekeeping, ActivityStamp, ConnectionRoute, LocalEvent};
use crate::envelope::{ping_round_trip, ping_timestamp, Envelope, EnvelopeKind};
use crate::icmp::echo::IcmpType;
use crate::stats::Throughput;
use crate::util::unique_id::unique_id;

enum LocalListener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// The client role: accepts local application traffic and relays it through the tunnel to the
///  server, which forwards it to the configured target
pub struct Client {
    config: Arc<ClientConfig>,
    socket: Arc<dyn RawSocket>,
    listener: LocalListener,
    echo_id: u16,
}

impl Client {
    /// Open a raw ICMP socket and bind the local listener. Failures are fatal.
    pub async fn bind(config: ClientConfig) -> anyhow::Result<Client> {
        let socket = Arc::new(IcmpSocket::open()?);
        Self::bind_with_socket(config, socket).await
    }

    pub async fn bind_with_socket(config: ClientConfig, socket: Arc<dyn RawSocket>) -> anyhow::Result<Client> {
        config.validate()?;

        let listener = match &config.mode {
            TunnelMode::Stream(_) => LocalListener::Tcp(
                TcpListener::bind(config.listen_addr).await
                    .with_context(|| format!("error binding TCP listener to {}", config.listen_addr))?
            ),
            TunnelMode::Datagram => LocalListener::Udp(Arc::new(
                UdpSocket::bind(config.listen_addr).await
                    .with_context(|| format!("error binding UDP socket to {}", config.listen_addr))?
            )),
        };

        let echo_id = rand::random();
        info!("client with echo id {} relaying {} to {} through {}", echo_id, config.listen_addr, config.target, config.server);

        Ok(Client {
            config: Arc::new(config),
            socket,
            listener,
            echo_id,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = match &self.listener {
            LocalListener::Tcp(listener) => listener.local_addr()?,
            LocalListener::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    pub fn echo_id(&self) -> u16 {
        self.echo_id
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let tunnel_config = &self.config.tunnel;

        let throughput = Arc::new(Throughput::default());
        let channel = Arc::new(IcmpChannel::new(self.socket.clone(), IcmpType::EchoRequest, throughput.clone()));

        let (inbound_send, mut inbound) = mpsc::channel(tunnel_config.inbound_queue_size);
        spawn_receive_loop(self.socket.clone(), PacketFilter::client(tunnel_config.key, self.echo_id), inbound_send, throughput.clone());

        let (events_send, mut events) = mpsc::channel(tunnel_config.inbound_queue_size);
        let local_socket = match self.listener {
            LocalListener::Tcp(listener) => {
                tokio::spawn(run_tcp_acceptor(listener, events_send.clone()));
                None
            }
            LocalListener::Udp(socket) => {
                tokio::spawn(run_udp_acceptor(socket.clone(), events_send.clone()));
                Some(socket)
            }
        };

        let mut housekeeping_ticks = time::interval_at(
            Instant::now() + tunnel_config.housekeeping_interval,
            tunnel_config.housekeeping_interval,
        );

        let mut client_loop = ClientLoop {
            config: self.config.clone(),
            channel,
            throughput,
            events: events_send,
            local_socket,
            table: ConnectionTable::default(),
            echo_id: self.echo_id,
        };

        loop {
            select! {
                _ = housekeeping_ticks.tick() => {
                    client_loop.on_housekeeping().await;
                }
                packet = inbound.recv() => {
                    let Some(packet) = packet else {
                        bail!("ICMP receive loop terminated");
                    };
                    client_loop.on_packet(packet);
                }
                event = events.recv() => {
                    //NB: the loop holds a sender itself, so the channel is never closed
                    if let Some(event) = event {
                        client_loop.on_local_event(event).await;
                    }
                }
            }
        }
    }
}

async fn run_tcp_acceptor(listener: TcpListener, events: mpsc::Sender<LocalEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if events.send(LocalEvent::Accepted { stream, peer }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("error accepting local TCP connection: {}", e);
            }
        }
    }
}

async fn run_udp_acceptor(socket: Arc<UdpSocket>, events: mpsc::Sender<LocalEvent>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(LocalEvent::Datagram { from, data }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("error receiving from local UDP socket: {}", e);
            }
        }
    }
}

/// Log the round trip time of a pong, returning it
fn on_pong(from: Ipv4Addr, payload: &[u8], now: SystemTime) -> Option<Duration> {
    let rtt = ping_round_trip(payload, now);
    match rtt {
        Some(rtt) => info!("pong from {}: {:?}", from, rtt),
        None => debug!("dropping pong from {} with an invalid timestamp", from),
    }
    rtt
}

/// The state owned by the client's main loop
struct ClientLoop {
    config: Arc<ClientConfig>,
    channel: Arc<IcmpChannel>,
    throughput: Arc<Throughput>,
    events: mpsc::Sender<LocalEvent>,
    local_socket: Option<Arc<UdpSocket>>,
    table: ConnectionTable,
    echo_id: u16,
}

impl ClientLoop {
    fn route(&self, connection_id: String) -> ConnectionRoute {
        ConnectionRoute {
            connection_id,
            peer: self.config.server,
            echo_id: self.echo_id,
            key: self.config.tunnel.key,
            response: false,
            target: self.config.target.clone(),
            stream: match &self.config.mode {
                TunnelMode::Stream(stream_config) => Some(stream_config.clone()),
                TunnelMode::Datagram => None,
            },
            channel: self.channel.clone(),
        }
    }

    async fn on_housekeeping(&mut self) {
        let throughput = housekeeping(&mut self.table, &self.config.tunnel, &self.throughput);
        if throughput.sent_packets == 0 {
            self.ping().await;
        }
    }

    async fn ping(&self) {
        let envelope = Envelope::ping(self.config.tunnel.key, false, ping_timestamp(SystemTime::now()));
        debug!("ping {}", self.config.server);
        if let Err(e) = self.channel.send(self.config.server, self.echo_id, &envelope).await {
            warn!("error sending ping to {}: {}", self.config.server, e);
        }
    }

    fn on_packet(&mut self, packet: InboundPacket) {
        let envelope = packet.envelope;
        match envelope.kind {
            EnvelopeKind::Ping => {
                on_pong(packet.from, &envelope.payload, SystemTime::now());
            }
            EnvelopeKind::Data => {
                match self.table.get_by_id(&envelope.connection_id) {
                    Some(connection) => {
                        connection.activity.touch();
                        connection.relay.deliver(&envelope.connection_id, envelope.payload);
                    }
                    None => {
                        trace!("dropping envelope for unknown connection {}", envelope.connection_id);
                    }
                }
            }
        }
    }

    async fn on_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Accepted { stream, peer } => {
                self.on_accepted(stream, peer);
            }
            LocalEvent::Datagram { from, data } => {
                self.on_local_datagram(from, data).await;
            }
            LocalEvent::Closed { connection_id } => {
                debug!("connection {} terminated", connection_id);
                self.table.mark_closing(&connection_id);
            }
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        let TunnelMode::Stream(stream_config) = &self.config.mode else {
            error!("accepted TCP connection in UDP mode - dropping it");
            return;
        };

        // a previous connection from the same address was closed, but is not reaped yet
        if let Some(stale_id) = self.table.get_by_local(&peer).map(|c| c.connection_id.clone()) {
            self.table.remove(&stale_id);
        }

        let connection_id = unique_id();
        info!("new local TCP connection {} from {}", connection_id, peer);

        let (frames_send, frames_recv) = mpsc::channel(self.config.tunnel.connection_queue_size);
        let activity = Arc::new(ActivityStamp::new());
        let relay = StreamRelay {
            route: self.route(connection_id.clone()),
            config: Arc::new(stream_config.clone()),
            update_interval: self.config.tunnel.stream_update_interval,
            activity: activity.clone(),
            events: self.events.clone(),
            announce: true,
        };

        let connection = LogicalConnection::new(connection_id, Some(peer), activity, ConnectionRelay::Stream(frames_send));
        if let Err(e) = self.table.insert(connection) {
            error!("error registering connection from {}: {}", peer, e);
            return;
        }
        tokio::spawn(relay.run(stream, frames_recv));
    }

    async fn on_local_datagram(&mut self, from: SocketAddr, data: Bytes) {
        let Some(local_socket) = self.local_socket.clone() else {
            return;
        };

        let connection_id = match self.table.get_by_local(&from) {
            Some(connection) => {
                connection.activity.touch();
                connection.connection_id.clone()
            }
            None => {
                let connection_id = unique_id();
                info!("new local UDP peer {} as connection {}", from, connection_id);

                let (datagrams_send, datagrams_recv) = mpsc::channel(self.config.tunnel.connection_queue_size);
                let connection = LogicalConnection::new(connection_id.clone(), Some(from), Arc::new(ActivityStamp::new()), ConnectionRelay::Datagram(datagrams_send));
                if let Err(e) = self.table.insert(connection) {
                    error!("error registering connection from {}: {}", from, e);
                    return;
                }

                let relay = LocalDatagramRelay {
                    connection_id: connection_id.clone(),
                    socket: local_socket,
                    local: from,
                    events: self.events.clone(),
                };
                tokio::spawn(relay.run(datagrams_recv));
                connection_id
            }
        };

        trace!("datagram {}: {} bytes from {}", connection_id, data.len(), from);
        if let Err(e) = self.route(connection_id).send_data(data).await {
            debug!("error sending datagram from {} through the tunnel: {}", from, e);
        }
    }
}
