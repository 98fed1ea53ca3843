use std::sync::Arc;
use anyhow::{bail, Context};
use pingtunnel_transport::frame::Frame;
use pingtunnel_transport::frame_id::FrameId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};
use crate::channel::{spawn_receive_loop, IcmpChannel, IcmpSocket, InboundPacket, PacketFilter, RawSocket};
use crate::config::TunnelConfig;
use crate::endpoint::connection_table::{ConnectionRelay, ConnectionTable, LogicalConnection};
use crate::endpoint::datagram_relay::TargetDatagramRelay;
use crate::endpoint::stream_relay::StreamRelay;
use crate::endpoint::{housekeeping, notify_closed, ActivityStamp, ConnectionRoute, LocalEvent};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::icmp::echo::IcmpType;
use crate::stats::Throughput;

/// The server role: answers pings, and opens a connection to the target named by the first
///  envelope of every new connection id
pub struct Server {
    config: Arc<TunnelConfig>,
    socket: Arc<dyn RawSocket>,
}

impl Server {
    pub async fn bind(config: TunnelConfig) -> anyhow::Result<Server> {
        let socket = Arc::new(IcmpSocket::open()?);
        Self::with_socket(config, socket)
    }

    pub fn with_socket(config: TunnelConfig, socket: Arc<dyn RawSocket>) -> anyhow::Result<Server> {
        config.validate()?;
        Ok(Server {
            config: Arc::new(config),
            socket,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("server started");

        let throughput = Arc::new(Throughput::default());
        let channel = Arc::new(IcmpChannel::new(self.socket.clone(), IcmpType::EchoReply, throughput.clone()));

        let (inbound_send, mut inbound) = mpsc::channel(self.config.inbound_queue_size);
        spawn_receive_loop(self.socket.clone(), PacketFilter::server(self.config.key), inbound_send, throughput.clone());

        let (events_send, mut events) = mpsc::channel(self.config.inbound_queue_size);

        let mut housekeeping_ticks = time::interval_at(
            Instant::now() + self.config.housekeeping_interval,
            self.config.housekeeping_interval,
        );

        let mut server_loop = ServerLoop {
            config: self.config.clone(),
            channel,
            throughput,
            events: events_send,
            table: ConnectionTable::default(),
        };

        loop {
            select! {
                _ = housekeeping_ticks.tick() => {
                    housekeeping(&mut server_loop.table, &self.config, &server_loop.throughput);
                }
                packet = inbound.recv() => {
                    let Some(packet) = packet else {
                        bail!("ICMP receive loop terminated");
                    };
                    server_loop.on_packet(packet).await;
                }
                event = events.recv() => {
                    match event {
                        Some(LocalEvent::Closed { connection_id }) => {
                            debug!("connection {} terminated", connection_id);
                            server_loop.table.mark_closing(&connection_id);
                        }
                        Some(other) => {
                            warn!("unexpected event on the server: {:?}", other);
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

struct ServerLoop {
    config: Arc<TunnelConfig>,
    channel: Arc<IcmpChannel>,
    throughput: Arc<Throughput>,
    events: mpsc::Sender<LocalEvent>,
    table: ConnectionTable,
}

impl ServerLoop {
    async fn on_packet(&mut self, packet: InboundPacket) {
        match packet.envelope.kind {
            EnvelopeKind::Ping => {
                trace!("ping from {}", packet.from);
                let pong = Envelope::ping(self.config.key, true, packet.envelope.payload);
                if let Err(e) = self.channel.send(packet.from, packet.echo_id, &pong).await {
                    warn!("error answering ping from {}: {}", packet.from, e);
                }
            }
            EnvelopeKind::Data => {
                let connection_id = packet.envelope.connection_id.clone();
                if self.table.get_by_id(&connection_id).is_none() && !self.open_connection(&packet) {
                    return;
                }
                if let Some(connection) = self.table.get_by_id(&connection_id) {
                    connection.activity.touch();
                    connection.relay.deliver(&connection_id, packet.envelope.payload);
                }
            }
        }
    }

    /// Register a connection for an envelope with an unknown connection id, returning `false` if
    ///  the envelope does not open a connection
    fn open_connection(&mut self, packet: &InboundPacket) -> bool {
        let envelope = &packet.envelope;
        if envelope.target.is_empty() {
            debug!("dropping envelope for unknown connection {} without a target", envelope.connection_id);
            return false;
        }

        let route = ConnectionRoute {
            connection_id: envelope.connection_id.clone(),
            peer: packet.from,
            echo_id: packet.echo_id,
            key: self.config.key,
            response: true,
            target: String::new(),
            stream: None,
            channel: self.channel.clone(),
        };
        let activity = Arc::new(ActivityStamp::new());

        let relay = match &envelope.stream {
            Some(stream_config) => {
                if let Err(e) = self.config.validate_stream(stream_config) {
                    warn!("rejecting stream {} from {}: {}", envelope.connection_id, packet.from, e);
                    return false;
                }
                if !is_stream_opening(envelope) {
                    // a straggler of a stream that was already closed and removed
                    trace!("dropping frame for unknown stream {}", envelope.connection_id);
                    return false;
                }

                let (frames_send, frames_recv) = mpsc::channel(self.config.connection_queue_size);
                let relay = StreamRelay {
                    route,
                    config: Arc::new(stream_config.clone()),
                    update_interval: self.config.stream_update_interval,
                    activity: activity.clone(),
                    events: self.events.clone(),
                    announce: false,
                };
                tokio::spawn(connect_stream(relay, envelope.target.clone(), frames_recv));
                ConnectionRelay::Stream(frames_send)
            }
            None => {
                let (datagrams_send, datagrams_recv) = mpsc::channel(self.config.connection_queue_size);
                let relay = TargetDatagramRelay {
                    route,
                    target: envelope.target.clone(),
                    activity: activity.clone(),
                    events: self.events.clone(),
                };
                tokio::spawn(relay.run(datagrams_recv));
                ConnectionRelay::Datagram(datagrams_send)
            }
        };

        info!("new connection {} from {} to {}", envelope.connection_id, packet.from, envelope.target);
        let connection = LogicalConnection::new(envelope.connection_id.clone(), None, activity, relay);
        if let Err(e) = self.table.insert(connection) {
            warn!("error registering connection {}: {}", envelope.connection_id, e);
            return false;
        }
        true
    }
}

/// A stream is opened only by a frame that acknowledges nothing, i.e. one sent before the
///  client heard anything from the server for that stream
fn is_stream_opening(envelope: &Envelope) -> bool {
    let mut payload = envelope.payload.clone();
    match Frame::deser(&mut payload) {
        Ok(frame) => frame.ack == FrameId::ZERO,
        Err(_) => false,
    }
}

async fn connect_stream(relay: StreamRelay, target: String, frames: mpsc::Receiver<Frame>) {
    let connection_id = relay.route.connection_id.clone();
    let stream = TcpStream::connect(target.as_str()).await
        .with_context(|| format!("error connecting to {}", target));

    match stream {
        Ok(stream) => {
            debug!("stream {}: connected to {}", connection_id, target);
            relay.run(stream, frames).await;
        }
        Err(e) => {
            warn!("stream {}: {:#}", connection_id, e);
            notify_closed(&relay.events, connection_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;
    use bytes::{Bytes, BytesMut};
    use pingtunnel_transport::config::StreamConfig;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, UdpSocket};
    use crate::channel::MockRawSocket;
    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const CLIENT_ECHO_ID: u16 = 42;

    type SentPackets = Arc<Mutex<Vec<(Ipv4Addr, u16, Envelope)>>>;

    fn server_loop() -> (ServerLoop, SentPackets, mpsc::Receiver<LocalEvent>) {
        let sent: SentPackets = Default::default();
        let sent_clone = sent.clone();

        let mut socket = MockRawSocket::new();
        socket.expect_send_to()
            .returning(move |packet, to| {
                let (header, envelope) = Envelope::decode(packet).unwrap();
                assert_eq!(header.icmp_type, IcmpType::EchoReply);
                sent_clone.lock().unwrap().push((to, header.echo_id, envelope));
                Ok(())
            });

        let throughput = Arc::new(Throughput::default());
        let channel = Arc::new(IcmpChannel::new(Arc::new(socket), IcmpType::EchoReply, throughput.clone()));
        let (events_send, events_recv) = mpsc::channel(8);

        let server_loop = ServerLoop {
            config: Arc::new(TunnelConfig::default()),
            channel,
            throughput,
            events: events_send,
            table: ConnectionTable::default(),
        };
        (server_loop, sent, events_recv)
    }

    fn inbound(envelope: Envelope) -> InboundPacket {
        InboundPacket {
            from: CLIENT,
            echo_id: CLIENT_ECHO_ID,
            envelope,
        }
    }

    fn stream_packet(connection_id: &str, target: &str, frame: Frame) -> InboundPacket {
        let mut envelope = stream_envelope(frame);
        envelope.connection_id = connection_id.to_string();
        envelope.target = target.to_string();
        inbound(envelope)
    }

    /// register a stream connection whose relay is the returned receiver
    fn add_stream_connection(server_loop: &mut ServerLoop, connection_id: &str) -> mpsc::Receiver<Frame> {
        let (send, recv) = mpsc::channel(8);
        server_loop.table.insert(LogicalConnection::new(
            connection_id.to_string(),
            None,
            Arc::new(ActivityStamp::new()),
            ConnectionRelay::Stream(send),
        )).unwrap();
        recv
    }

    /// wait until the server sent at least `n` packets
    async fn wait_for_sent(sent: &SentPackets, n: usize) {
        time::timeout(Duration::from_secs(5), async {
            while sent.lock().unwrap().len() < n {
                time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (mut server_loop, sent, _events) = server_loop();

        server_loop.on_packet(inbound(Envelope::ping(0, false, Bytes::from_static(b"12345678")))).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (to, echo_id, pong) = &sent[0];
        assert_eq!(*to, CLIENT);
        assert_eq!(*echo_id, CLIENT_ECHO_ID);
        assert_eq!(pong.kind, EnvelopeKind::Ping);
        assert!(pong.response);
        assert_eq!(pong.payload, Bytes::from_static(b"12345678"));
        assert!(server_loop.table.is_empty());
    }

    #[tokio::test]
    async fn test_stream_straggler_is_dropped() {
        let (mut server_loop, sent, _events) = server_loop();
        let mut known = add_stream_connection(&mut server_loop, "known");

        let straggler = Frame::data(FrameId::from_raw(5), FrameId::from_raw(2), Bytes::from_static(b"late"));
        server_loop.on_packet(stream_packet("reaped", "127.0.0.1:1", straggler)).await;

        assert_eq!(server_loop.table.len(), 1);
        assert!(server_loop.table.get_by_id("reaped").is_none());
        assert!(known.try_recv().is_err());
        assert!(sent.lock().unwrap().is_empty());

        let frame = Frame::data(FrameId::from_raw(1), FrameId::from_raw(1), Bytes::from_static(b"abc"));
        server_loop.on_packet(stream_packet("known", "127.0.0.1:1", frame.clone())).await;
        assert_eq!(known.try_recv().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_unknown_connection_without_target_is_dropped() {
        let (mut server_loop, sent, _events) = server_loop();

        let mut packet = inbound(Envelope {
            kind: EnvelopeKind::Data,
            response: false,
            key: 0,
            connection_id: "c".to_string(),
            target: String::new(),
            stream: None,
            payload: Bytes::from_static(b"x"),
        });
        server_loop.on_packet(packet.clone()).await;
        assert!(server_loop.table.is_empty());

        packet.envelope.stream = Some(StreamConfig::default());
        server_loop.on_packet(packet).await;
        assert!(server_loop.table.is_empty());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[rstest]
    #[case::huge_window(StreamConfig { max_window: u32::MAX, ..StreamConfig::default() })]
    #[case::huge_buffer(StreamConfig { send_buffer_size: 1 << 40, ..StreamConfig::default() })]
    #[case::invalid(StreamConfig { max_window: 0, ..StreamConfig::default() })]
    #[tokio::test]
    async fn test_excessive_stream_parameters_are_rejected(#[case] stream_config: StreamConfig) {
        let (mut server_loop, _sent, _events) = server_loop();

        let mut packet = stream_packet("c", "127.0.0.1:1", Frame::ack(FrameId::ZERO));
        packet.envelope.stream = Some(stream_config);
        server_loop.on_packet(packet).await;

        assert!(server_loop.table.is_empty());
    }

    #[tokio::test]
    async fn test_stream_opening_connects_to_target() {
        let (mut server_loop, _sent, _events) = server_loop();
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap().to_string();

        let frame = Frame::data(FrameId::ZERO, FrameId::ZERO, Bytes::from_static(b"hello"));
        server_loop.on_packet(stream_packet("s", &target_addr, frame)).await;
        assert_eq!(server_loop.table.len(), 1);

        let (mut stream, _) = time::timeout(Duration::from_secs(5), target.accept()).await.unwrap().unwrap();
        let mut received = [0u8; 5];
        time::timeout(Duration::from_secs(5), stream.read_exact(&mut received)).await.unwrap().unwrap();
        assert_eq!(&received, b"hello");
    }

    #[tokio::test]
    async fn test_unreachable_stream_target_reports_closing() {
        let (mut server_loop, _sent, mut events) = server_loop();
        // bound but not listening, so connecting is refused
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target_addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        server_loop.on_packet(stream_packet("s", &target_addr, Frame::ack(FrameId::ZERO))).await;

        match time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(LocalEvent::Closed { connection_id }) => assert_eq!(connection_id, "s"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let (mut server_loop, sent, _events) = server_loop();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        server_loop.on_packet(inbound(Envelope {
            kind: EnvelopeKind::Data,
            response: false,
            key: 0,
            connection_id: "d".to_string(),
            target: target.local_addr().unwrap().to_string(),
            stream: None,
            payload: Bytes::from_static(b"hi"),
        })).await;
        assert_eq!(server_loop.table.len(), 1);

        let mut buf = [0u8; 16];
        let (n, relay_addr) = time::timeout(Duration::from_secs(5), target.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hi");

        target.send_to(b"ho", relay_addr).await.unwrap();
        wait_for_sent(&sent, 1).await;

        let sent = sent.lock().unwrap();
        let (to, echo_id, envelope) = &sent[0];
        assert_eq!(*to, CLIENT);
        assert_eq!(*echo_id, CLIENT_ECHO_ID);
        assert_eq!(envelope.kind, EnvelopeKind::Data);
        assert!(envelope.response);
        assert_eq!(envelope.connection_id, "d");
        assert_eq!(envelope.payload, Bytes::from_static(b"ho"));
    }

    fn stream_envelope(frame: Frame) -> Envelope {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        Envelope {
            kind: EnvelopeKind::Data,
            response: false,
            key: 0,
            connection_id: "c".to_string(),
            target: "127.0.0.1:80".to_string(),
            stream: Some(StreamConfig::new(4096, 16, Duration::from_millis(200))),
            payload: buf.freeze(),
        }
    }

    #[rstest]
    #[case::announcement(Frame::ack(FrameId::ZERO), true)]
    #[case::first_data(Frame::data(FrameId::ZERO, FrameId::ZERO, Bytes::from_static(b"x")), true)]
    #[case::immediate_fin(Frame::fin(FrameId::ZERO, FrameId::ZERO), true)]
    #[case::late_ack(Frame::ack(FrameId::from_raw(3)), false)]
    #[case::late_retransmit(Frame::data(FrameId::from_raw(5), FrameId::from_raw(2), Bytes::from_static(b"x")), false)]
    fn test_is_stream_opening(#[case] frame: Frame, #[case] expected: bool) {
        assert_eq!(is_stream_opening(&stream_envelope(frame)), expected);
    }

    #[test]
    fn test_is_stream_opening_garbage() {
        let mut envelope = stream_envelope(Frame::ack(FrameId::ZERO));
        envelope.payload = Bytes::from_static(&[0xff]);
        assert!(!is_stream_opening(&envelope));
    }
}
