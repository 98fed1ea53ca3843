use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use pingtunnel_transport::config::StreamConfig;
use crate::icmp::echo::EchoHeader;
use crate::util::buf::{BufExt, BufMutExt};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// payload of a logical connection
    Data = 0,
    /// liveness check carrying a timestamp, answered by the server and never delivered to an
    ///  application
    Ping = 1,
}

/// The logical message carried as the payload of a single ICMP echo packet.
///
/// Wire format (network byte order):
///
/// ```ascii
/// kind (u8)
/// flags (u8): bit 0 = response, bit 1 = stream parameters present
/// key (i32)
/// connection id (u16 length + UTF-8)
/// target (u16 length + UTF-8)
/// stream parameters, if flagged:
///    send buffer size (u64)
///    max window (u32)
///    resend timeout in millis (u32)
///    max frame data length (u32)
/// payload (remainder of the packet)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Set on everything the server sends. Each side drops envelopes of its own class, which
    ///  filters its own packets looped back by the kernel and the kernel's automatic echo
    ///  replies.
    pub response: bool,
    pub key: i32,
    /// non-empty for DATA, empty for PING
    pub connection_id: String,
    /// The address the server should connect to for this connection, sent by the client
    pub target: String,
    /// The client's stream parameters if the connection is a reliable byte stream (TCP mode),
    ///  `None` for datagrams
    pub stream: Option<StreamConfig>,
    pub payload: Bytes,
}

impl Envelope {
    const FLAG_RESPONSE: u8 = 1;
    const FLAG_STREAM: u8 = 2;

    pub fn ping(key: i32, response: bool, payload: Bytes) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Ping,
            response,
            key,
            connection_id: String::new(),
            target: String::new(),
            stream: None,
            payload,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.response {
            flags |= Self::FLAG_RESPONSE;
        }
        if self.stream.is_some() {
            flags |= Self::FLAG_STREAM;
        }

        buf.put_u8(self.kind.into());
        buf.put_u8(flags);
        buf.put_i32(self.key);
        buf.put_string(&self.connection_id);
        buf.put_string(&self.target);

        if let Some(stream) = &self.stream {
            buf.put_u64(stream.send_buffer_size as u64);
            buf.put_u32(stream.max_window);
            buf.put_u32(u32::try_from(stream.resend_timeout.as_millis()).unwrap_or(u32::MAX));
            buf.put_u32(u32::try_from(stream.max_frame_data_len).unwrap_or(u32::MAX));
        }

        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let kind = EnvelopeKind::try_from(buf.read_u8()?)?;
        let flags = buf.read_u8()?;
        let key = buf.read_i32()?;
        let connection_id = buf.read_string()?;
        let target = buf.read_string()?;

        if kind == EnvelopeKind::Data && connection_id.is_empty() {
            bail!("data envelope without a connection id");
        }

        let stream = if flags & Self::FLAG_STREAM != 0 {
            Some(StreamConfig {
                send_buffer_size: usize::try_from(buf.read_u64()?)?,
                max_window: buf.read_u32()?,
                resend_timeout: Duration::from_millis(buf.read_u32()?.into()),
                max_frame_data_len: usize::try_from(buf.read_u32()?)?,
            })
        }
        else {
            None
        };

        Ok(Envelope {
            kind,
            response: flags & Self::FLAG_RESPONSE != 0,
            key,
            connection_id,
            target,
            stream,
            payload: buf.copy_to_bytes(buf.remaining()),
        })
    }

    /// Serialize this envelope as the payload of a complete ICMP echo packet
    pub fn encode(&self, header: EchoHeader) -> Bytes {
        let mut body = BytesMut::new();
        self.ser(&mut body);

        let mut packet = BytesMut::with_capacity(EchoHeader::SERIALIZED_LEN + body.len());
        header.ser_packet(&body, &mut packet);
        packet.freeze()
    }

    /// Parse a complete ICMP echo packet (without IP header) into its header and envelope
    pub fn decode(packet: &[u8]) -> anyhow::Result<(EchoHeader, Envelope)> {
        let (header, mut body) = EchoHeader::deser_packet(packet)?;
        let envelope = Envelope::deser(&mut body)?;
        Ok((header, envelope))
    }
}

/// The payload of a PING: the send time in millis since the epoch
pub fn ping_timestamp(now: SystemTime) -> Bytes {
    let millis = now.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    Bytes::copy_from_slice(&millis.to_be_bytes())
}

/// The round trip time of a PING whose reply carries `payload`. A payload that is not a
///  timestamp, or a timestamp in the future, yields `None`.
pub fn ping_round_trip(mut payload: &[u8], now: SystemTime) -> Option<Duration> {
    if payload.len() != size_of::<u64>() {
        return None;
    }
    let sent = UNIX_EPOCH.checked_add(Duration::from_millis(payload.get_u64()))?;
    now.duration_since(sent).ok()
}
