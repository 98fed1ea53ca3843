use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::icmp::checksum::{internet_checksum, is_valid};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    EchoRequest = 8,
}

/// The header of an ICMP echo request or reply, without the checksum which is computed on
///  serialization and verified on deserialization.
///
/// ```ascii
/// 0: type (u8)
/// 1: code (u8) - always 0
/// 2: checksum (u16)
/// 4: identifier (u16)
/// 6: sequence number (u16)
/// 8: payload
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EchoHeader {
    pub icmp_type: IcmpType,
    /// distinguishes the pings of different processes on a host
    pub echo_id: u16,
    pub sequence: u16,
}

impl EchoHeader {
    pub const SERIALIZED_LEN: usize = 8;
    const CHECKSUM_OFFSET: usize = 2;

    /// Write a complete echo packet, i.e. this header followed by `payload`
    pub fn ser_packet(&self, payload: &[u8], buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(self.icmp_type.into());
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u16(self.echo_id);
        buf.put_u16(self.sequence);
        buf.put_slice(payload);

        let checksum = internet_checksum(&buf[start..]);
        let checksum_pos = start + Self::CHECKSUM_OFFSET;
        buf[checksum_pos..checksum_pos + 2].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parse an echo packet, returning its header and payload. Packets with a wrong checksum
    ///  and ICMP messages other than echo request / reply are rejected.
    pub fn deser_packet(packet: &[u8]) -> anyhow::Result<(EchoHeader, &[u8])> {
        if packet.len() < Self::SERIALIZED_LEN {
            bail!("ICMP packet too short: {} bytes", packet.len());
        }
        if !is_valid(packet) {
            bail!("ICMP checksum mismatch");
        }

        let icmp_type = IcmpType::try_from(packet[0])
            .map_err(|_| anyhow!("not an echo packet: ICMP type {}", packet[0]))?;
        if packet[1] != 0 {
            bail!("unexpected code {} for ICMP type {:?}", packet[1], icmp_type);
        }

        let header = EchoHeader {
            icmp_type,
            echo_id: u16::from_be_bytes([packet[4], packet[5]]),
            sequence: u16::from_be_bytes([packet[6], packet[7]]),
        };
        Ok((header, &packet[Self::SERIALIZED_LEN..]))
    }
}

/// Raw ICMP sockets on some platforms (notably Linux) deliver the IPv4 header along with the
///  ICMP message. An echo packet starts with type 0 or 8, so a leading IPv4 version nibble
///  identifies an IP header, which is skipped based on its IHL field.
pub fn strip_ip_header(packet: &[u8]) -> &[u8] {
    match packet.first() {
        Some(&first) if first >> 4 == 4 => {
            let header_len = usize::from(first & 0x0f) * 4;
            if header_len >= 20 && packet.len() >= header_len {
                &packet[header_len..]
            }
            else {
                packet
            }
        }
        _ => packet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn echo_packet(icmp_type: IcmpType, echo_id: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        EchoHeader { icmp_type, echo_id, sequence }.ser_packet(payload, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_ser_packet() {
        assert_eq!(
            echo_packet(IcmpType::EchoRequest, 1, 1, b""),
            vec![8, 0, 0xf7, 0xfd, 0, 1, 0, 1],
        );
    }

    #[rstest]
    #[case::request(IcmpType::EchoRequest, 0x1234, 7, b"abc")]
    #[case::reply(IcmpType::EchoReply, 0xffff, 0xffff, b"")]
    fn test_deser_packet(#[case] icmp_type: IcmpType, #[case] echo_id: u16, #[case] sequence: u16, #[case] payload: &[u8]) {
        let packet = echo_packet(icmp_type, echo_id, sequence, payload);
        let (header, actual_payload) = EchoHeader::deser_packet(&packet).unwrap();
        assert_eq!(header, EchoHeader { icmp_type, echo_id, sequence });
        assert_eq!(actual_payload, payload);
    }

    #[rstest]
    #[case::too_short(vec![8, 0, 0xf7, 0xfd, 0, 1, 0])]
    #[case::bad_checksum(vec![8, 0, 0xf7, 0xfe, 0, 1, 0, 1])]
    // destination unreachable with a valid checksum
    #[case::other_type(vec![3, 0, 0xfc, 0xfd, 0, 1, 0, 1])]
    #[case::nonzero_code(vec![8, 1, 0xf7, 0xfc, 0, 1, 0, 1])]
    fn test_deser_packet_invalid(#[case] packet: Vec<u8>) {
        assert!(EchoHeader::deser_packet(&packet).is_err());
    }

    #[rstest]
    #[case::no_ip_header(vec![8, 0, 1, 2], vec![8, 0, 1, 2])]
    #[case::minimal_ip_header([vec![0x45], vec![0; 19], vec![0, 0, 1, 2]].concat(), vec![0, 0, 1, 2])]
    #[case::ip_options([vec![0x46], vec![0; 23], vec![8, 0]].concat(), vec![8, 0])]
    #[case::truncated_ip_header(vec![0x45, 0, 0], vec![0x45, 0, 0])]
    #[case::empty(vec![], vec![])]
    fn test_strip_ip_header(#[case] packet: Vec<u8>, #[case] expected: Vec<u8>) {
        assert_eq!(strip_ip_header(&packet), expected.as_slice());
    }
}
