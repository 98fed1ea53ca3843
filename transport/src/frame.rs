use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::frame_id::FrameId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    /// a chunk of the byte stream
    Data = 0,
    /// end of stream: the sender will not send any more data, sequenced after the last data frame
    Fin = 1,
    /// acknowledgement only, without a frame id of its own
    Ack = 2,
}

/// A frame of the reliable stream protocol. Every frame carries the sender's cumulative ack,
///  i.e. the id *before* which all frames were received in sequence.
///
/// Wire format (network byte order):
///
/// ```ascii
///  0: kind (u8)
///  1: ack threshold (u64)
///  9: frame id (u64) - DATA and FIN only
/// 17: data (remainder of the buffer) - DATA only
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub ack: FrameId,
    /// meaningless for ACK frames, which always carry ZERO here
    pub id: FrameId,
    pub data: Bytes,
}

impl Frame {
    pub const HEADER_LEN_ACK: usize = 1 + size_of::<u64>();
    pub const HEADER_LEN_SEQUENCED: usize = Self::HEADER_LEN_ACK + size_of::<u64>();

    pub fn data(id: FrameId, ack: FrameId, data: Bytes) -> Frame {
        Frame { kind: FrameKind::Data, ack, id, data }
    }

    pub fn fin(id: FrameId, ack: FrameId) -> Frame {
        Frame { kind: FrameKind::Fin, ack, id, data: Bytes::new() }
    }

    pub fn ack(ack: FrameId) -> Frame {
        Frame { kind: FrameKind::Ack, ack, id: FrameId::ZERO, data: Bytes::new() }
    }

    pub fn is_sequenced(&self) -> bool {
        self.kind != FrameKind::Ack
    }

    pub fn serialized_len(&self) -> usize {
        if self.is_sequenced() {
            Self::HEADER_LEN_SEQUENCED + self.data.len()
        }
        else {
            Self::HEADER_LEN_ACK
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());
        buf.put_u64(self.ack.to_raw());
        if self.is_sequenced() {
            buf.put_u64(self.id.to_raw());
        }
        if self.kind == FrameKind::Data {
            buf.put_slice(&self.data);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        if buf.remaining() < Self::HEADER_LEN_ACK {
            bail!("frame too short for header: {} bytes", buf.remaining());
        }
        let kind = FrameKind::try_from(buf.get_u8())?;
        let ack = FrameId::from_raw(buf.get_u64());

        match kind {
            FrameKind::Ack => {
                Ok(Frame::ack(ack))
            }
            FrameKind::Data | FrameKind::Fin => {
                if buf.remaining() < size_of::<u64>() {
                    bail!("sequenced frame without a frame id");
                }
                let id = FrameId::from_raw(buf.get_u64());
                if kind == FrameKind::Fin {
                    return Ok(Frame::fin(id, ack));
                }
                let data = buf.copy_to_bytes(buf.remaining());
                Ok(Frame::data(id, ack, data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data(Frame::data(FrameId::from_raw(3), FrameId::from_raw(2), Bytes::from_static(b"abc")), vec![0, 0,0,0,0,0,0,0,2, 0,0,0,0,0,0,0,3, b'a',b'b',b'c'])]
    #[case::data_empty(Frame::data(FrameId::from_raw(1), FrameId::ZERO, Bytes::new()), vec![0, 0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,1])]
    #[case::fin(Frame::fin(FrameId::from_raw(9), FrameId::from_raw(258)), vec![1, 0,0,0,0,0,0,1,2, 0,0,0,0,0,0,0,9])]
    #[case::ack(Frame::ack(FrameId::from_raw(7)), vec![2, 0,0,0,0,0,0,0,7])]
    fn test_ser(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(frame.serialized_len(), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(Frame::deser(&mut b).unwrap(), frame);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![0, 0,0,0])]
    #[case::unknown_kind(vec![3, 0,0,0,0,0,0,0,0])]
    #[case::data_without_id(vec![0, 0,0,0,0,0,0,0,0, 1,2])]
    #[case::fin_without_id(vec![1, 0,0,0,0,0,0,0,0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(Frame::deser(&mut b).is_err());
    }
}
