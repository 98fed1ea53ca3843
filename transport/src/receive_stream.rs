use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::config::StreamConfig;
use crate::frame::{Frame, FrameKind};
use crate::frame_id::FrameId;
use crate::safe_converter::SafeCast;

/// The receiving half of a reliable stream. Frames may arrive in any order and any number of
///  times; their payload is released to the application exactly once and in frame id order.
pub struct ReceiveStream {
    config: Arc<StreamConfig>,

    /// The id of the next frame to be delivered. All frames *before* it were delivered, so
    ///  this is the cumulative ack sent to the peer.
    next_expected: FrameId,

    /// Frames that arrived ahead of `next_expected`. All keys are in the range
    ///  `next_expected+1 .. next_expected+max_window`.
    reorder_buffer: BTreeMap<FrameId, Frame>,

    /// bytes that were delivered in sequence but not taken by the application yet
    received: BytesMut,

    fin_received: bool,

    /// set whenever a sequenced frame arrives, cleared when an ack went out
    ack_pending: bool,
}

impl ReceiveStream {
    pub fn new(config: Arc<StreamConfig>) -> ReceiveStream {
        ReceiveStream {
            config,
            next_expected: FrameId::ZERO,
            reorder_buffer: BTreeMap::default(),
            received: BytesMut::new(),
            fin_received: false,
            ack_pending: false,
        }
    }

    pub fn ack_threshold(&self) -> FrameId {
        self.next_expected
    }

    pub fn is_fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn num_buffered_frames(&self) -> usize {
        self.reorder_buffer.len()
    }

    pub fn has_received_data(&self) -> bool {
        !self.received.is_empty()
    }

    /// Take all bytes delivered in sequence so far
    pub fn take_received(&mut self) -> Bytes {
        self.received.split().freeze()
    }

    /// returns true if an ack needs to be sent, clearing the flag
    pub fn take_ack_pending(&mut self) -> bool {
        std::mem::take(&mut self.ack_pending)
    }

    pub fn on_frame(&mut self, frame: Frame) {
        if !frame.is_sequenced() {
            return;
        }

        // Even a duplicate requires an ack: the peer re-sending a frame means that it did not
        //  see our previous ack
        self.ack_pending = true;

        if frame.id < self.next_expected {
            trace!("frame {} was delivered before - discarding duplicate", frame.id);
            return;
        }
        if self.fin_received {
            debug!("frame {} after the peer's FIN - discarding", frame.id);
            return;
        }

        let max_window: u64 = self.config.max_window.safe_cast();
        if frame.id.distance_from(self.next_expected).unwrap_or(0) >= max_window {
            debug!("frame {} is outside the receive window starting at {} - discarding", frame.id, self.next_expected);
            return;
        }

        match self.reorder_buffer.entry(frame.id) {
            Entry::Occupied(_) => {
                trace!("frame {} is buffered already - discarding duplicate", frame.id);
                return;
            }
            Entry::Vacant(e) => {
                e.insert(frame);
            }
        }

        self.deliver_contiguous_prefix();
    }

    fn deliver_contiguous_prefix(&mut self) {
        while let Some(frame) = self.reorder_buffer.remove(&self.next_expected) {
            trace!("delivering frame {}", frame.id);
            self.next_expected += 1;

            match frame.kind {
                FrameKind::Data => {
                    self.received.extend_from_slice(&frame.data);
                }
                FrameKind::Fin => {
                    debug!("FIN received as frame {}", frame.id);
                    self.fin_received = true;
                }
                FrameKind::Ack => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;
    use rstest::rstest;

    fn receive_stream(max_window: u32) -> ReceiveStream {
        ReceiveStream::new(Arc::new(StreamConfig {
            send_buffer_size: 1000,
            max_window,
            resend_timeout: Duration::from_millis(100),
            max_frame_data_len: 10,
        }))
    }

    fn data_frame(id: u64) -> Frame {
        Frame::data(FrameId::from_raw(id), FrameId::ZERO, Bytes::from(vec![id as u8]))
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![0, 1, 2], 3, 0)]
    #[case::reversed(vec![2, 1, 0], vec![0, 1, 2], 3, 0)]
    #[case::gap(vec![0, 2, 3], vec![0], 1, 2)]
    #[case::gap_filled(vec![0, 2, 3, 1], vec![0, 1, 2, 3], 4, 0)]
    #[case::duplicates(vec![0, 0, 1, 0, 1], vec![0, 1], 2, 0)]
    #[case::duplicate_buffered(vec![1, 1, 0], vec![0, 1], 2, 0)]
    #[case::missing_first(vec![1, 2, 3], vec![], 0, 3)]
    #[case::outside_window(vec![4, 0], vec![0], 1, 0)]
    #[case::last_in_window(vec![3, 1, 2, 0], vec![0, 1, 2, 3], 4, 0)]
    fn test_on_frame(#[case] arrivals: Vec<u64>, #[case] expected_delivered: Vec<u8>, #[case] expected_ack: u64, #[case] expected_buffered: usize) {
        let mut receive_stream = receive_stream(4);
        for id in arrivals {
            receive_stream.on_frame(data_frame(id));
        }

        assert_eq!(receive_stream.take_received().as_ref(), expected_delivered.as_slice());
        assert_eq!(receive_stream.ack_threshold(), FrameId::from_raw(expected_ack));
        assert_eq!(receive_stream.num_buffered_frames(), expected_buffered);
    }

    #[test]
    fn test_take_received_drains() {
        let mut receive_stream = receive_stream(4);
        receive_stream.on_frame(data_frame(0));
        assert!(receive_stream.has_received_data());
        assert_eq!(receive_stream.take_received().as_ref(), &[0]);
        assert!(!receive_stream.has_received_data());
        assert!(receive_stream.take_received().is_empty());

        receive_stream.on_frame(data_frame(1));
        assert_eq!(receive_stream.take_received().as_ref(), &[1]);
    }

    #[test]
    fn test_fin_is_delivered_in_sequence() {
        let mut receive_stream = receive_stream(4);
        receive_stream.on_frame(Frame::fin(FrameId::from_raw(1), FrameId::ZERO));
        assert!(!receive_stream.is_fin_received());

        receive_stream.on_frame(data_frame(0));
        assert!(receive_stream.is_fin_received());
        assert_eq!(receive_stream.take_received().as_ref(), &[0]);
        assert_eq!(receive_stream.ack_threshold(), FrameId::from_raw(2));
    }

    #[test]
    fn test_ack_pending() {
        let mut receive_stream = receive_stream(4);
        assert!(!receive_stream.take_ack_pending());

        receive_stream.on_frame(Frame::ack(FrameId::from_raw(3)));
        assert!(!receive_stream.take_ack_pending());

        receive_stream.on_frame(data_frame(0));
        assert!(receive_stream.take_ack_pending());
        assert!(!receive_stream.take_ack_pending());

        // duplicates are acknowledged again
        receive_stream.on_frame(data_frame(0));
        assert!(receive_stream.take_ack_pending());
    }
}
