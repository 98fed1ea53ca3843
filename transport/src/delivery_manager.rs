use std::sync::Arc;
use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::config::StreamConfig;
use crate::frame::Frame;
use crate::receive_stream::ReceiveStream;
use crate::send_stream::{SendBufferFull, SendStream};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamState {
    /// regular operation, including a stream whose peer already sent FIN
    Active,
    /// the local side requested FIN, pending data and the FIN itself are still being delivered
    Closing,
    /// both FINs are through, nothing more will be sent or delivered - only acks for re-sent
    ///  frames of the peer
    Closed,
}

/// Ordered, lossless and flow-controlled delivery of a byte stream over an unreliable,
///  unordered channel. There is one instance per stream on either side.
///
/// The manager does no I/O and has no timers of its own. The owner feeds it
///  * application bytes via [DeliveryManager::write],
///  * frames received from the peer via [DeliveryManager::on_frame],
///  * the passage of time via [DeliveryManager::update], which returns the frames to send,
///
/// and takes bytes for the application via [DeliveryManager::take_received].
pub struct DeliveryManager {
    send_stream: SendStream,
    receive_stream: ReceiveStream,
    state: StreamState,
}

impl DeliveryManager {
    pub fn new(config: Arc<StreamConfig>) -> DeliveryManager {
        DeliveryManager {
            send_stream: SendStream::new(config.clone()),
            receive_stream: ReceiveStream::new(config),
            state: StreamState::Active,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn send_buffer_left(&self) -> usize {
        if self.state == StreamState::Active {
            self.send_stream.send_buffer_left()
        }
        else {
            0
        }
    }

    /// Append application bytes to the send buffer. The write is rejected as a whole if it does
    ///  not fit, and after [DeliveryManager::close] was called.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SendBufferFull> {
        self.send_stream.write(data)
    }

    /// The local side finished writing: FIN is sent after all buffered data
    pub fn close(&mut self) {
        if self.state == StreamState::Active {
            debug!("closing stream");
            self.send_stream.request_fin();
            self.state = StreamState::Closing;
        }
    }

    /// true once the peer's FIN was delivered, i.e. the peer will not send any more data
    pub fn is_remote_closed(&self) -> bool {
        self.receive_stream.is_fin_received()
    }

    /// NB: A closed stream still processes frames so that the peer's re-sent FIN is
    ///      acknowledged again if our previous ack got lost
    pub fn on_frame(&mut self, frame: Frame) {
        trace!("received {:?} frame {} with ack {}", frame.kind, frame.id, frame.ack);
        self.send_stream.on_ack(frame.ack);
        self.receive_stream.on_frame(frame);
        self.update_state();
    }

    pub fn has_received_data(&self) -> bool {
        self.receive_stream.has_received_data()
    }

    pub fn take_received(&mut self) -> Bytes {
        self.receive_stream.take_received()
    }

    /// Advance the manager to `now`, returning the frames that are due for sending: new data
    ///  frames while the window permits, re-sends for timed out frames, and a single ACK frame
    ///  if frames were received but no other frame carries the ack.
    pub fn update(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();

        let ack = self.receive_stream.ack_threshold();
        self.send_stream.poll_frames(now, ack, &mut frames);

        let ack_pending = self.receive_stream.take_ack_pending();
        if frames.is_empty() && ack_pending {
            frames.push(Frame::ack(ack));
        }

        self.update_state();
        frames
    }

    fn update_state(&mut self) {
        if self.state == StreamState::Closing
            && self.send_stream.is_fin_acknowledged()
            && self.receive_stream.is_fin_received()
        {
            debug!("stream closed");
            self.state = StreamState::Closed;
        }
    }
}
