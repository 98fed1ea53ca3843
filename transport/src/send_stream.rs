use std::cmp::min;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::config::StreamConfig;
use crate::frame::{Frame, FrameKind};
use crate::frame_id::FrameId;
use crate::safe_converter::SafeCast;

/// Returned when a write does not fit into the send buffer. This is a backpressure signal: the
///  caller is expected to retry once acknowledged bytes were released.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SendBufferFull {
    pub requested: usize,
    pub available: usize,
}

impl Display for SendBufferFull {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "send buffer full: {} bytes requested, {} bytes available", self.requested, self.available)
    }
}

impl std::error::Error for SendBufferFull {}

struct InFlightFrame {
    kind: FrameKind,
    data: Bytes,
    last_sent: Instant,
}

/// The sending half of a reliable stream. Application bytes are buffered, cut into frames
///  while there is room in the send window, and kept until they are acknowledged, re-sending
///  them with their original frame id whenever the resend timeout elapses.
pub struct SendStream {
    config: Arc<StreamConfig>,

    /// bytes written by the application that were not packaged into a frame yet
    unsent: BytesMut,

    /// frames that were sent but not acknowledged, i.e. the send window
    in_flight: BTreeMap<FrameId, InFlightFrame>,
    in_flight_bytes: usize,

    /// the id of the next frame to be created
    next_frame_id: FrameId,

    fin_requested: bool,
    fin_id: Option<FrameId>,
}

impl SendStream {
    pub fn new(config: Arc<StreamConfig>) -> SendStream {
        SendStream {
            config,
            unsent: BytesMut::new(),
            in_flight: BTreeMap::default(),
            in_flight_bytes: 0,
            next_frame_id: FrameId::ZERO,
            fin_requested: false,
            fin_id: None,
        }
    }

    /// The number of bytes that can currently be written without being rejected
    pub fn send_buffer_left(&self) -> usize {
        self.config.send_buffer_size
            .saturating_sub(self.unsent.len() + self.in_flight_bytes)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), SendBufferFull> {
        let available = self.send_buffer_left();
        if data.len() > available || self.fin_requested {
            trace!("rejecting write of {} bytes, {} bytes available", data.len(), available);
            return Err(SendBufferFull {
                requested: data.len(),
                available: if self.fin_requested { 0 } else { available },
            });
        }
        self.unsent.extend_from_slice(data);
        Ok(())
    }

    /// Register the end of the stream. The FIN frame is sent after all previously written data.
    pub fn request_fin(&mut self) {
        self.fin_requested = true;
    }

    pub fn next_frame_id(&self) -> FrameId {
        self.next_frame_id
    }

    pub fn window_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Remove all frames *before* `ack` from the send window, freeing their bytes in the send
    ///  buffer
    pub fn on_ack(&mut self, ack: FrameId) {
        if ack > self.next_frame_id {
            debug!("peer acknowledged frame {} that was never sent (next frame id is {}) - ignoring", ack, self.next_frame_id);
            return;
        }

        while let Some(entry) = self.in_flight.first_entry() {
            if *entry.key() >= ack {
                break;
            }
            let (frame_id, acked) = entry.remove_entry();
            trace!("frame {} acknowledged", frame_id);
            self.in_flight_bytes -= acked.data.len();
        }
    }

    /// true if the FIN frame was sent and everything up to and including it was acknowledged
    pub fn is_fin_acknowledged(&self) -> bool {
        self.fin_id.is_some() && self.in_flight.is_empty()
    }

    /// Collect all frames that are due at `now`: new frames for buffered data while the window
    ///  permits, followed by re-sends of frames whose resend timeout elapsed.
    pub fn poll_frames(&mut self, now: Instant, ack: FrameId, out: &mut Vec<Frame>) {
        self.package_new_frames(now, ack, out);
        self.collect_resends(now, ack, out);
    }

    fn package_new_frames(&mut self, now: Instant, ack: FrameId, out: &mut Vec<Frame>) {
        let max_window: usize = self.config.max_window.safe_cast();

        while self.in_flight.len() < max_window && !self.unsent.is_empty() {
            let len = min(self.unsent.len(), self.config.max_frame_data_len);
            let data = self.unsent.split_to(len).freeze();
            let frame_id = self.next_frame_id;
            self.next_frame_id += 1;

            trace!("packaging frame {} with {} bytes", frame_id, len);
            out.push(Frame::data(frame_id, ack, data.clone()));

            self.in_flight_bytes += len;
            self.in_flight.insert(frame_id, InFlightFrame {
                kind: FrameKind::Data,
                data,
                last_sent: now,
            });
        }

        if self.fin_requested && self.fin_id.is_none() && self.unsent.is_empty() && self.in_flight.len() < max_window {
            let frame_id = self.next_frame_id;
            self.next_frame_id += 1;
            self.fin_id = Some(frame_id);

            debug!("sending FIN as frame {}", frame_id);
            out.push(Frame::fin(frame_id, ack));
            self.in_flight.insert(frame_id, InFlightFrame {
                kind: FrameKind::Fin,
                data: Bytes::new(),
                last_sent: now,
            });
        }
    }

    fn collect_resends(&mut self, now: Instant, ack: FrameId, out: &mut Vec<Frame>) {
        for (&frame_id, in_flight) in self.in_flight.iter_mut() {
            if now.saturating_duration_since(in_flight.last_sent) < self.config.resend_timeout {
                continue;
            }

            trace!("resend timeout for frame {}", frame_id);
            in_flight.last_sent = now;
            out.push(match in_flight.kind {
                FrameKind::Fin => Frame::fin(frame_id, ack),
                _ => Frame::data(frame_id, ack, in_flight.data.clone()),
            });
        }
    }
}
