//! Reliable, ordered byte streams on top of an unreliable, unordered datagram channel - in
//!  this workspace the channel is a sequence of ICMP echo packets, but nothing in this crate
//!  depends on that.
//!
//! ## Design goals
//!
//! * Deliver a byte stream exactly once and in order, or not at all
//!   * frames can be lost, duplicated and reordered by the channel
//! * Sans-IO: the [delivery_manager::DeliveryManager] does not touch sockets or clocks. Its
//!    owner passes in received frames and the current time, and sends whatever frames the
//!    manager returns. This keeps the protocol logic deterministic and testable.
//! * Minimize the number of packets, since every packet is an ICMP round trip on a channel
//!    that is typically slow and rate limited
//!   * acks are cumulative and piggybacked on data frames, ack-only frames are sent at most
//!      once per update
//! * Simplicity over sophistication: a fixed send window (in frames) and a fixed resend
//!    timeout without backoff. There is no congestion control.
//! * Backpressure: the send buffer has a fixed size, and writes that do not fit are rejected
//!    rather than buffered
//! * No handshake: the first frame of a stream implicitly opens it. FIN frames close it.
//!
//! ## Frames
//!
//! See [frame::Frame] for the wire format. There are three kinds of frames:
//!
//! *DATA*: a chunk of the stream's bytes with a frame id. Frame ids start at zero for every
//!  stream and are incremented for each DATA or FIN frame. A frame that is not acknowledged
//!  within the resend timeout is re-sent with the same frame id.
//!
//! *FIN*: the end of the stream in one direction. It has a frame id of its own and is delivered
//!  in sequence, i.e. only after all data before it.
//!
//! *ACK*: carries only the cumulative ack. Sent if frames were received, but there is no data
//!  to piggyback the ack on.
//!
//! Every frame carries the *ack threshold* of its sender, i.e. the id of the next frame the
//!  sender expects to receive. All frames before it were delivered to the application and can
//!  be removed from the peer's send window.
//!
//! ## Send and receive window
//!
//! The sender keeps at most `max_window` frames in flight. Since acks are cumulative, all
//!  frames in flight have ids in `ack .. ack+max_window`, which is the range the receiver
//!  buffers. Frames outside this range are dropped by the receiver - they can only be the
//!  result of a misconfiguration or of traffic manipulation.
//!
//! ## Stream states
//!
//! `ACTIVE -> CLOSING -> CLOSED`. Closing is initiated locally and sends a FIN after all
//!  buffered data. The stream is closed when the local FIN is acknowledged and the peer's FIN
//!  was delivered.

pub mod config;
pub mod delivery_manager;
pub mod frame;
pub mod frame_id;
pub mod receive_stream;
pub mod send_stream;
mod safe_converter;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
