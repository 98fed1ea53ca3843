use std::time::Duration;
use anyhow::bail;

/// Parameters of a single reliable stream. Both peers of a stream must agree on
///  `max_window`, since the receiver uses it to bound its reorder buffer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamConfig {
    /// Upper bound for the number of bytes buffered on the sender side, i.e. bytes that were
    ///  written by the application but not acknowledged by the peer yet. Writes beyond this
    ///  limit are rejected, which is how backpressure reaches the local socket.
    pub send_buffer_size: usize,

    /// The maximum number of frames (not bytes) that may be sent and unacknowledged at
    ///  any given time
    pub max_window: u32,

    /// Unacknowledged frames are re-sent after this timeout. There is deliberately no backoff.
    pub resend_timeout: Duration,

    /// The maximum number of payload bytes in a single DATA frame. This must leave room for
    ///  frame, envelope and ICMP headers inside a single IP packet.
    pub max_frame_data_len: usize,
}

impl StreamConfig {
    pub const DEFAULT_SEND_BUFFER_SIZE: usize = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_WINDOW: u32 = 10_000;
    pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_millis(400);
    pub const DEFAULT_MAX_FRAME_DATA_LEN: usize = 1024;

    pub fn new(send_buffer_size: usize, max_window: u32, resend_timeout: Duration) -> StreamConfig {
        StreamConfig {
            send_buffer_size,
            max_window,
            resend_timeout,
            max_frame_data_len: Self::DEFAULT_MAX_FRAME_DATA_LEN,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_window == 0 {
            bail!("max window must be at least 1");
        }
        if self.max_frame_data_len == 0 {
            bail!("max frame data length must be at least 1");
        }
        if self.send_buffer_size < self.max_frame_data_len {
            bail!("send buffer ({} bytes) must hold at least one frame ({} bytes)", self.send_buffer_size, self.max_frame_data_len);
        }
        if self.resend_timeout.is_zero() {
            bail!("resend timeout must not be zero");
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig::new(Self::DEFAULT_SEND_BUFFER_SIZE, Self::DEFAULT_MAX_WINDOW, Self::DEFAULT_RESEND_TIMEOUT)
    }
}
