use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use pingtunnel_transport::config::StreamConfig;

/// How a client relays local traffic, chosen once for all its connections
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TunnelMode {
    /// UDP: each datagram travels as a single envelope, without any delivery guarantees
    Datagram,
    /// TCP: a reliable, ordered byte stream per connection
    Stream(StreamConfig),
}

/// Settings shared by both endpoint roles
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// A connection without traffic in either direction for this long is torn down
    pub timeout: Duration,

    /// Shared between client and server. This is a filter for unrelated ICMP traffic, not a
    ///  means of authentication.
    pub key: i32,

    /// The interval for reaping idle connections, reporting throughput and (client only)
    ///  sending keep-alive pings
    pub housekeeping_interval: Duration,

    /// Capacity of the queue between the ICMP receive loop and the endpoint's main loop.
    ///  Packets arriving while it is full are dropped.
    pub inbound_queue_size: usize,

    /// Capacity of each stream connection's frame queue
    pub connection_queue_size: usize,

    /// The tick of a stream connection's delivery manager, which bounds the latency of
    ///  re-sends and acks
    pub stream_update_interval: Duration,

    /// Server only: the largest send buffer a client may request for a stream
    pub max_stream_send_buffer_size: usize,

    /// Server only: the largest window (in frames) a client may request for a stream. This
    ///  also bounds the server's reorder buffer.
    pub max_stream_window: u32,

    /// Server only: the largest frame payload a client may request for a stream
    pub max_stream_frame_data_len: usize,
}

impl TunnelConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_INBOUND_QUEUE_SIZE: usize = 10_000;
    pub const DEFAULT_CONNECTION_QUEUE_SIZE: usize = 1024;
    pub const DEFAULT_STREAM_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_STREAM_SEND_BUFFER_SIZE: usize = 64 * 1024 * 1024;
    pub const DEFAULT_MAX_STREAM_WINDOW: u32 = 65_536;
    pub const DEFAULT_MAX_STREAM_FRAME_DATA_LEN: usize = 8192;

    pub fn new(timeout: Duration, key: i32) -> TunnelConfig {
        TunnelConfig {
            timeout,
            key,
            housekeeping_interval: Self::DEFAULT_HOUSEKEEPING_INTERVAL,
            inbound_queue_size: Self::DEFAULT_INBOUND_QUEUE_SIZE,
            connection_queue_size: Self::DEFAULT_CONNECTION_QUEUE_SIZE,
            stream_update_interval: Self::DEFAULT_STREAM_UPDATE_INTERVAL,
            max_stream_send_buffer_size: Self::DEFAULT_MAX_STREAM_SEND_BUFFER_SIZE,
            max_stream_window: Self::DEFAULT_MAX_STREAM_WINDOW,
            max_stream_frame_data_len: Self::DEFAULT_MAX_STREAM_FRAME_DATA_LEN,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            bail!("timeout must not be zero");
        }
        if self.housekeeping_interval.is_zero() || self.stream_update_interval.is_zero() {
            bail!("intervals must not be zero");
        }
        if self.inbound_queue_size == 0 || self.connection_queue_size == 0 {
            bail!("queue sizes must be at least 1");
        }
        Ok(())
    }

    /// Check stream parameters requested by a client against this server's limits
    pub fn validate_stream(&self, stream_config: &StreamConfig) -> anyhow::Result<()> {
        stream_config.validate()?;

        if stream_config.send_buffer_size > self.max_stream_send_buffer_size {
            bail!("send buffer of {} bytes exceeds the limit of {} bytes", stream_config.send_buffer_size, self.max_stream_send_buffer_size);
        }
        if stream_config.max_window > self.max_stream_window {
            bail!("window of {} frames exceeds the limit of {} frames", stream_config.max_window, self.max_stream_window);
        }
        if stream_config.max_frame_data_len > self.max_stream_frame_data_len {
            bail!("frames of {} bytes exceed the limit of {} bytes", stream_config.max_frame_data_len, self.max_stream_frame_data_len);
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig::new(Self::DEFAULT_TIMEOUT, 0)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tunnel: TunnelConfig,

    /// local address for accepting application connections (TCP mode) or datagrams (UDP mode)
    pub listen_addr: SocketAddr,

    /// the tunnel server
    pub server: Ipv4Addr,

    /// The destination the server connects to, as `host:port`. It is resolved by the server.
    pub target: String,

    pub mode: TunnelMode,
}

impl ClientConfig {
    /// targets are sent with every envelope, so they are kept short
    pub const MAX_TARGET_LEN: usize = 255;

    pub fn validate(&self) -> anyhow::Result<()> {
        self.tunnel.validate()?;

        if self.target.is_empty() {
            bail!("target must not be empty");
        }
        if self.target.len() > Self::MAX_TARGET_LEN {
            bail!("target must not be longer than {} bytes", Self::MAX_TARGET_LEN);
        }
        if let TunnelMode::Stream(stream_config) = &self.mode {
            stream_config.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn client_config(target: &str, mode: TunnelMode) -> ClientConfig {
        ClientConfig {
            tunnel: TunnelConfig::default(),
            listen_addr: "127.0.0.1:4455".parse().unwrap(),
            server: Ipv4Addr::new(10, 0, 0, 1),
            target: target.to_string(),
            mode,
        }
    }

    #[rstest]
    #[case::default(TunnelConfig::default(), true)]
    #[case::zero_timeout(TunnelConfig::new(Duration::ZERO, 0), false)]
    #[case::zero_housekeeping(TunnelConfig { housekeeping_interval: Duration::ZERO, ..TunnelConfig::default() }, false)]
    #[case::zero_update(TunnelConfig { stream_update_interval: Duration::ZERO, ..TunnelConfig::default() }, false)]
    #[case::zero_queue(TunnelConfig { inbound_queue_size: 0, ..TunnelConfig::default() }, false)]
    #[case::zero_connection_queue(TunnelConfig { connection_queue_size: 0, ..TunnelConfig::default() }, false)]
    fn test_tunnel_config_validate(#[case] config: TunnelConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[rstest]
    #[case::default(StreamConfig::default(), true)]
    #[case::at_limits(StreamConfig { send_buffer_size: 64 * 1024 * 1024, max_window: 65_536, max_frame_data_len: 8192, ..StreamConfig::default() }, true)]
    #[case::huge_buffer(StreamConfig { send_buffer_size: 64 * 1024 * 1024 + 1, ..StreamConfig::default() }, false)]
    #[case::huge_window(StreamConfig { max_window: u32::MAX, ..StreamConfig::default() }, false)]
    #[case::huge_frames(StreamConfig { max_frame_data_len: 8193, ..StreamConfig::default() }, false)]
    #[case::invalid(StreamConfig { resend_timeout: Duration::ZERO, ..StreamConfig::default() }, false)]
    fn test_validate_stream(#[case] stream_config: StreamConfig, #[case] expected_valid: bool) {
        assert_eq!(TunnelConfig::default().validate_stream(&stream_config).is_ok(), expected_valid);
    }

    #[rstest]
    #[case::datagram(client_config("1.2.3.4:53", TunnelMode::Datagram), true)]
    #[case::stream(client_config("example.com:22", TunnelMode::Stream(StreamConfig::default())), true)]
    #[case::empty_target(client_config("", TunnelMode::Datagram), false)]
    #[case::long_target(client_config(&"x".repeat(256), TunnelMode::Datagram), false)]
    #[case::invalid_stream(client_config("a:1", TunnelMode::Stream(StreamConfig { max_window: 0, ..StreamConfig::default() })), false)]
    fn test_client_config_validate(#[case] config: ClientConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
