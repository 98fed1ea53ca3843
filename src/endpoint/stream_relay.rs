use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, Bytes};
use pingtunnel_transport::config::StreamConfig;
use pingtunnel_transport::delivery_manager::{DeliveryManager, StreamState};
use pingtunnel_transport::frame::Frame;
use pingtunnel_transport::frame_id::FrameId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing::{debug, info, trace, warn};
use crate::endpoint::{notify_closed, ActivityStamp, ConnectionRoute, LocalEvent};

/// The maximum number of bytes read from the local socket at a time
const READ_CHUNK_SIZE: usize = 10240;

#[derive(Debug, Eq, PartialEq)]
enum RelayEnd {
    /// both directions were closed in an orderly fashion
    Finished,
    /// the connection was removed from the endpoint's table, e.g. because it timed out
    Removed,
}

/// The task relaying a local TCP connection through the tunnel in TCP mode. It owns the local
///  socket and the connection's [DeliveryManager], feeding it local bytes and inbound frames,
///  and sending the frames it produces.
pub struct StreamRelay {
    pub route: ConnectionRoute,
    pub config: Arc<StreamConfig>,
    pub update_interval: Duration,
    pub activity: Arc<ActivityStamp>,
    pub events: mpsc::Sender<LocalEvent>,
    /// The client side announces a new stream until it hears from the server or sends data,
    ///  so that the server connects to the target even if the application waits for the
    ///  target to speak first
    pub announce: bool,
}

impl StreamRelay {
    pub async fn run<S: AsyncRead + AsyncWrite + Send>(self, local: S, frames: mpsc::Receiver<Frame>) {
        let connection_id = self.route.connection_id.clone();

        match self.relay(local, frames).await {
            Ok(RelayEnd::Finished) => {
                info!("stream {} finished", connection_id);
                notify_closed(&self.events, connection_id).await;
            }
            Ok(RelayEnd::Removed) => {
                debug!("stream {} was removed", connection_id);
            }
            Err(e) => {
                warn!("closing stream {}: {}", connection_id, e);
                notify_closed(&self.events, connection_id).await;
            }
        }
    }

    async fn relay<S: AsyncRead + AsyncWrite + Send>(&self, local: S, mut frames: mpsc::Receiver<Frame>) -> anyhow::Result<RelayEnd> {
        let (mut reader, mut writer) = tokio::io::split(local);
        let mut manager = DeliveryManager::new(self.config.clone());

        let mut ticks = time::interval(self.update_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut read_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut local_eof = false;
        let mut local_write_shut_down = false;

        //NB: bytes taken from the manager but not yet written to the local socket. Writes happen
        //     in their own select! branch so that a slow local reader does not stall the stream.
        let mut pending = Bytes::new();

        let mut announcing = self.announce;
        let mut last_announced: Option<Instant> = None;
        let mut closed_since: Option<Instant> = None;
        //NB: after both sides closed, the stream lingers so that a re-sent FIN of the peer is
        //     acknowledged again if our ack got lost
        let linger = 2 * self.config.resend_timeout;

        loop {
            //NB: Reading no more than the send buffer can take makes a rejected write impossible,
            //     and not reading is what propagates backpressure to the local socket
            let read_len = if local_eof {
                0
            }
            else {
                min(manager.send_buffer_left(), READ_CHUNK_SIZE)
            };

            select! {
                result = reader.read(&mut read_buf[..read_len]), if read_len > 0 => {
                    match result? {
                        0 => {
                            debug!("stream {}: local EOF", self.route.connection_id);
                            local_eof = true;
                            manager.close();
                        }
                        n => {
                            trace!("stream {}: read {} bytes from local socket", self.route.connection_id, n);
                            self.activity.touch();
                            manager.write(&read_buf[..n])?;
                        }
                    }
                }
                result = writer.write(&pending), if !pending.is_empty() => {
                    match result? {
                        0 => bail!("local socket does not accept any more bytes"),
                        n => {
                            trace!("stream {}: wrote {} bytes to local socket", self.route.connection_id, n);
                            self.activity.touch();
                            pending.advance(n);
                        }
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return Ok(RelayEnd::Removed);
                    };
                    announcing = false;
                    let local_writable = pending.is_empty();
                    manager.on_frame(frame_for_manager(frame, local_writable));
                    while let Ok(frame) = frames.try_recv() {
                        manager.on_frame(frame_for_manager(frame, local_writable));
                    }
                }
                _ = ticks.tick() => {}
            }

            let now = Instant::now();
            let outgoing = manager.update(now.into_std());
            if outgoing.iter().any(|f| f.is_sequenced()) {
                announcing = false;
            }
            for frame in &outgoing {
                if let Err(e) = self.route.send_frame(frame).await {
                    // ICMP is lossy anyway, so this is handled like a lost packet
                    debug!("stream {}: error sending frame {}: {}", self.route.connection_id, frame.id, e);
                }
            }

            if announcing && last_announced.map_or(true, |t| now.duration_since(t) >= self.config.resend_timeout) {
                trace!("stream {}: announcing stream", self.route.connection_id);
                last_announced = Some(now);
                if let Err(e) = self.route.send_frame(&Frame::ack(FrameId::ZERO)).await {
                    debug!("stream {}: error announcing stream: {}", self.route.connection_id, e);
                }
            }

            if pending.is_empty() && manager.has_received_data() {
                pending = manager.take_received();
            }

            if pending.is_empty() && manager.is_remote_closed() && !local_write_shut_down {
                debug!("stream {}: peer closed, shutting down local write side", self.route.connection_id);
                writer.shutdown().await?;
                local_write_shut_down = true;
            }

            if manager.state() == StreamState::Closed && local_write_shut_down {
                let since = *closed_since.get_or_insert(now);
                if now.duration_since(since) >= linger {
                    return Ok(RelayEnd::Finished);
                }
            }
        }
    }
}

/// While the local socket has not taken the previously received bytes, only the acks of
///  inbound frames are processed. Their data is left to the peer's re-send, which bounds what
///  is buffered for a slow local reader and stops acks from advancing.
fn frame_for_manager(frame: Frame, local_writable: bool) -> Frame {
    if local_writable || !frame.is_sequenced() {
        frame
    }
    else {
        Frame::ack(frame.ack)
    }
}
