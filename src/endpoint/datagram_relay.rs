use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::endpoint::{notify_closed, ActivityStamp, ConnectionRoute, LocalEvent};

/// Client side, UDP mode: writes the datagrams coming through the tunnel to the application
///  that sent the connection's first datagram. All connections share the client's local
///  socket for this.
pub struct LocalDatagramRelay {
    pub connection_id: String,
    pub socket: Arc<UdpSocket>,
    pub local: SocketAddr,
    pub events: mpsc::Sender<LocalEvent>,
}

impl LocalDatagramRelay {
    pub async fn run(self, mut datagrams: mpsc::Receiver<Bytes>) {
        while let Some(datagram) = datagrams.recv().await {
            trace!("datagram {}: {} bytes to {}", self.connection_id, datagram.len(), self.local);
            if let Err(e) = self.socket.send_to(&datagram, self.local).await {
                warn!("datagram {}: error sending to {}: {}", self.connection_id, self.local, e);
                notify_closed(&self.events, self.connection_id).await;
                return;
            }
        }
        debug!("datagram {} was removed", self.connection_id);
    }
}

/// Server side, UDP mode: a UDP socket per connection, connected to the connection's target.
///  Datagrams from the tunnel are sent to the target, and everything the target sends back
///  goes through the tunnel to the client.
pub struct TargetDatagramRelay {
    pub route: ConnectionRoute,
    pub target: String,
    pub activity: Arc<ActivityStamp>,
    pub events: mpsc::Sender<LocalEvent>,
}

impl TargetDatagramRelay {
    pub async fn run(self, datagrams: mpsc::Receiver<Bytes>) {
        let connection_id = self.route.connection_id.clone();
        match self.relay(datagrams).await {
            Ok(()) => {
                debug!("datagram {} was removed", connection_id);
            }
            Err(e) => {
                warn!("closing datagram connection {} to {}: {}", connection_id, self.target, e);
                notify_closed(&self.events, connection_id).await;
            }
        }
    }

    async fn relay(&self, mut datagrams: mpsc::Receiver<Bytes>) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(self.target.as_str()).await?;
        debug!("datagram {}: connected to {} from {}", self.route.connection_id, self.target, socket.local_addr()?);

        let mut buf = vec![0u8; 65536];
        loop {
            select! {
                datagram = datagrams.recv() => {
                    let Some(datagram) = datagram else {
                        return Ok(());
                    };
                    socket.send(&datagram).await?;
                }
                result = socket.recv(&mut buf) => {
                    let n = result?;
                    trace!("datagram {}: {} bytes from target", self.route.connection_id, n);
                    self.activity.touch();
                    if let Err(e) = self.route.send_data(Bytes::copy_from_slice(&buf[..n])).await {
                        debug!("datagram {}: error sending through the tunnel: {}", self.route.connection_id, e);
                    }
                }
            }
        }
    }
}
