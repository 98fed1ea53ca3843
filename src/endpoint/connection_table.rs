use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use pingtunnel_transport::frame::Frame;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};
use crate::endpoint::ActivityStamp;

/// Where inbound payloads of a connection go: always to the task that owns the connection's
///  local socket. Dropping the relay (i.e. the sender) terminates that task.
pub enum ConnectionRelay {
    /// TCP mode: frames for the connection's delivery manager
    Stream(mpsc::Sender<Frame>),
    /// UDP mode: datagrams to be written verbatim
    Datagram(mpsc::Sender<Bytes>),
}

impl ConnectionRelay {
    /// Hand an inbound payload to the connection's task. This never waits: if the task can not
    ///  keep up, the payload is dropped, and TCP mode recovers by re-sending.
    pub fn deliver(&self, connection_id: &str, mut payload: Bytes) {
        let result = match self {
            ConnectionRelay::Stream(frames) => {
                let frame = match Frame::deser(&mut payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("dropping unparseable frame for connection {}: {}", connection_id, e);
                        return;
                    }
                };
                frames.try_send(frame).map_err(|e| Self::describe(e))
            }
            ConnectionRelay::Datagram(datagrams) => {
                datagrams.try_send(payload).map_err(|e| Self::describe(e))
            }
        };

        if let Err(reason) = result {
            debug!("dropping payload for connection {}: {}", connection_id, reason);
        }
    }

    fn describe<T>(e: TrySendError<T>) -> &'static str {
        match e {
            TrySendError::Full(_) => "queue full",
            TrySendError::Closed(_) => "connection task terminated",
        }
    }
}

/// The tunnel's record of one multiplexed connection
pub struct LogicalConnection {
    pub connection_id: String,
    /// the application's address on the client side, `None` on the server side
    pub local: Option<SocketAddr>,
    pub activity: Arc<ActivityStamp>,
    /// set when the connection's task terminated, removal happens at the next housekeeping tick
    pub closing: bool,
    pub relay: ConnectionRelay,
}

impl LogicalConnection {
    pub fn new(connection_id: String, local: Option<SocketAddr>, activity: Arc<ActivityStamp>, relay: ConnectionRelay) -> LogicalConnection {
        LogicalConnection {
            connection_id,
            local,
            activity,
            closing: false,
            relay,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
struct Slot(u64);

/// All connections of an endpoint, stored once and indexed both by connection id and by local
///  address. The indices are only modified together with the arena, so they are always
///  consistent.
///
/// The table is owned by the endpoint's main loop and is never shared between tasks.
#[derive(Default)]
pub struct ConnectionTable {
    arena: FxHashMap<Slot, LogicalConnection>,
    by_id: FxHashMap<String, Slot>,
    by_local: FxHashMap<SocketAddr, Slot>,
    next_slot: u64,
}

impl ConnectionTable {
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn insert(&mut self, connection: LogicalConnection) -> anyhow::Result<()> {
        if self.by_id.contains_key(&connection.connection_id) {
            bail!("duplicate connection id {}", connection.connection_id);
        }
        if let Some(local) = &connection.local {
            if self.by_local.contains_key(local) {
                bail!("duplicate connection for local address {}", local);
            }
        }

        let slot = Slot(self.next_slot);
        self.next_slot += 1;

        self.by_id.insert(connection.connection_id.clone(), slot);
        if let Some(local) = connection.local {
            self.by_local.insert(local, slot);
        }
        self.arena.insert(slot, connection);
        Ok(())
    }

    pub fn get_by_id(&self, connection_id: &str) -> Option<&LogicalConnection> {
        self.by_id.get(connection_id)
            .and_then(|slot| self.arena.get(slot))
    }

    pub fn get_by_local(&self, local: &SocketAddr) -> Option<&LogicalConnection> {
        self.by_local.get(local)
            .and_then(|slot| self.arena.get(slot))
    }

    /// Mark a connection for removal at the next [ConnectionTable::remove_inactive]. Unknown
    ///  ids are ignored.
    pub fn mark_closing(&mut self, connection_id: &str) {
        if let Some(connection) = self.by_id.get(connection_id)
            .and_then(|slot| self.arena.get_mut(slot))
        {
            connection.closing = true;
        }
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<LogicalConnection> {
        let slot = self.by_id.remove(connection_id)?;
        let connection = self.arena.remove(&slot)?;
        if let Some(local) = &connection.local {
            self.by_local.remove(local);
        }
        Some(connection)
    }

    /// Remove and return all connections that are closing or had no traffic for longer than
    ///  `timeout`
    pub fn remove_inactive(&mut self, timeout: Duration) -> Vec<LogicalConnection> {
        let inactive_ids = self.arena.values()
            .filter(|c| c.closing || c.activity.idle_time() > timeout)
            .map(|c| c.connection_id.clone())
            .collect::<Vec<_>>();

        inactive_ids.iter()
            .flat_map(|id| {
                trace!("removing connection {}", id);
                self.remove(id)
            })
            .collect()
    }
}
