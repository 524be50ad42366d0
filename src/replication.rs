use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::connection::Connection;

/// Empty snapshot sent to a secondary that completes PSYNC. Decodes to 88
/// bytes; the contents are opaque to both sides of the transfer.
const EMPTY_SNAPSHOT_BASE64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

/// Number of in-flight replay commands the fan-out channel will hold
/// before `log_command` callers are made to wait.
const FANOUT_BUFFER: usize = 32;

pub fn empty_snapshot() -> Result<Vec<u8>, crate::Error> {
    Ok(STANDARD.decode(EMPTY_SNAPSHOT_BASE64)?)
}

/// Replication coordinator state on a primary: the set of secondaries
/// that completed the PSYNC handshake, plus the queue of mutations
/// awaiting fan-out.
///
/// The set takes its write lock only while a secondary registers; a
/// fan-out pass runs under the read lock, locking each connection's own
/// mutex just long enough to write one command.
#[derive(Debug)]
pub struct Replicas {
    connections: RwLock<Vec<Mutex<Connection>>>,
    commands: Sender<Vec<String>>,
}

impl Replicas {
    /// Creates the coordinator and the receiving half of its fan-out
    /// channel. The caller spawns [`notify_loop`] with the receiver; that
    /// task is the channel's only consumer.
    pub fn new() -> (Arc<Replicas>, Receiver<Vec<String>>) {
        let (tx, rx) = channel(FANOUT_BUFFER);

        let replicas = Arc::new(Replicas {
            connections: RwLock::new(Vec::new()),
            commands: tx,
        });

        (replicas, rx)
    }

    /// Takes ownership of a connection whose PSYNC handshake finished.
    /// From here on the coordinator is the only writer and the only
    /// closer of this socket.
    pub async fn register(&self, conn: Connection) {
        let mut connections = self.connections.write().await;
        connections.push(Mutex::new(conn));

        debug!(replicas = connections.len(), "new replica registered");
    }

    /// Queues one mutation for replay on every registered secondary.
    /// Mutation handlers call this from a spawned task so a full queue
    /// delays replication, never the client reply.
    pub async fn log_command(&self, command: Vec<String>) {
        // send only fails when the notify loop is gone, i.e. at shutdown
        let _ = self.commands.send(command).await;
    }

    pub async fn replica_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Drains the fan-out channel, writing each command to every registered
/// secondary in the order the sends completed. A write failure on one
/// secondary is logged and skipped: one dead peer must not stall
/// replication to the others.
pub async fn notify_loop(replicas: Arc<Replicas>, mut commands: Receiver<Vec<String>>) {
    while let Some(command) = commands.recv().await {
        let connections = replicas.connections.read().await;

        for (replica_id, conn) in connections.iter().enumerate() {
            debug!(replica_id, cmd = ?command, "notify replica");

            if let Err(err) = conn.lock().await.send_command(&command).await {
                warn!(replica_id, cause = %err, "failed to replay command to replica");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_88_opaque_bytes() {
        let snapshot = empty_snapshot().unwrap();

        assert_eq!(snapshot.len(), 88);
        assert!(snapshot.starts_with(b"REDIS"));
    }
}
