use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::cmd::{Applied, Command, Source};
use crate::connection::Connection;
use crate::db::Db;
use crate::frame::Frame;
use crate::info::{Role, ServerInfo};
use crate::replication::Replicas;

struct Listener {
    listener: TcpListener,
    db: Db,
    info: Arc<ServerInfo>,

    /// Present on a primary only; a secondary never registers peers.
    replicas: Option<Arc<Replicas>>,
}

struct Handler {
    connection: Connection,
    db: Db,
    source: Source,
    info: Arc<ServerInfo>,
    replicas: Option<Arc<Replicas>>,
}

/// Accepts connections until `shutdown` completes, spawning one handler
/// task per connection so accepting never waits on request processing.
pub async fn run(
    listener: TcpListener,
    db: Db,
    info: Arc<ServerInfo>,
    replicas: Option<Arc<Replicas>>,
    shutdown: impl Future,
) {
    let mut server = Listener {
        listener,
        db,
        info,
        replicas,
    };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }
}

impl Listener {
    async fn run(&mut self) -> Result<(), crate::Error> {
        // every accepted socket is an external client; where its writes
        // are allowed to go depends on this process's role
        let source = match self.info.role() {
            Role::Master => Source::UserToMaster,
            Role::Replica => Source::UserToReplica,
        };

        loop {
            let socket = self.accept().await?;

            let handler = Handler {
                connection: Connection::new(socket),
                db: self.db.clone(),
                source,
                info: Arc::clone(&self.info),
                replicas: self.replicas.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, "connection error");
                }
            });
        }
    }

    async fn accept(&mut self) -> Result<TcpStream, crate::Error> {
        match self.listener.accept().await {
            Ok((socket, _)) => Ok(socket),
            Err(err) => Err(err.into()),
        }
    }
}

impl Handler {
    /// Serves one connection until the peer disconnects, an error ends
    /// it, or a PSYNC hands the socket over to the replication
    /// coordinator.
    async fn run(mut self) -> Result<(), crate::Error> {
        loop {
            // snapshot the byte counter before reading, so a GETACK in
            // the next command slot reports what came before it
            self.connection.remember_previous_bytes();

            let maybe_frame = match self.connection.read_frame().await {
                Ok(maybe_frame) => maybe_frame,
                Err(err) => {
                    self.reject(&err).await;
                    return Err(err);
                }
            };

            let frame = match maybe_frame {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let cmd = match Command::from_frame(frame) {
                Ok(cmd) => cmd,
                Err(err) => {
                    self.reject(&err).await;
                    return Err(err);
                }
            };

            debug!(?cmd);

            let applied = cmd
                .apply(
                    &self.db,
                    &mut self.connection,
                    self.source,
                    &self.info,
                    self.replicas.as_ref(),
                )
                .await?;

            if applied == Applied::RegisterReplica {
                // the coordinator now owns the socket; leaving this task
                // without dropping it into the registry would close it
                if let Some(replicas) = self.replicas {
                    replicas.register(self.connection).await;
                }

                return Ok(());
            }
        }
    }

    /// Best-effort error reply before a connection is failed for a
    /// malformed frame. Socket-level errors skip the reply; there is
    /// nobody left to read it.
    async fn reject(&mut self, err: &crate::Error) {
        if err.downcast_ref::<std::io::Error>().is_some() {
            return;
        }

        let reply = Frame::Error(format!("ERR {}", err));
        let _ = self.connection.write_frame(&reply).await;
    }
}
