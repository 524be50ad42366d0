use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

use crate::cmd::{Command, Ping, Psync, Replconf, Source};
use crate::connection::Connection;
use crate::db::Db;
use crate::frame::Frame;
use crate::info::ServerInfo;

/// Upper bound on each handshake step, so a silent master cannot stall
/// startup. Once the replay loop starts the link has no read deadline.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound side of the replication link: a secondary's connection to its
/// master. Performs the one-shot handshake, then turns into the inbound
/// replay loop on the same framed connection.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> Result<Client, crate::Error> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);

        Ok(Client { connection })
    }

    /// Runs the handshake: PING, both REPLCONFs, PSYNC, then the snapshot
    /// transfer. Any failure here is fatal to the caller; there is no
    /// recovery path for a half-synchronized secondary.
    pub async fn handshake(&mut self, listening_port: u16) -> Result<(), crate::Error> {
        let reply = self.request(Ping::new().into_frame()).await?;
        if reply != "+PONG" {
            return Err(format!("handshake PING answered {:?}", reply).into());
        }

        let replconf = Replconf::new(vec![
            "listening-port".to_string(),
            listening_port.to_string(),
        ]);
        let reply = self.request(replconf.into_frame()).await?;
        if reply != "+OK" {
            return Err(format!("handshake REPLCONF listening-port answered {:?}", reply).into());
        }

        let replconf = Replconf::new(vec!["capa", "psync2"]);
        let reply = self.request(replconf.into_frame()).await?;
        if reply != "+OK" {
            return Err(format!("handshake REPLCONF capa answered {:?}", reply).into());
        }

        // the FULLRESYNC line carries the master's replication id and
        // offset; a fresh secondary has no use for either
        let reply = self.request(Psync::new("?", "-1").into_frame()).await?;
        debug!(%reply, "psync answered");

        self.read_snapshot().await?;

        // from here on the byte counters must cover replicated commands
        // only, so ack offsets line up with what the master streamed
        self.connection.reset_byte_counts();

        Ok(())
    }

    /// Sends one command frame and reads the single reply line.
    async fn request(&mut self, frame: Frame) -> Result<String, crate::Error> {
        timeout(HANDSHAKE_STEP_TIMEOUT, async {
            self.connection.write_frame(&frame).await?;
            self.connection.read_line().await
        })
        .await
        .map_err(|_| -> crate::Error { "handshake step timed out".into() })?
    }

    /// Reads `$<len>` and then exactly `len` payload bytes. The payload
    /// has no trailing CRLF and is discarded: the snapshot is opaque and
    /// describes an empty keyspace.
    async fn read_snapshot(&mut self) -> Result<(), crate::Error> {
        timeout(HANDSHAKE_STEP_TIMEOUT, async {
            let header = self.connection.read_line().await?;

            let len = header
                .strip_prefix('$')
                .and_then(|raw| raw.parse::<usize>().ok())
                .ok_or_else(|| {
                    crate::Error::from(format!("bad snapshot header {:?}", header))
                })?;

            let snapshot = self.connection.read_exact(len).await?;
            debug!(bytes = snapshot.len(), "snapshot received and discarded");

            Ok(())
        })
        .await
        .map_err(|_| -> crate::Error { "snapshot transfer timed out".into() })?
    }

    /// Inbound replay loop: applies every command the master streams,
    /// writing nothing back except REPLCONF ACK answers. Runs until the
    /// link drops.
    pub async fn replay(mut self, db: Db, info: Arc<ServerInfo>) -> Result<(), crate::Error> {
        loop {
            self.connection.remember_previous_bytes();

            let frame = match self.connection.read_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let cmd = Command::from_frame(frame)?;
            debug!(?cmd, offset = self.connection.bytes_read(), "replaying");

            cmd.apply(
                &db,
                &mut self.connection,
                Source::MasterToReplica,
                &info,
                None,
            )
            .await?;
        }
    }
}
