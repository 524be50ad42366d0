use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

mod parse;

use crate::connection::Connection;
use crate::db::Db;
use crate::frame::Frame;
use crate::info::ServerInfo;
use crate::replication::{self, Replicas};
use parse::{Parse, ParseError};

const READONLY_ERROR: &str = "READONLY You can't write against a read only replica.";

/// Classifies where a connection's commands come from. Fixed when the
/// connection is set up; decides write permission, reply suppression and
/// whether mutations fan out to secondaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// External client talking to a primary.
    UserToMaster,
    /// External client talking to a secondary: reads only.
    UserToReplica,
    /// The replication channel a secondary opened to its primary.
    /// Commands are applied silently; only REPLCONF ACK is ever written
    /// back.
    MasterToReplica,
}

impl Source {
    pub(crate) fn is_replay(self) -> bool {
        matches!(self, Source::MasterToReplica)
    }
}

/// What the connection task should do after a command was applied.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Applied {
    Continue,
    /// PSYNC completed: the connection now belongs to the replication
    /// coordinator and must leave the read loop without being closed.
    RegisterReplica,
}

#[derive(Debug)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Get(Get),
    Set(Set),
    Info(Info),
    Replconf(Replconf),
    Psync(Psync),
    Wait(Wait),
    Unknown(Unknown),
    Invalid(Invalid),
}

#[derive(Debug, Default)]
pub struct Ping;

#[derive(Debug)]
pub struct Echo {
    pub message: String,
}

#[derive(Debug)]
pub struct Get {
    pub key: String,
}

#[derive(Debug)]
pub struct Set {
    pub key: String,
    pub value: String,
    pub expire_ms: Option<u64>,
}

#[derive(Debug)]
pub struct Info;

#[derive(Debug)]
pub struct Replconf {
    pub args: Vec<String>,
}

#[derive(Debug)]
pub struct Psync {
    pub repl_id: String,
    pub offset: String,
}

#[derive(Debug)]
pub struct Wait;

#[derive(Debug)]
pub struct Unknown {
    command_name: String,
}

/// A recognized command whose arguments failed validation. Applying it
/// sends the usage error; the connection stays open.
#[derive(Debug)]
pub struct Invalid {
    message: String,
}

impl Command {
    /// Maps a decoded frame onto a command. The command name is matched
    /// case-insensitively. Argument problems yield `Command::Invalid`
    /// rather than an error, because a bad argument list must only cost
    /// the client an error reply, not the connection.
    pub fn from_frame(frame: Frame) -> Result<Command, crate::Error> {
        let mut parse = Parse::new(frame)?;

        let command_name = parse.next_string()?.to_lowercase();

        let command = match command_name.as_str() {
            "ping" => Command::Ping(Ping),
            "echo" => match Echo::parse_frames(&mut parse) {
                Ok(cmd) => Command::Echo(cmd),
                Err(_) => Command::invalid("ERR 'echo' command accepts 1 param"),
            },
            "get" => match Get::parse_frames(&mut parse) {
                Ok(cmd) => Command::Get(cmd),
                Err(_) => Command::invalid("ERR 'get' command accepts 1 param"),
            },
            "set" => match Set::parse_frames(&mut parse) {
                Ok(cmd) => Command::Set(cmd),
                Err(_) => Command::invalid("ERR 'set' usage: set <key> <value> [PX <time_ms>]"),
            },
            "info" => match Info::parse_frames(&mut parse) {
                Ok(cmd) => Command::Info(cmd),
                Err(_) => Command::invalid("ERR 'info' command accepts 1 param"),
            },
            "replconf" => match Replconf::parse_frames(&mut parse) {
                Ok(cmd) => Command::Replconf(cmd),
                Err(_) => Command::invalid("ERR 'replconf' command requires at least 1 param"),
            },
            "psync" => match Psync::parse_frames(&mut parse) {
                Ok(cmd) => Command::Psync(cmd),
                Err(_) => Command::invalid("ERR 'psync' usage: psync <replication_id> <offset>"),
            },
            "wait" => match Wait::parse_frames(&mut parse) {
                Ok(cmd) => Command::Wait(cmd),
                Err(_) => Command::invalid("ERR 'wait' usage: wait <numreplicas> <timeout_ms>"),
            },
            _ => Command::Unknown(Unknown::new(command_name)),
        };

        Ok(command)
    }

    fn invalid(message: &str) -> Command {
        Command::Invalid(Invalid {
            message: message.to_string(),
        })
    }

    pub(crate) async fn apply(
        self,
        db: &Db,
        conn: &mut Connection,
        source: Source,
        info: &ServerInfo,
        replicas: Option<&Arc<Replicas>>,
    ) -> Result<Applied, crate::Error> {
        use Command::*;

        match self {
            Ping(cmd) => cmd.apply(conn, source).await?,
            Echo(cmd) => cmd.apply(conn, source).await?,
            Get(cmd) => cmd.apply(db, conn, source).await?,
            Set(cmd) => cmd.apply(db, conn, source, replicas).await?,
            Info(cmd) => cmd.apply(conn, source, info).await?,
            Replconf(cmd) => cmd.apply(conn, source).await?,
            Psync(cmd) => return cmd.apply(conn, source, info, replicas).await,
            Wait(cmd) => cmd.apply(conn, source, replicas).await?,
            Unknown(cmd) => cmd.apply(conn, source).await?,
            Invalid(cmd) => cmd.apply(conn, source).await?,
        }

        Ok(Applied::Continue)
    }
}

impl Ping {
    pub fn new() -> Ping {
        Ping
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"PING"));

        frame
    }

    pub async fn apply(self, conn: &mut Connection, source: Source) -> Result<(), crate::Error> {
        // the primary pings its secondaries over the replication channel;
        // answering there would corrupt the command stream
        if source.is_replay() {
            return Ok(());
        }

        conn.write_frame(&Frame::Simple("PONG".to_string())).await?;

        Ok(())
    }
}

impl Echo {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Echo, ParseError> {
        let message = parse.next_string()?;
        parse.finish()?;

        Ok(Echo { message })
    }

    pub async fn apply(self, conn: &mut Connection, source: Source) -> Result<(), crate::Error> {
        if source.is_replay() {
            return Ok(());
        }

        conn.write_frame(&Frame::Simple(self.message)).await?;

        Ok(())
    }
}

impl Get {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Get, ParseError> {
        let key = parse.next_string()?;
        parse.finish()?;

        Ok(Get { key })
    }

    pub async fn apply(
        self,
        db: &Db,
        conn: &mut Connection,
        source: Source,
    ) -> Result<(), crate::Error> {
        if source.is_replay() {
            return Ok(());
        }

        let response = match db.get(&self.key) {
            Some(data) => Frame::Bulk(data),
            None => Frame::Null,
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Set {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Set, ParseError> {
        let key = parse.next_string()?;
        let value = parse.next_string()?;

        let expire_ms = match parse.next_string() {
            Err(ParseError::EndOfStream) => None,
            Err(err) => return Err(err),
            Ok(option) if option.eq_ignore_ascii_case("px") => {
                let ms = parse
                    .next_string()?
                    .parse::<u64>()
                    .map_err(|_| ParseError::from("expiration is not a non-negative integer"))?;

                Some(ms)
            }
            Ok(option) => return Err(format!("unsupported SET option {}", option).into()),
        };

        parse.finish()?;

        Ok(Set {
            key,
            value,
            expire_ms,
        })
    }

    pub async fn apply(
        self,
        db: &Db,
        conn: &mut Connection,
        source: Source,
        replicas: Option<&Arc<Replicas>>,
    ) -> Result<(), crate::Error> {
        if source == Source::UserToReplica {
            conn.write_frame(&Frame::Error(READONLY_ERROR.to_string()))
                .await?;
            return Ok(());
        }

        db.set(
            self.key.clone(),
            Bytes::from(self.value.clone().into_bytes()),
            self.expire_ms.map(Duration::from_millis),
        );

        // Hand the mutation to the coordinator before replying, from its
        // own task so a slow fan-out channel never delays the client. The
        // command is logged exactly once whether or not the reply below
        // manages to go out.
        if let Some(replicas) = replicas {
            if !source.is_replay() {
                let replicas = Arc::clone(replicas);
                let command = self.replay_parts();

                tokio::spawn(async move {
                    replicas.log_command(command).await;
                });
            }
        }

        if source.is_replay() {
            return Ok(());
        }

        conn.write_frame(&Frame::Simple("OK".to_string())).await?;

        Ok(())
    }

    /// The argument list replayed to secondaries: the original SET,
    /// including any PX option, so each secondary derives the deadline
    /// from its own clock.
    fn replay_parts(&self) -> Vec<String> {
        let mut parts = vec![
            "SET".to_string(),
            self.key.clone(),
            self.value.clone(),
        ];

        if let Some(ms) = self.expire_ms {
            parts.push("PX".to_string());
            parts.push(ms.to_string());
        }

        parts
    }
}

impl Info {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Info, ParseError> {
        // only the replication section exists; the name is accepted and
        // otherwise ignored
        parse.next_string()?;
        parse.finish()?;

        Ok(Info)
    }

    pub async fn apply(
        self,
        conn: &mut Connection,
        source: Source,
        info: &ServerInfo,
    ) -> Result<(), crate::Error> {
        if source.is_replay() {
            return Ok(());
        }

        let body = Bytes::from(info.to_string().into_bytes());
        conn.write_frame(&Frame::Bulk(body)).await?;

        Ok(())
    }
}

impl Replconf {
    pub fn new<S: Into<String>>(args: Vec<S>) -> Replconf {
        Replconf {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"REPLCONF"));
        for arg in self.args {
            frame.push_bulk(Bytes::from(arg.into_bytes()));
        }

        frame
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Replconf, ParseError> {
        let mut args = vec![parse.next_string()?];

        loop {
            match parse.next_string() {
                Ok(arg) => args.push(arg),
                Err(ParseError::EndOfStream) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(Replconf { args })
    }

    pub async fn apply(self, conn: &mut Connection, source: Source) -> Result<(), crate::Error> {
        if source.is_replay() {
            if self.args[0].eq_ignore_ascii_case("getack") {
                // the ack covers everything consumed before the GETACK
                // command itself arrived
                let offset = conn.bytes_read_at_previous_command().to_string();
                conn.send_command(&["REPLCONF", "ACK", offset.as_str()])
                    .await?;
            }

            return Ok(());
        }

        conn.write_frame(&Frame::Simple("OK".to_string())).await?;

        Ok(())
    }
}

impl Psync {
    pub fn new<S: Into<String>>(repl_id: S, offset: S) -> Psync {
        Psync {
            repl_id: repl_id.into(),
            offset: offset.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"PSYNC"));
        frame.push_bulk(Bytes::from(self.repl_id.into_bytes()));
        frame.push_bulk(Bytes::from(self.offset.into_bytes()));

        frame
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Psync, ParseError> {
        let repl_id = parse.next_string()?;
        let offset = parse.next_string()?;
        parse.finish()?;

        Ok(Psync { repl_id, offset })
    }

    pub(crate) async fn apply(
        self,
        conn: &mut Connection,
        source: Source,
        info: &ServerInfo,
        replicas: Option<&Arc<Replicas>>,
    ) -> Result<Applied, crate::Error> {
        if source.is_replay() {
            return Ok(Applied::Continue);
        }

        if replicas.is_none() {
            conn.write_frame(&Frame::Error(
                "ERR PSYNC can only be sent to a master".to_string(),
            ))
            .await?;
            return Ok(Applied::Continue);
        }

        let reply = Frame::Simple(format!("FULLRESYNC {} 0", info.master_replid()));
        conn.write_frame(&reply).await?;

        // `$<len>\r\n` followed by the raw snapshot; no terminator after
        // the payload.
        let snapshot = replication::empty_snapshot()?;
        let mut transfer = format!("${}\r\n", snapshot.len()).into_bytes();
        transfer.extend_from_slice(&snapshot);
        conn.write_all(&transfer).await?;

        Ok(Applied::RegisterReplica)
    }
}

impl Wait {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Wait, ParseError> {
        // numreplicas and timeout are accepted but not waited on: the
        // reply is the currently registered count, immediately
        parse.next_string()?;
        parse.next_string()?;
        parse.finish()?;

        Ok(Wait)
    }

    pub async fn apply(
        self,
        conn: &mut Connection,
        source: Source,
        replicas: Option<&Arc<Replicas>>,
    ) -> Result<(), crate::Error> {
        if source.is_replay() {
            return Ok(());
        }

        match replicas {
            Some(replicas) => {
                let count = replicas.replica_count().await;
                conn.write_frame(&Frame::Integer(count as u64)).await?;
            }
            None => {
                conn.write_frame(&Frame::Error(
                    "ERR WAIT can only be sent to a master".to_string(),
                ))
                .await?;
            }
        }

        Ok(())
    }
}

impl Unknown {
    pub(crate) fn new(command_name: String) -> Unknown {
        Unknown { command_name }
    }

    pub async fn apply(self, conn: &mut Connection, source: Source) -> Result<(), crate::Error> {
        debug!(command = %self.command_name, "unknown command");

        // never echo errors back onto the replication stream
        if source.is_replay() {
            return Ok(());
        }

        let response = Frame::Error(format!("ERR unknown command {}", self.command_name));
        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Invalid {
    pub async fn apply(self, conn: &mut Connection, source: Source) -> Result<(), crate::Error> {
        if source.is_replay() {
            return Ok(());
        }

        conn.write_frame(&Frame::Error(self.message)).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_frame(parts: &[&str]) -> Frame {
        let mut frame = Frame::array();
        for part in parts {
            frame.push_bulk(Bytes::copy_from_slice(part.as_bytes()));
        }
        frame
    }

    #[test]
    fn dispatch_is_case_insensitive() {
        for spelling in ["set", "SET", "SeT", "sEt"] {
            let frame = command_frame(&[spelling, "k", "v"]);
            match Command::from_frame(frame).unwrap() {
                Command::Set(cmd) => {
                    assert_eq!(cmd.key, "k");
                    assert_eq!(cmd.value, "v");
                    assert_eq!(cmd.expire_ms, None);
                }
                other => panic!("{} dispatched to {:?}", spelling, other),
            }
        }
    }

    #[test]
    fn set_with_px_option() {
        let frame = command_frame(&["set", "k", "v", "Px", "250"]);
        match Command::from_frame(frame).unwrap() {
            Command::Set(cmd) => assert_eq!(cmd.expire_ms, Some(250)),
            other => panic!("dispatched to {:?}", other),
        }
    }

    #[test]
    fn set_with_bad_px_is_invalid() {
        for args in [
            &["set", "k", "v", "px", "-1"][..],
            &["set", "k", "v", "px", "soon"][..],
            &["set", "k", "v", "ex", "10"][..],
            &["set", "k"][..],
            &["set", "k", "v", "px"][..],
        ] {
            let frame = command_frame(args);
            match Command::from_frame(frame).unwrap() {
                Command::Invalid(_) => {}
                other => panic!("{:?} dispatched to {:?}", args, other),
            }
        }
    }

    #[test]
    fn wrong_arity_is_invalid_not_fatal() {
        for args in [&["get"][..], &["get", "a", "b"][..], &["echo"][..]] {
            let frame = command_frame(args);
            match Command::from_frame(frame).unwrap() {
                Command::Invalid(_) => {}
                other => panic!("{:?} dispatched to {:?}", args, other),
            }
        }
    }

    #[test]
    fn unrecognized_name_is_unknown() {
        let frame = command_frame(&["FLUSHALL"]);
        match Command::from_frame(frame).unwrap() {
            Command::Unknown(cmd) => assert_eq!(cmd.command_name, "flushall"),
            other => panic!("dispatched to {:?}", other),
        }
    }

    #[test]
    fn replconf_collects_all_arguments() {
        let frame = command_frame(&["replconf", "listening-port", "6380"]);
        match Command::from_frame(frame).unwrap() {
            Command::Replconf(cmd) => {
                assert_eq!(cmd.args, vec!["listening-port", "6380"]);
            }
            other => panic!("dispatched to {:?}", other),
        }
    }

    #[test]
    fn non_array_frame_is_a_protocol_error() {
        assert!(Command::from_frame(Frame::Simple("PING".to_string())).is_err());
    }
}
