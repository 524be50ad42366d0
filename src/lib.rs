//! An in-memory key-value server speaking a line-oriented,
//! length-prefixed binary protocol, with asynchronous master→replica
//! replication.
//!
//! A master accepts writes and fans every accepted mutation out to the
//! replicas that completed the PSYNC handshake. A replica opens one
//! outbound connection to its master, discards the snapshot it is sent,
//! and then replays the command stream into its own keyspace while
//! serving reads to its own clients.

pub mod client;
pub mod cmd;
pub mod connection;
pub mod db;
pub mod frame;
pub mod info;
pub mod replication;
pub mod server;

/// Port served when none is configured.
pub const DEFAULT_PORT: u16 = 6379;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
