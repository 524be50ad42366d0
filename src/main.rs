use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use replikv::client::Client;
use replikv::db::Db;
use replikv::info::ServerInfo;
use replikv::replication::{self, Replicas};
use replikv::{server, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(
    name = "replikv",
    version,
    about = "In-memory key-value server with master/replica replication"
)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Minimum severity of log lines.
    #[arg(long, value_enum, ignore_case = true, default_value = "debug")]
    loglevel: LogLevel,

    /// Start as a read-only replica of the given master, e.g.
    /// --replicaof "127.0.0.1 6379".
    #[arg(long, value_name = "HOST PORT")]
    replicaof: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> tracing::Level {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> replikv::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(args.loglevel))
        .with_writer(std::io::stderr)
        .init();

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "listening");

    let db = Db::new();

    match args.replicaof {
        Some(ref master) => {
            let (host, master_port) = parse_replicaof(master)?;
            let info = Arc::new(ServerInfo::replica());

            // The replication link runs beside the accept loop. Failing
            // to establish or keep it is fatal: a replica that lost its
            // stream has no way to catch up.
            let replay_db = db.clone();
            let replay_info = Arc::clone(&info);
            let listening_port = args.port;

            tokio::spawn(async move {
                let result =
                    replicate(&host, master_port, listening_port, replay_db, replay_info).await;

                if let Err(err) = result {
                    error!(cause = %err, "replication link failed");
                } else {
                    error!("master closed the replication link");
                }
                std::process::exit(1);
            });

            server::run(listener, db, info, None, signal::ctrl_c()).await;
        }
        None => {
            let info = Arc::new(ServerInfo::master());
            let (replicas, commands) = Replicas::new();

            tokio::spawn(replication::notify_loop(Arc::clone(&replicas), commands));

            server::run(listener, db, info, Some(replicas), signal::ctrl_c()).await;
        }
    }

    Ok(())
}

async fn replicate(
    host: &str,
    master_port: u16,
    listening_port: u16,
    db: Db,
    info: Arc<ServerInfo>,
) -> replikv::Result<()> {
    let mut client = Client::connect((host, master_port)).await?;
    client.handshake(listening_port).await?;

    info!(host, port = master_port, "replicating from master");

    client.replay(db, info).await
}

fn parse_replicaof(value: &str) -> replikv::Result<(String, u16)> {
    let mut parts = value.split_whitespace();

    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid master port {:?}", port))?;

            Ok((host.to_string(), port))
        }
        _ => Err(format!("--replicaof expects \"<host> <port>\", got {:?}", value).into()),
    }
}
