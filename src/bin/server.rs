//! OrionKV Server Binary
//!
//! Boot order: read configuration, rehydrate the engine from the snapshot,
//! replay the append log, then start the durability and replication threads
//! and hand the process to the reactor.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use orionkv::network::Server;
use orionkv::replica::ReplicaClient;
use orionkv::wal::Wal;
use orionkv::{snapshot, wal, Config, Engine};

/// OrionKV Server
#[derive(Parser, Debug)]
#[command(name = "orionkv-server")]
#[command(about = "In-memory key-value server with ordered sets, logging and replication")]
#[command(version)]
struct Args {
    /// Listen port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Plain-text configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,orionkv=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    // -h/--help and --version exit 0; a bad argument must exit 1 with a
    // diagnostic, not clap's usage exit code
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    tracing::info!("OrionKV v{}", orionkv::VERSION);
    tracing::info!(
        "bind {}, snapshots {}, log {}, replica {}",
        config.listen_addr(),
        if config.rdb.enabled { "on" } else { "off" },
        if config.aof.enabled {
            format!("on ({:?})", config.aof.mode)
        } else {
            "off".to_string()
        },
        if config.replica.enabled { "on" } else { "off" },
    );

    let engine = Arc::new(Engine::new());

    // snapshot first, then the log replay on top of it
    if config.rdb.enabled {
        if let Err(e) = snapshot::load(&engine, &config.rdb_path()) {
            tracing::error!("snapshot load failed: {}", e);
            std::process::exit(1);
        }
    }

    let wal_handle = if config.aof.enabled {
        let path = PathBuf::from(&config.aof.path);
        if let Err(e) = wal::load(&path, &engine) {
            tracing::error!("log replay failed: {}", e);
            std::process::exit(1);
        }
        match Wal::open(&config.aof) {
            Ok(wal) => Some(Arc::new(wal)),
            Err(e) => {
                tracing::error!("cannot open append log: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let mut replica = ReplicaClient::start(&config, Arc::clone(&engine));

    let mut server = Server::new(config, engine, wal_handle);
    let result = server.run();

    if let Some(replica) = replica.as_mut() {
        replica.stop();
    }

    if let Err(e) = result {
        tracing::error!("server error: {}", e);
        std::process::exit(1);
    }
    tracing::info!("clean shutdown");
}
