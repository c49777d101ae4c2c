//! jsonq broker binary.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;

use jsonq::config::BrokerConfig;
use jsonq::logging::{self, TraceSwitch};
use jsonq::server::{ControlChannel, ControlExit, Server};

/// How long blocking work (the stdin reader) may hold up process exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "jsonq", version)]
#[command(about = "Durable JSON message queue broker")]
struct Cli {
    /// TCP port to listen on
    #[arg(long, env = "JSONQ_PORT", conflicts_with = "socket")]
    port: Option<u16>,

    /// TCP bind address [default: 127.0.0.1]
    #[arg(long, env = "JSONQ_HOST")]
    host: Option<IpAddr>,

    /// Unix domain socket to listen on
    #[arg(long, env = "JSONQ_SOCKET")]
    socket: Option<PathBuf>,

    /// SQLite database file (in-memory when omitted)
    #[arg(long, env = "JSONQ_DB")]
    db: Option<PathBuf>,

    /// Minimum seconds between commits [default: 10]
    #[arg(long, value_name = "SECS")]
    commit_interval: Option<u64>,

    /// Start with verbose tracing on
    #[arg(long)]
    debug: bool,

    /// Log one JSON object per event
    #[arg(long)]
    log_json: bool,

    /// Do not read control commands from stdin
    #[arg(long)]
    no_control: bool,

    /// TOML configuration file; flags override its values
    #[arg(long, env = "JSONQ_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Load the configuration file, if any, and apply flag overrides.
    fn into_config(self) -> Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load_from(path)?,
            None => BrokerConfig::default(),
        };

        // A listener given on the command line replaces the file's.
        if let Some(port) = self.port {
            config.server.port = Some(port);
            config.server.socket = None;
        }
        if let Some(socket) = self.socket {
            config.server.socket = Some(socket);
            config.server.port = None;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(db) = self.db {
            config.storage.db = Some(db);
        }
        if let Some(secs) = self.commit_interval {
            config.storage.commit_interval_secs = secs;
        }
        config.logging.debug |= self.debug;
        config.logging.json |= self.log_json;
        if self.no_control {
            config.control = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn run(config: BrokerConfig) -> Result<()> {
    let validation = config.validate()?;
    let trace: Arc<dyn TraceSwitch> =
        Arc::new(logging::init(config.logging.debug, config.logging.json));
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }

    let server = Server::start(&config.server_config()?)
        .await
        .context("Failed to start broker")?;

    let control = config.control.then(|| {
        ControlChannel::new(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stderr(),
            server.broker().clone(),
            trace,
            server.sessions().clone(),
        )
    });

    let shutdown = async move {
        let Some(control) = control else {
            wait_for_interrupt().await;
            return;
        };
        tokio::select! {
            exit = control.run() => match exit {
                Ok(ControlExit::Exit) => tracing::info!("Exit requested"),
                Ok(ControlExit::InputClosed) => tracing::info!("Control input closed"),
                Err(e) => tracing::warn!(error = %e, "Control channel failed"),
            },
            () = wait_for_interrupt() => {},
        }
    };

    server
        .run_until(shutdown)
        .await
        .context("Broker stopped unexpectedly")
}

async fn wait_for_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupted"),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        },
    }
}
