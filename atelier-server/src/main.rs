//! Atelier sync server: canvas synchronisation for the local network.
//!
//! Runs the WebSocket endpoint that desktop and mobile clients connect to.
//! When launched by the desktop shell with `--control-stdio`, stdout carries
//! line-delimited JSON status replies and stdin carries commands; logs always
//! go to stderr.
//!
//! ```text
//! atelier-server [OPTIONS]
//!
//!   --port <PORT>                  [env: PORT]            [default: 8080]
//!   --host <HOST>                  [env: HOST]            [default: 0.0.0.0]
//!   --storage-path <DIR>           [env: STORAGE_PATH]    [default: atelier_data/workspace]
//!   --in-memory                    keep the canvas in memory only
//!   --autosave-secs <SECS>         [env: AUTOSAVE_SECS]   [default: 30]
//!   --broadcast-capacity <FRAMES>  [env: BROADCAST_CAPACITY] [default: 1024]
//!   --control-stdio                [env: CONTROL_STDIO]
//! ```

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use atelier_sync::control::{self, ControlReply, ControlWriter, ServerStatus};
use atelier_sync::server::{ServerConfig, ServerError, SyncServer};
use clap::Parser;
use tokio::io::Stdout;
use tokio::sync::oneshot;

/// Upper bound on graceful shutdown before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "atelier-server",
    about = "Real-time canvas sync server for Atelier clients",
    version
)]
struct Cli {
    /// TCP port for the WebSocket endpoint.
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// Interface to bind; `0.0.0.0` accepts LAN clients.
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// RocksDB directory holding the canvas.
    #[arg(long, default_value = "atelier_data/workspace", env = "STORAGE_PATH")]
    storage_path: PathBuf,

    /// Do not persist anything.
    #[arg(long)]
    in_memory: bool,

    /// Seconds between full-state safety saves.
    #[arg(long, default_value_t = 30, env = "AUTOSAVE_SECS")]
    autosave_secs: u64,

    /// Outbound frames buffered per client before it is dropped.
    #[arg(long, default_value_t = 1024, env = "BROADCAST_CAPACITY")]
    broadcast_capacity: usize,

    /// Speak the JSON control protocol on stdin/stdout.
    #[arg(long, env = "CONTROL_STDIO")]
    control_stdio: bool,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        anyhow::ensure!(self.autosave_secs > 0, "--autosave-secs must be positive");
        anyhow::ensure!(
            self.broadcast_capacity > 0,
            "--broadcast-capacity must be positive"
        );
        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            storage_path: (!self.in_memory).then(|| self.storage_path.clone()),
            broadcast_capacity: self.broadcast_capacity,
            autosave_interval: Duration::from_secs(self.autosave_secs),
        })
    }
}

type Control = Option<ControlWriter<Stdout>>;

async fn report(control: &mut Control, reply: ControlReply) {
    if let Some(writer) = control {
        if let Err(e) = writer.send(&reply).await {
            log::warn!("failed to report to host: {e}");
        }
    }
}

/// Human-readable startup failure for the host.
fn startup_message(err: &ServerError, port: u16) -> String {
    match err {
        ServerError::Bind { source, .. } if source.kind() == ErrorKind::AddrInUse => {
            format!("Port {port} is already in use")
        }
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.server_config().context("invalid configuration")?;
    let mut control: Control = cli.control_stdio.then(|| ControlWriter::new(tokio::io::stdout()));

    report(&mut control, ControlReply::status(ServerStatus::Starting, None)).await;
    log::info!("starting atelier-server on {}", config.bind_addr());

    let server = match SyncServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            let message = startup_message(&e, cli.port);
            log::error!("startup failed: {message}");
            report(&mut control, ControlReply::error(message)).await;
            std::process::exit(1);
        }
    };

    let port = server.local_addr().port();
    let engine = server.engine();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));
    report(&mut control, ControlReply::status(ServerStatus::Running, Some(port))).await;

    match control.as_mut() {
        Some(writer) => tokio::select! {
            exit = control::serve(tokio::io::stdin(), writer, &engine, port) => match exit {
                Ok(exit) => log::info!("control channel ended: {exit:?}"),
                Err(e) => log::error!("control channel failed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => log::info!("interrupted"),
        },
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            log::info!("interrupted");
        }
    }

    report(&mut control, ControlReply::status(ServerStatus::Stopping, Some(port))).await;
    let _ = stop_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
        Ok(Ok(Ok(()))) => log::info!("server stopped"),
        Ok(Ok(Err(e))) => log::error!("server stopped with error: {e}"),
        Ok(Err(e)) => log::error!("server task failed: {e}"),
        Err(_) => {
            log::error!("graceful shutdown exceeded {SHUTDOWN_GRACE:?}, forcing exit");
            report(&mut control, ControlReply::status(ServerStatus::Stopped, None)).await;
            std::process::exit(1);
        }
    }

    report(&mut control, ControlReply::status(ServerStatus::Stopped, None)).await;
    Ok(())
}
