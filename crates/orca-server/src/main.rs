mod launcher;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use orca_core::{start_controller, ControlServer, ControllerConfig, PoolConfig};

use crate::launcher::ScriptVmLauncher;

/// Orca control-plane daemon: owns a VM pool, multiplexes job I/O, and
/// speaks the control-socket protocol described by the orchestrator core.
///
/// This binary's surface is deliberately thin — job submission, status
/// queries and the like are a separate client talking the wire protocol,
/// not flags on this process.
#[derive(Parser, Debug)]
#[command(name = "orca-server", version, about)]
struct Cli {
    /// Control socket path; a sibling `.pid` file is written alongside it.
    #[arg(long, env = "ORCA_SOCKET", default_value = "/tmp/orca-pool/control.sock")]
    socket: PathBuf,

    /// Directory for per-worker control sockets and VM state.
    #[arg(long, env = "ORCA_POOL_DIR", default_value = "/tmp/orca-pool")]
    pool_dir: PathBuf,

    /// Workers kept running even when idle. Defaults to the host-advisory
    /// formula (§4.4) when unset.
    #[arg(long, env = "ORCA_WARM_SIZE")]
    warm_size: Option<u32>,

    /// Hard ceiling on concurrently running workers. Defaults to the
    /// host-advisory formula (§4.4) when unset.
    #[arg(long, env = "ORCA_MAX_SIZE")]
    max_size: Option<u32>,

    /// Tracing filter, e.g. `info` or `orca_core=debug`.
    #[arg(long, env = "ORCA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// External command to launch one VM: invoked as `<cmd> <id>
    /// <socket_path>` and expected to return promptly after arranging for
    /// the in-guest agent to eventually listen on `socket_path`.
    #[arg(long, env = "ORCA_VM_LAUNCH_CMD")]
    vm_launch_cmd: PathBuf,

    /// External command to terminate one VM: invoked as `<cmd> <id>`.
    #[arg(long, env = "ORCA_VM_TERMINATE_CMD")]
    vm_terminate_cmd: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (warm_advisory, max_advisory) = PoolConfig::advisory_sizing();
    let warm_size = cli.warm_size.unwrap_or(warm_advisory);
    let max_size = cli.max_size.unwrap_or(max_advisory);

    let pool = PoolConfig::new(cli.pool_dir.clone(), cli.socket.clone(), warm_size, max_size);
    let launcher = Arc::new(ScriptVmLauncher::new(
        cli.vm_launch_cmd,
        cli.vm_terminate_cmd,
        cli.pool_dir.join("workers"),
    ));

    tracing::info!(
        socket = %cli.socket.display(),
        pool_dir = %cli.pool_dir.display(),
        warm_size,
        max_size,
        "starting orca-server"
    );

    let max_frame_bytes = pool.max_frame_bytes;
    let controller = start_controller(ControllerConfig { pool, launcher });

    let server = match ControlServer::bind(cli.socket.clone(), controller.clone(), max_frame_bytes).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "failed to bind control socket");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                tracing::error!("failed to install ctrl-c handler");
            }
            tracing::info!("received interrupt, shutting down");
            let _ = controller.shutdown().await;
            shutdown.notify_one();
            let _ = (&mut server_task).await;
            std::process::exit(130);
        }
        _ = &mut server_task => {}
    }

    Ok(())
}
