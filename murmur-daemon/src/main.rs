// Murmur daemon: multicast transport, heartbeat, retry scheduler and console.

mod command;
mod config;
mod host;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use murmur_core::{LocalIdentity, MurmurCore, PeerId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::host::Host;
use crate::transport::Transport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("murmur-daemon {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let identity = LocalIdentity {
        id: PeerId(cfg.resolve_peer_id()),
        name: cfg.name.clone(),
        level: cfg.level,
    };
    info!(peer = %identity.id, name = %identity.name, "starting");
    let core = Arc::new(MurmurCore::new(identity, &cfg.protocol));

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg, core));
    // The console task sits in a blocking stdin read that never returns on its own.
    rt.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn run(cfg: config::Config, core: Arc<MurmurCore>) -> anyhow::Result<()> {
    let transport = Arc::new(
        Transport::bind(cfg.group, cfg.port)
            .with_context(|| format!("joining {}:{}", cfg.group, cfg.port))?,
    );
    info!(addr = %transport.local_addr()?, group = %cfg.group, "listening");
    println!("* you are {} ({}), /help for commands", cfg.name, core.local_id());

    let host = Arc::new(Host::new(core, transport.clone(), cfg.download_dir.clone()));
    let heartbeat = Duration::from_millis(cfg.heartbeat_ms.max(1));
    let tasks = [
        tokio::spawn(host::recv_loop(host.clone())),
        tokio::spawn(host::heartbeat_loop(host.clone(), heartbeat)),
        tokio::spawn(host::retry_loop(host.clone())),
    ];
    let console = tokio::spawn(host::command_loop(host.clone()));

    let mut closed = transport.subscribe();
    tokio::select! {
        r = shutdown_signal() => r?,
        _ = closed.wait_for(|c| *c) => {}
    }
    info!(discarded = host.core.discarded_frames(), "shutting down");
    transport.close();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task failed");
        }
    }
    console.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
