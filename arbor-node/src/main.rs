// Arbor node: stem server, simulated sensor endpoint or mobile client.

mod accounts;
mod config;
mod handlers;
mod logging;
mod mobile;
mod server;
mod simulation;

use std::future::Future;

use arbor_core::Identity;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: arbor [stem|sensor|mobile] [--version]";

enum Mode {
    Stem,
    Sensor,
    Mobile,
}

impl From<Identity> for Mode {
    fn from(role: Identity) -> Self {
        match role {
            Identity::SensorEndpoint => Mode::Sensor,
            Identity::MobileUser => Mode::Mobile,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut mode = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("arbor {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                return Ok(());
            }
            "stem" => mode = Some(Mode::Stem),
            "sensor" => mode = Some(Mode::Sensor),
            "mobile" => mode = Some(Mode::Mobile),
            other => anyhow::bail!("unknown argument {:?}\n{}", other, USAGE),
        }
    }

    logging::setup_log();
    let cfg = config::load();
    let mode = mode
        .or_else(|| cfg.role.map(Mode::from))
        .unwrap_or(Mode::Stem);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match mode {
            Mode::Stem => server::run_stem(&cfg).await,
            Mode::Sensor => until_shutdown(simulation::run_sensor(&cfg)).await,
            Mode::Mobile => until_shutdown(mobile::run_mobile(&cfg)).await,
        }
    })
}

async fn until_shutdown(run: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    tokio::select! {
        res = run => res,
        res = shutdown_signal() => {
            info!("shutting down");
            res
        }
    }
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
