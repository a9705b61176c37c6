mod cli;
mod constants;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fabric_agent_core::metrics::HostSampler;
use fabric_agent_core::profile::build_worker_profile;
use fabric_agent_engine::{StartError, start_agent};

use crate::cli::Cli;
use crate::constants::{EXIT_INTERRUPTED, EXIT_NO_OPS_ENABLED};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_signal_handler};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let sampler = HostSampler::new();
    let profile = build_worker_profile(
        &cli.profile_options(),
        Some(sampler.available_memory_bytes()),
    );
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        total_cores = profile.cpu.total_cores,
        usable_cores = profile.cpu.usable_cores,
        soft_cap = profile.cpu.soft_cap,
        gpu_present = profile.gpu.gpu_present,
        tpu_present = profile.tpu.tpu_present,
        "host profile built"
    );

    let handle = start_agent(cli.agent_config(profile));

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(shutdown, shutdown_tx);

    let remote = handle.remote();
    tokio::spawn(async move {
        while let Some(ev) = shutdown_rx.recv().await {
            match ev {
                ShutdownEvent::Graceful => {
                    tracing::info!(
                        "stop requested; finishing in-flight ops (signal again to exit immediately)"
                    );
                    remote.request_stop();
                }
                ShutdownEvent::Immediate => {
                    tracing::warn!("second stop signal; exiting immediately");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            }
        }
    });

    match handle.wait().await {
        Ok(()) => {}
        Err(err) if err.downcast_ref::<StartError>().is_some() => {
            tracing::error!(%err, "refusing to start");
            std::process::exit(EXIT_NO_OPS_ENABLED);
        }
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "agent failed");
            std::process::exit(1);
        }
    }
}
