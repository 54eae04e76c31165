use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use nectar::configuration::Config;
use nectar::Supervisor;

#[tokio::main]
async fn main() {
    // Respect RUST_LOG for the overall level; keep the storage layer quiet
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sea_orm", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .filter_module("russh", log::LevelFilter::Warn)
        .format_target(false)
        .init();

    println!(
        "
    ███╗   ██╗███████╗ ██████╗████████╗ █████╗ ██████╗
    ████╗  ██║██╔════╝██╔════╝╚══██╔══╝██╔══██╗██╔══██╗
    ██╔██╗ ██║█████╗  ██║        ██║   ███████║██████╔╝
    ██║╚██╗██║██╔══╝  ██║        ██║   ██╔══██║██╔══██╗
    ██║ ╚████║███████╗╚██████╗   ██║   ██║  ██║██║  ██║
    ╚═╝  ╚═══╝╚══════╝ ╚═════╝   ╚═╝   ╚═╝  ╚═╝╚═╝  ╚═╝
    ====================================================
         SSH honeypot proxy v{}
    ====================================================
    ",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::parse();
    info!("starting on {}", config.bind_address);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = match Supervisor::start(config, shutdown_rx).await {
        Ok(s) => s,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let supervisor_handle = tokio::spawn(async move {
        if let Err(e) = supervisor.run().await {
            error!("supervisor error: {}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received, draining..."),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    if shutdown_tx.send(true).is_err() {
        error!("supervisor already gone");
    }

    match tokio::time::timeout(tokio::time::Duration::from_secs(30), supervisor_handle).await {
        Ok(Ok(())) => info!("shutdown completed"),
        Ok(Err(e)) => error!("supervisor task failed during shutdown: {:?}", e),
        Err(_) => error!("shutdown timed out after 30 seconds"),
    }
}
