//! forge CLI
//!
//! Provisions and operates Kubernetes clusters with terraform and helm.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cluster_forge::telemetry::init_logging;
use cluster_forge::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_config())?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping the running operation");
            interrupt.cancel();
        }
    });

    if let Err(e) = cli.run(cancel).await {
        if e.is_declined() {
            info!(error = %e, "stopped at operator request");
            println!("\nAborted.");
            return Ok(());
        }
        if e.is_cancelled() {
            warn!("operation cancelled");
            std::process::exit(130);
        }
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
    Ok(())
}
