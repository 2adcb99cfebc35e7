//! converge CLI
//!
//! Runs one GPU operator CI step against the current cluster.

use clap::Parser;
use converge_kube::telemetry::init_telemetry;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use converge_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.telemetry())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current attempt");
            on_signal.cancel();
        }
    });

    let result = cli.run(cancel).await;
    if let Err(e) = &result {
        error!(error = %e, "Step failed");
    }
    result
}
