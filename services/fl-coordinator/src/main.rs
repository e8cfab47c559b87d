use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use fl_coordinator::{http, CoordinatorConfig, FederatedLearningService};
use tracing::info;
use treefed_core::{clear_ready, init_metrics, init_tracing, load_config, mark_ready, start_health_server};

const SERVICE: &str = "fl-coordinator";

#[derive(Debug, Parser)]
#[command(name = SERVICE, about = "Federated tree-ensemble training coordinator")]
struct Args {
    /// Number of clients that make up a full session.
    #[arg(long)]
    expected_clients: Option<usize>,
    /// RPC listen address, e.g. 0.0.0.0:50051.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    model_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = load_config(SERVICE)?;
    if let Some(n) = args.expected_clients {
        if n == 0 {
            bail!("--expected-clients must be at least 1");
        }
        cfg.expected_clients = n;
    }
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(path) = args.model_path {
        cfg.model_save_path = path;
    }
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    init_metrics()?;
    info!(
        listen = %cfg.listen_addr,
        expected_clients = cfg.expected_clients,
        model_path = %cfg.model_save_path.display(),
        "starting_fl_coordinator"
    );

    let service = FederatedLearningService::new(CoordinatorConfig::new(cfg.expected_clients, &cfg.model_save_path));
    let status_source = service.clone();
    start_health_server(cfg.health_port, Arc::new(move || status_source.status_snapshot())).await?;
    let _health_check = service.spawn_health_check();

    let listener = http::bind(&cfg.listen_addr).await?;
    mark_ready();
    http::serve(listener, service, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown_signal_received");
        clear_ready();
    })
    .await?;
    info!("fl_coordinator_stopped");
    Ok(())
}
