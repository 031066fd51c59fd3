use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use rust_loadharness::client::Client;
use rust_loadharness::config::Config;
use rust_loadharness::frontend::Frontend;
use rust_loadharness::logging::init_logging;
use rust_loadharness::metrics::{gather_metrics_string, register_metrics, start_metrics_server};

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "Distributed load-generation harness: clients pace requests through frontends under a leasing load balancer."
)]
struct Cli {
    /// Configuration file name (.json or .yaml)
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Generate load through a leased frontend
    Client,
    /// Proxy client requests to the backend
    Frontend,
}

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Configuration file sections:");
    eprintln!("  loadBalancer.hosts / loadBalancer.port  - Load balancer address (required)");
    eprintln!("  client.port, client.initialTimeout      - Client listening port and starting timeout");
    eprintln!("  frontend.port, frontend.initialTimeout  - Frontend listening port and starting timeout");
    eprintln!("  pacer.minTimeout, pacer.maxTimeout      - Bounds for every adaptive timeout");
    eprintln!("  metrics.port                            - Prometheus endpoint (optional)");
    eprintln!();
    eprintln!("Environment overrides:");
    eprintln!("  HARNESS_LB_ADDR, HARNESS_CLIENT_PORT, HARNESS_FRONTEND_PORT, HARNESS_METRICS_PORT");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error in {}: {}\n", cli.config.display(), e);
            print_config_help();
            std::process::exit(1);
        }
    };
    config.print_summary();

    register_metrics()?;
    if let Some(port) = config.metrics_port {
        let registry = prometheus::default_registry().clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    match cli.role {
        Role::Client => Client::connect(&config).await?.run().await?,
        Role::Frontend => Frontend::connect(&config).await?.run().await?,
    }

    debug!(
        metrics = %gather_metrics_string(prometheus::default_registry()),
        "Final metrics"
    );
    // Killed: end immediately without draining in-flight requests.
    std::process::exit(0);
}
