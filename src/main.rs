//! Tenant DB Connector - Main entry point.
//!
//! Loads the configured tenants, builds the selected connector and probes each
//! requested tenant database with `SELECT 1`.

use clap::Parser;
use std::process::ExitCode;
use tenant_dbconnector::config::{Config, Driver};
use tenant_dbconnector::{CockroachConnector, Connector, Database, SqlConnector};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Connect to one tenant, run `SELECT 1` and close the connection.
async fn probe_tenant<C: Connector>(connector: &C, tenant_id: &str) -> tenant_dbconnector::Result<()> {
    let mut db = connector.connect(tenant_id).await?;
    let value: i32 = db.query_row("SELECT 1", &[]).await.scan()?.try_get(0)?;
    db.close().await?;
    info!(tenant_id = %tenant_id, value, "Tenant database is reachable");
    Ok(())
}

/// Probe the requested tenants (all of them when none are named). Returns the number
/// of failed probes.
async fn probe_all<C: Connector>(connector: &C, requested: &[String]) -> usize {
    let tenant_ids: Vec<String> = if requested.is_empty() {
        let index = connector.tenants().await;
        index.tenant_ids().into_iter().map(String::from).collect()
    } else {
        requested.to_vec()
    };

    info!(count = tenant_ids.len(), "Probing tenant databases");

    let mut failures = 0;
    for tenant_id in &tenant_ids {
        if let Err(e) = probe_tenant(connector, tenant_id).await {
            error!(tenant_id = %tenant_id, code = ?e.code(), error = %e, "Tenant probe failed");
            failures += 1;
        }
    }
    failures
}

async fn run(config: Config) -> Result<usize, Box<dyn std::error::Error>> {
    let provider = config.tenant_provider()?;
    let options = config.connector_options();

    info!(
        driver = %config.driver,
        "Starting tenant-dbconnector v{}",
        env!("CARGO_PKG_VERSION")
    );

    let failures = match config.driver {
        Driver::Sql => {
            let connector = SqlConnector::new(provider, options).await?;
            probe_all(&connector, &config.probe).await
        }
        Driver::Cockroach => {
            let connector =
                CockroachConnector::new(provider, options, config.retry_policy()).await?;
            probe_all(&connector, &config.probe).await
        }
    };
    Ok(failures)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    match run(config).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            error!(failures, "Some tenant probes failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}
