use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use chainwatch_aml::automation::controller::AutomationController;
use chainwatch_aml::automation::jobs::JobStatus;
use chainwatch_aml::bulk::{analyze_many, read_addresses, write_csv};
use chainwatch_aml::config::Config;
use chainwatch_aml::engine::Engine;
use chainwatch_aml::feed::log_events;
use chainwatch_aml::graph::memory::MemoryGraph;
use chainwatch_aml::graph::postgres::PgGraphStore;
use chainwatch_aml::graph::store::GraphStore;
use chainwatch_aml::sanctions::{load_sanctions_csv, seed_sanctions};

// Usage:
//   chainwatch-aml [config.toml]                          serve the automation API
//   chainwatch-aml <config.toml> bulk <in.txt> [out.csv]  analyze an address list and exit
#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("ChainWatch AML starting");

    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).cloned().unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!("Configuration loaded from {}", config_path);

    // Graph store: Postgres when configured, in-memory otherwise
    let store: Arc<dyn GraphStore> = match &config.database.url {
        Some(url) => {
            let pg = PgGraphStore::connect(url, config.database.max_connections)
                .await
                .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;
            tracing::info!("Connected to PostgreSQL");
            pg.migrate()
                .await
                .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;
            tracing::info!("Database migrations complete");
            Arc::new(pg)
        }
        None => {
            tracing::warn!("No database configured, using the in-memory graph store");
            Arc::new(MemoryGraph::new())
        }
    };

    if let Some(ref path) = config.sanctions.csv_path {
        match load_sanctions_csv(path) {
            Ok(entries) => {
                let created = seed_sanctions(store.as_ref(), &entries).await?;
                tracing::info!(entries = entries.len(), created, "Sanctions list seeded");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load sanctions list, continuing without"),
        }
    }

    let engine = Arc::new(Engine::from_config(config, store)?);
    tokio::spawn(log_events(engine.feed.subscribe()));

    if args.get(2).map(String::as_str) == Some("bulk") {
        let input = args
            .get(3)
            .ok_or_else(|| eyre::eyre!("bulk mode needs an address file"))?;
        let addresses = read_addresses(input)?;
        let report = analyze_many(&engine, &addresses, engine.config.automation.bulk_workers).await;
        if let Some(output) = args.get(4) {
            write_csv(output, &report.rows)?;
        }
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
        return Ok(());
    }

    let controller = Arc::new(AutomationController::new(engine.clone()));

    // Spawn API server
    if engine.config.api.enabled {
        let controller = controller.clone();
        let host = engine.config.api.host.clone();
        let port = engine.config.api.port;
        tokio::spawn(async move {
            if let Err(e) = chainwatch_aml::api::serve(controller, &host, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    tracing::info!("ChainWatch AML running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");
    for job in controller.list(None, Some(JobStatus::Started)).await {
        let _ = controller.cancel(&job.id).await;
    }

    tracing::info!("ChainWatch AML stopped gracefully");
    Ok(())
}
