use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;

use crate::analytics::UptimeAnalytics;
use crate::cli::{Args, Command};
use crate::config::{AppConfig, DatabaseBackend, StatusLogBackend};
use crate::container::ContainerPatch;
use crate::ingestion::{KafkaQueue, QueueError, StatusIngestor};
use crate::orchestrator::{ImportRow, LifecycleOrchestrator};
use crate::runtime::{DockerRuntime, RuntimeError};
use crate::status_log::{ElasticStatusLog, MemoryStatusLog, StatusLog};
use crate::store::{MemoryStore, MetadataStore, PostgresStore};

mod analytics;
mod cli;
mod config;
mod container;
mod error;
mod ingestion;
mod orchestrator;
mod runtime;
mod signals;
mod status_log;
mod store;
#[cfg(test)]
mod testing;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Core(#[from] error::Error),
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Stats {
    total: u64,
    running: u64,
    containers: Vec<container::ContainerName>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load config {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    match run(args.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn MetadataStore>, AppError> {
    match config.database.backend {
        DatabaseBackend::Postgres => {
            let store =
                PostgresStore::connect(&config.database.url, config.database.max_connections)
                    .await?;
            store.ensure_schema().await?;
            log::info!("Connected to PostgreSQL");
            Ok(Arc::new(store))
        }
        DatabaseBackend::Memory => {
            log::warn!("Using in-memory metadata store, records are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_status_log(config: &AppConfig) -> Arc<dyn StatusLog> {
    match config.status_log.backend {
        StatusLogBackend::Elasticsearch => Arc::new(ElasticStatusLog::new(
            &config.status_log.url,
            config.status_log.index.clone(),
        )),
        StatusLogBackend::Memory => {
            log::warn!("Using in-memory status log, events are lost on exit");
            Arc::new(MemoryStatusLog::new())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Command, config: AppConfig) -> Result<(), AppError> {
    let status_log = build_status_log(&config);

    match command {
        Command::Consume => {
            let store = build_store(&config).await?;
            let queue = KafkaQueue::connect(
                &config.kafka.brokers,
                &config.kafka.group_id,
                &config.kafka.topic,
            )?;
            let ingestor = StatusIngestor::new(
                Arc::new(queue),
                store,
                status_log,
                config.ingestion.max_in_flight,
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            signals::handle_shutdown(shutdown_tx)?;
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            ingestor.run(shutdown_rx).await;
            ingestor.close().await?;
            log::info!("Service shutdown complete");
            Ok(())
        }
        Command::UptimeRatio { start, end } => {
            let ratio = UptimeAnalytics::new(status_log).uptime_ratio(start, end).await?;
            print_json(&serde_json::json!({ "uptime_ratio": ratio }))
        }
        Command::UptimeDuration { start, end } => {
            let details = UptimeAnalytics::new(status_log)
                .uptime_duration(start, end)
                .await?;
            print_json(&details)
        }
        command => {
            let store = build_store(&config).await?;
            let runtime =
                DockerRuntime::connect_with_local_defaults(config.docker.stop_timeout_secs)?;
            let orchestrator = LifecycleOrchestrator::new(Arc::new(runtime), store, status_log);
            administer(&orchestrator, command).await
        }
    }
}

async fn administer(orchestrator: &LifecycleOrchestrator, command: Command) -> Result<(), AppError> {
    match command {
        Command::Create { name, image } => {
            let id = orchestrator.create_container(&name, &image).await?;
            print_json(&serde_json::json!({ "id": id }))
        }
        Command::Update {
            id,
            image,
            status,
            fields,
        } => {
            let patch = ContainerPatch::from_fields(&cli::update_fields(image, status, fields))?;
            let updated = orchestrator.update_container(id, patch).await?;
            print_json(&updated)
        }
        Command::Delete { id } => {
            orchestrator.delete_container(id).await?;
            Ok(())
        }
        Command::List(list) => {
            let (total, containers) = orchestrator.view_all_containers(&list.to_query()).await?;
            print_json(&serde_json::json!({ "total": total, "containers": containers }))
        }
        Command::Import { file } => {
            let rows: Vec<ImportRow> = serde_json::from_str(&std::fs::read_to_string(file)?)?;
            let report = orchestrator.import_containers(rows).await?;
            print_json(&report)
        }
        Command::Export { list, output } => {
            let containers = orchestrator.export_containers(&list.to_query()).await?;
            let rendered = serde_json::to_string_pretty(&containers)?;
            match output {
                Some(path) => std::fs::write(path, rendered)?,
                None => println!("{rendered}"),
            }
            Ok(())
        }
        Command::RecordStatus { id, status } => {
            orchestrator.add_container_status(id, &status).await?;
            Ok(())
        }
        Command::Stats => {
            let stats = Stats {
                total: orchestrator.count_containers().await?,
                running: orchestrator.count_running_containers().await?,
                containers: orchestrator.container_names().await?,
            };
            print_json(&stats)
        }
        Command::Consume | Command::UptimeRatio { .. } | Command::UptimeDuration { .. } => {
            Ok(())
        }
    }
}
