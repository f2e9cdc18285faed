mod cli;
mod driver;

use std::sync::Arc;

use clap::Parser;
use fleet_core::clock::SystemClock;
use fleet_core::config::{ConfigLoader, FleetConfig, LogFormat, SafeDisplay};
use fleet_core::db::postgres::{migrate, PostgresPool};
use fleet_core::proxy_registry::ProxyRegistry;
use fleet_core::queue::TaskQueue;
use fleet_core::repo::{DbMessageRepo, DbProfileRepo, DbProxyRepo, DbStatsRepo, DbTaskRepo, StatsRepo};
use fleet_core::supervisor::Supervisor;
use fleet_core::worker::WorkerContext;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use driver::LoggingStubDriver;

fn init_tracing(config: &FleetConfig) {
    let filter = EnvFilter::try_new(&config.tracing.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.tracing.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<FleetConfig> {
    let config = ConfigLoader::new(&cli.config_file).load()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    tracing::info!("effective configuration:\n{}", config.to_safe_string());

    match cli.command {
        Command::Migrate => {
            migrate(&config.db).await?;
            tracing::info!("migrations applied");
        }
        Command::Status { group } => {
            let pool = PostgresPool::configured(&config.db).await?;
            let stats = DbStatsRepo::new(pool);
            let group_id = fleet_core::model::GroupId(group);
            let progress = stats.group_progress(group_id).await?;
            println!(
                "group {}: {} total, {} completed, {} blocked, {} in_progress",
                progress.group_id.0,
                progress.total_tasks,
                progress.completed_tasks,
                progress.blocked_tasks,
                progress.in_progress_tasks
            );
        }
        Command::Start { group, workers } => {
            migrate(&config.db).await?;
            let pool = PostgresPool::configured(&config.db).await?;

            let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
            let proxy_repo = Arc::new(DbProxyRepo::new(pool.clone()));
            let message_repo = Arc::new(DbMessageRepo::new(pool.clone()));
            let profile_repo = Arc::new(DbProfileRepo::new(pool.clone()));

            let queue = Arc::new(TaskQueue::new(task_repo));
            let proxies = Arc::new(ProxyRegistry::new(proxy_repo, config.proxy));

            let ctx = Arc::new(WorkerContext {
                queue,
                proxies,
                messages: message_repo,
                profiles: profile_repo,
                driver: Arc::new(LoggingStubDriver),
                classifier: config.classifier,
                rate: config.rate,
                timeouts: config.timeouts,
                clock: Arc::new(SystemClock),
            });

            let supervisor = Supervisor::new(ctx, config.supervisor);
            let cancel = supervisor.cancellation_token();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received interrupt, requesting graceful shutdown");
                    cancel.cancel();
                }
            });

            let group_id = fleet_core::model::GroupId(group);
            let stale_claim_grace = chrono::Duration::from_std(config.timeouts.stale_claim_grace)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let report = supervisor.run(group_id, workers, stale_claim_grace).await?;
            tracing::info!(
                run_id = ?report.run_id,
                workers_started = report.workers_started,
                permanently_stopped = report.permanently_stopped.len(),
                "run finished"
            );
        }
    }

    Ok(())
}
