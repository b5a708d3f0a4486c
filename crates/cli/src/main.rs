use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;

use jobqueue_infra::{EnqueueOptions, JobQueue, JobStore, PostgresJobStore, QueueConfig, Reaper};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    jobqueue_observability::init();
    let cli = Cli::parse();

    let mut config = QueueConfig::from_env().context("invalid JOBQUEUE_* configuration")?;
    if let Some(queue) = cli.queue {
        config = config.with_queue_name(queue);
        config.validate()?;
    }

    let store = Arc::new(
        PostgresJobStore::connect(&cli.database_url, cli.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );

    match cli.command {
        Command::Migrate => {
            store.ensure_schema().await?;
            info!("schema is up to date");
        }
        Command::Stats => {
            let queue = JobQueue::new(store, config)?;
            let stats = queue.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reap => {
            let reaper = Reaper::new(store, config.queue()?, config.retention);
            let deleted = reaper.reap(Utc::now()).await?;
            println!("deleted {deleted} jobs");
        }
        Command::Enqueue {
            job_type,
            payload,
            delay,
            priority,
            max_retries,
        } => {
            let queue = JobQueue::new(store, config)?;
            let options = EnqueueOptions {
                delay,
                priority,
                max_retries,
            };
            let id = queue.enqueue(&job_type, payload, options).await?;
            println!("{id}");
        }
        Command::Show { id } => {
            let job = store
                .get(id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}
