use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use timbel_config::Config;
use timbel_core::utils::{queue_of, DlqStatus, DrainSummary, FileStore};
use timbel_core::{init_logging_from, DeadLetterQueue, DlqConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "timbel", about = "Timbel - resilience tooling", version)]
struct Cli {
    /// Override the DLQ persistence directory
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and recover persisted dead letter queues
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// Count persisted records per queue and action
    Inspect {
        #[arg(long)]
        name: Option<String>,
    },
    /// Reload a queue from disk and print its status
    Recover {
        #[arg(long)]
        name: String,
    },
    /// Reload a queue and attempt every item until it is delivered or
    /// permanently failed. Items nothing can replay end as permanent failures.
    Drain {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = cli.dir {
        config.dlq_persist_path = dir;
    }
    init_logging_from(&config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Dlq { command } => match command {
            DlqCommand::Inspect { name } => inspect(&config, name.as_deref()).await?,
            DlqCommand::Recover { name } => {
                let queue = open_queue(&config, &name).await?;
                print_status(&queue.get_status().await)?;
            }
            DlqCommand::Drain { name } => {
                let (summary, status) = drain(&config, &name).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                print_status(&status)?;
            }
        },
    }
    Ok(())
}

async fn inspect(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let store = FileStore::new(&config.dlq_persist_path);
    let records = store
        .list_records()
        .await
        .with_context(|| format!("Failed to read {}", store.dir().display()))?;

    let mut summary: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for record in &records {
        let Some(queue) = queue_of(&record.item.id) else {
            continue;
        };
        if name.is_some_and(|n| n != queue) {
            continue;
        }
        *summary
            .entry(queue.to_string())
            .or_default()
            .entry(record.action.to_string())
            .or_default() += 1;
    }

    info!(records = records.len(), queues = summary.len(), "Persisted DLQ records scanned");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn open_queue(config: &Config, name: &str) -> anyhow::Result<DeadLetterQueue> {
    let queue = DeadLetterQueue::new(
        name,
        DlqConfig {
            auto_process: false,
            ..DlqConfig::from_settings(config)
        },
    );
    let recovered = queue
        .recover_from_disk()
        .await
        .with_context(|| format!("Failed to recover queue {name}"))?;
    info!(queue = %name, recovered, "Queue loaded from disk");
    Ok(queue)
}

async fn drain(config: &Config, name: &str) -> anyhow::Result<(DrainSummary, DlqStatus)> {
    let queue = open_queue(config, name).await?;
    let Some(summary) = queue.drain().await else {
        bail!("Queue {name} is already being processed");
    };
    Ok((summary, queue.get_status().await))
}

fn print_status(status: &DlqStatus) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use timbel_core::utils::{DlqStore, PersistAction};

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::load().unwrap();
        config.dlq_persist_path = dir.to_path_buf();
        config.dlq_max_retries = 3;
        config
    }

    #[tokio::test]
    async fn drain_settles_recovered_items_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());

        let seeded = DeadLetterQueue::new("jobs", DlqConfig::from_settings(&config));
        let id = seeded.add(json!({ "job": 1 }), Map::new()).await;
        drop(seeded);

        let (summary, status) = drain(&config, "jobs").await.unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(status.queue_size, 0);

        let store = FileStore::new(tmp.path());
        assert!(store.recover("jobs").await.unwrap().is_empty());
        assert!(tmp
            .path()
            .join(format!("{id}_{}.json", PersistAction::PermanentFailure))
            .exists());

        let (again, _) = drain(&config, "jobs").await.unwrap();
        assert_eq!(again.attempts, 0);
    }
}
