//! Rollout director
//!
//! Runs planned instance groups through the rollout engine against the
//! simulated provider and agents, printing progress events as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollout_director::{
    cancel::Cancellation,
    clock::TokioSleeper,
    collaborators::StoreInstanceDeleter,
    config::DirectorConfig,
    plan::{InstancePlan, TargetState},
    progress::{ProgressReporter, StdoutEventSink},
    rollout::{GroupRollout, RolloutScheduler},
    sim::SimFleet,
    store::{InstanceRecord, Store},
    InstanceUpdater,
};
use rollout_id::{InstanceId, TaskId};
use rollout_reconcile::UpdateConfig;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rolling update director.
#[derive(Debug, Parser)]
#[command(name = "director")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Converge the instance groups of a plan file.
    Converge {
        /// JSON plan file.
        #[arg(long, env = "ROLLOUT_PLANS")]
        plans: PathBuf,

        /// Only roll out this instance group.
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    groups: Vec<PlannedGroup>,
}

#[derive(Debug, Deserialize)]
struct PlannedGroup {
    name: String,
    update: UpdateConfig,
    plans: Vec<PlannedInstance>,
    #[serde(default)]
    unneeded: Vec<InstanceId>,
}

#[derive(Debug, Deserialize)]
struct PlannedInstance {
    #[serde(flatten)]
    plan: InstancePlan,

    /// Pre-existing VM to create in the simulated fleet before the run.
    #[serde(default)]
    seed: Option<Seed>,
}

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    disk_size_mb: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DirectorConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ROLLOUT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Converge { plans, group } => {
            if let Err(e) = converge(config, plans, group).await {
                error!(error = %format!("{e:#}"), "Rollout failed");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn converge(config: DirectorConfig, path: PathBuf, only: Option<String>) -> Result<()> {
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    let file: PlanFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse plan file {}", path.display()))?;

    let store = Arc::new(match &config.db_path {
        Some(db_path) => Store::open(db_path)?,
        None => Store::open_in_memory()?,
    });
    info!(db_path = ?config.db_path, deployment = %config.deployment, "Store opened");

    let fleet = SimFleet::new();
    let groups = file
        .groups
        .into_iter()
        .filter(|g| only.as_ref().map_or(true, |name| *name == g.name))
        .map(|g| seed_group(&fleet, &store, &config.deployment, g))
        .collect::<Result<Vec<_>>>()?;
    if groups.is_empty() {
        bail!("no instance group matches");
    }

    // Ctrl+C cancels the task; in-flight drains and watches stop at their
    // next checkpoint.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received cancel signal");
            let _ = cancel_tx.send(true);
        }
    });
    let cancel = Cancellation::new(cancel_rx);

    let collab = fleet.collaborators(store.clone());
    let deleter = Arc::new(StoreInstanceDeleter::new(
        store.clone(),
        collab.cloud.clone(),
        collab.vms.clone(),
    ));
    let updater = Arc::new(InstanceUpdater::new(
        collab,
        config,
        Arc::new(TokioSleeper),
        cancel.clone(),
    ));
    let progress = Arc::new(ProgressReporter::new(
        TaskId::new(),
        Arc::new(StdoutEventSink),
    ));
    let scheduler =
        RolloutScheduler::new(updater, deleter, progress).with_cancellation(cancel);

    for group in groups {
        let report = scheduler.run(group).await?;
        info!(
            group = %report.group,
            converged = report.converged.len(),
            skipped = report.skipped_noops,
            deleted = report.deleted.len(),
            "Instance group done"
        );
    }

    Ok(())
}

/// Records the group's existing instances in the store and the simulated
/// fleet.
fn seed_group(
    fleet: &SimFleet,
    store: &Store,
    deployment: &str,
    group: PlannedGroup,
) -> Result<GroupRollout> {
    let mut plans = Vec::with_capacity(group.plans.len());

    for PlannedInstance { plan, seed } in group.plans {
        if let Some(state) = plan.recorded_state() {
            let record = InstanceRecord {
                id: plan.instance,
                deployment: deployment.to_string(),
                group: plan.desired.group.clone(),
                index: plan.desired.index,
                availability_zone: plan.desired.availability_zone.clone(),
                state,
            };
            match seed {
                Some(seed) => {
                    fleet.seed_instance(store, &record, seed.disk_size_mb)?;
                }
                None => store.upsert_instance(&record)?,
            }
        }
        plans.push(plan);
    }

    for id in &group.unneeded {
        store.upsert_instance(&InstanceRecord {
            id: *id,
            deployment: deployment.to_string(),
            group: group.name.clone(),
            index: 0,
            availability_zone: None,
            state: TargetState::Started,
        })?;
    }

    Ok(GroupRollout {
        name: group.name,
        update: group.update,
        plans,
        unneeded: group.unneeded,
    })
}
