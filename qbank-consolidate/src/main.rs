//! qbank-consolidate - content-bank consolidation tool
//!
//! Operator entry point for the consolidation engine. Every subcommand
//! prints one JSON document on stdout; logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use qbank_common::ConsolidationConfig;
use qbank_consolidate::detector::DetectionScope;
use qbank_consolidate::executor::ExecuteOptions;
use qbank_consolidate::model::{ContainerId, ContextId, ItemId, Scope};
use qbank_consolidate::planner::PlanSource;
use qbank_consolidate::resolver::Resolution;
use qbank_consolidate::Consolidator;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Command-line arguments for qbank-consolidate
#[derive(Parser, Debug)]
#[command(name = "qbank-consolidate")]
#[command(about = "Deduplicate and consolidate a learning-content bank")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite content-bank file (overrides QBANK_DATABASE and the config file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Act from this context instead of system scope
    #[arg(long, global = true)]
    context: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the canonical shared container
    Resolve {
        /// Label to resolve (defaults to canonical_label)
        #[arg(long)]
        label: Option<String>,
    },
    /// List duplicate groups
    Detect {
        #[command(flatten)]
        scope: ScanArgs,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "50")]
        page_size: usize,
    },
    /// Build a plan without applying it
    Plan(PlanArgs),
    /// Build a plan and apply it
    Execute {
        #[command(flatten)]
        plan: PlanArgs,
        /// Operations per batch (defaults to batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        stop_on_first_error: bool,
    },
    /// Move every item of a container into the target, batch by batch
    Rehome {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        target: i64,
        /// Remove the source container once it is empty
        #[arg(long)]
        delete_emptied: bool,
        #[arg(long)]
        stop_on_first_error: bool,
    },
    /// Merge every duplicate group into the target (canonical by default)
    Dedupe {
        #[command(flatten)]
        scope: ScanArgs,
        #[arg(long)]
        target: Option<i64>,
        #[arg(long)]
        stop_on_first_error: bool,
    },
    /// Read-only reports
    Report {
        #[arg(value_enum, default_value = "overview")]
        kind: ReportKind,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Only scan this container
    #[arg(long = "in-container")]
    in_container: Option<i64>,
    /// Include the container's whole subtree
    #[arg(long, requires = "in_container")]
    subtree: bool,
}

impl ScanArgs {
    fn detection_scope(&self) -> DetectionScope {
        match self.in_container {
            Some(id) => DetectionScope::Container {
                id: ContainerId(id),
                include_subtree: self.subtree,
            },
            None => DetectionScope::All,
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false, id = "plan_source")]
struct SourceArgs {
    /// Relocate one item
    #[arg(long)]
    item: Option<i64>,
    /// Merge the duplicate group formed by these items
    #[arg(long, value_delimiter = ',')]
    group_of: Option<Vec<i64>>,
    /// Relocate every item directly inside this container
    #[arg(long)]
    contents_of: Option<i64>,
    /// Re-parent this container under the target
    #[arg(long)]
    move_container: Option<i64>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Target container
    #[arg(long)]
    target: i64,
    /// With --contents-of: remove the emptied source
    #[arg(long)]
    delete_emptied: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ReportKind {
    Overview,
    Empty,
    Counts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConsolidationConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "Starting qbank-consolidate v{} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("QBANK_BUILD_ID"),
        env!("QBANK_BUILD_DATE")
    );

    let scope = match cli.context {
        Some(id) => Scope::Context(ContextId(id)),
        None => Scope::System,
    };

    let engine = Consolidator::open(config, cli.database.as_deref())
        .await
        .context("Failed to open content bank")?;

    match cli.command {
        Command::Resolve { label } => {
            let resolution = match label {
                Some(label) => engine.resolve_canonical_target(&label, scope).await,
                None => engine.resolve_configured_target(scope).await,
            };
            print_json(&resolution)?;
        }
        Command::Detect {
            scope: scan,
            page,
            page_size,
        } => {
            let groups = engine
                .detect_duplicates(scan.detection_scope(), page, page_size)
                .await?;
            print_json(&groups)?;
        }
        Command::Plan(args) => {
            let source = plan_source(&engine, &args).await?;
            let plan = engine
                .plan_consolidation(&source, ContainerId(args.target), scope)
                .await?;
            print_json(&plan)?;
        }
        Command::Execute {
            plan: args,
            batch_size,
            stop_on_first_error,
        } => {
            let source = plan_source(&engine, &args).await?;
            let plan = engine
                .plan_consolidation(&source, ContainerId(args.target), scope)
                .await?;
            let options = ExecuteOptions {
                batch_size: batch_size.unwrap_or(engine.config().batch_size),
                stop_on_first_error,
            };
            let summary = engine.execute_plan_with(&plan, options).await;
            print_json(&serde_json::json!({ "plan": plan, "summary": summary }))?;
        }
        Command::Rehome {
            source,
            target,
            delete_emptied,
            stop_on_first_error,
        } => {
            let settings = engine.bulk_settings(stop_on_first_error);
            let report = engine
                .rehome(ContainerId(source), ContainerId(target), scope, delete_emptied, settings)
                .run()
                .await?;
            print_json(&report)?;
        }
        Command::Dedupe {
            scope: scan,
            target,
            stop_on_first_error,
        } => {
            let target = match target {
                Some(id) => ContainerId(id),
                None => match engine.resolve_configured_target(scope).await {
                    Resolution::Found(found) => found.container.id,
                    Resolution::NotFound { label, near_misses } => bail!(
                        "Canonical container '{}' not found (similar: {:?}); pass --target",
                        label,
                        near_misses
                    ),
                },
            };
            let settings = engine.bulk_settings(stop_on_first_error);
            let report = engine
                .deduplicate(scan.detection_scope(), target, scope, settings)
                .run()
                .await?;
            print_json(&report)?;
        }
        Command::Report { kind } => match kind {
            ReportKind::Overview => print_json(&engine.reporter().overview().await?)?,
            ReportKind::Empty => print_json(&engine.reporter().empty_containers().await?)?,
            ReportKind::Counts => print_json(&engine.reporter().container_item_counts().await?)?,
        },
    }

    Ok(())
}

async fn plan_source(engine: &Consolidator, args: &PlanArgs) -> Result<PlanSource> {
    let source = &args.source;
    if let Some(id) = source.item {
        return Ok(PlanSource::Item { id: ItemId(id) });
    }
    if let Some(ids) = &source.group_of {
        let ids: Vec<ItemId> = ids.iter().copied().map(ItemId).collect();
        return match engine.detector().group_of(&ids).await? {
            Some(group) => Ok(PlanSource::Group { group }),
            None => bail!("Items {:?} do not form a duplicate group", ids),
        };
    }
    if let Some(id) = source.contents_of {
        return Ok(PlanSource::ContainerContents {
            container: ContainerId(id),
            delete_emptied: args.delete_emptied,
        });
    }
    if let Some(id) = source.move_container {
        return Ok(PlanSource::ContainerMove {
            container: ContainerId(id),
        });
    }
    bail!("No plan source given")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
