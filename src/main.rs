use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use patchbay_lib::config::{MountEnv, OrchestratorConfig};
use patchbay_lib::gates::{all_validations_passed, failed_validations, GatePipeline};
use patchbay_lib::graph::DependencyGraph;
use patchbay_lib::orchestrator::{Orchestrator, RunOptions};
use patchbay_lib::queue::PatchQueue;
use patchbay_lib::report;
use patchbay_lib::rollback::RollbackController;
use patchbay_lib::runner::{CommandRunner, SystemRunner};

#[derive(Debug, Parser)]
#[command(name = "patchbay", about = "Patch migration orchestrator", version)]
struct Cli {
    /// Working root the patches mutate. Defaults to PATCHBAY_ROOT or the
    /// current directory.
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Target mount environment, overriding PATCHBAY_USE_NEXTGEN.
    #[arg(long, value_name = "ENV", global = true)]
    mount: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute every pending patch in dependency order.
    Run {
        /// Patch queue directory holding the pending *.json files.
        #[arg(long, value_name = "DIR")]
        queue: PathBuf,
        /// Resolve and report without executing anything.
        #[arg(long)]
        dry_run: bool,
        /// Skip per-patch rollback points (and any automatic rollback).
        #[arg(long)]
        no_backup: bool,
        /// Emit the raw JSON run report instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Analyze patch dependencies: execution order and earliest feasible
    /// positions.
    Deps {
        #[arg(long, value_name = "DIR")]
        queue: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run the validation gate pipeline standalone.
    Gates {
        /// Run required gates only.
        #[arg(long)]
        required_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rollback point maintenance and drills.
    #[command(subcommand)]
    Rollback(RollbackCommand),
}

#[derive(Debug, Subcommand)]
enum RollbackCommand {
    /// Snapshot the configured file set into a new rollback point.
    Create {
        #[arg(long, value_name = "TEXT")]
        description: String,
        #[arg(long)]
        json: bool,
    },
    /// List stored rollback points.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Verify a rollback point's integrity (latest when no id is given).
    Verify {
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Dry-run the recovery mechanisms and documented procedures.
    Drill {
        #[arg(long)]
        json: bool,
    },
    /// Validate the whole rollback strategy as one composite gate.
    Strategy {
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Restore a rollback point over the working root.
    Restore { id: String },
}

fn main() {
    if let Err(err) = patchbay_lib::logging::init() {
        eprintln!("Warning: {err:#}");
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(2);
        }
    }
}

fn build_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.root {
        Some(root) => OrchestratorConfig::for_root(root.clone()),
        None => OrchestratorConfig::load(),
    };
    if let Some(mount) = &cli.mount {
        let mount_env = MountEnv::parse(mount)
            .with_context(|| format!("unknown mount environment '{mount}'"))?;
        config = config.with_mount_env(mount_env);
    }
    Ok(config)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<i32> {
    let config = build_config(&cli)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(&config.working_root));

    match cli.command {
        Commands::Run {
            queue,
            dry_run,
            no_backup,
            json,
        } => {
            let queue = PatchQueue::open(&queue)?;
            let orchestrator = Orchestrator::new(config, runner);
            let options = RunOptions {
                dry_run,
                auto_backup: !no_backup,
            };

            // Ctrl-C cancels between commands; the in-flight command
            // still finishes and the run stays eligible for rollback.
            let cancel = orchestrator.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!(target: "patchbay", event = "cancel_requested");
                    cancel.cancel();
                }
            });

            let report = orchestrator.run(&queue, &options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report::render_run_report(&report));
            }
            Ok(if report.succeeded() { 0 } else { 1 })
        }
        Commands::Deps { queue, json } => {
            let queue = PatchQueue::open(&queue)?;
            let definitions = queue.definitions()?;
            let graph = DependencyGraph::build(&definitions)
                .context("resolve patch dependency graph")?;
            let order = graph.execution_order();
            let placements = graph.placement_report();

            if json {
                let payload = serde_json::json!({
                    "executionOrder": order,
                    "placements": placements,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print!("{}", report::render_placements(&order, &placements));
            }
            Ok(0)
        }
        Commands::Gates {
            required_only,
            json,
        } => {
            let pipeline = GatePipeline::for_config(&config, runner);
            let outcomes = if required_only {
                pipeline.run_required().await
            } else {
                pipeline.run_all().await
            };
            let passed = all_validations_passed(&outcomes);

            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else {
                for outcome in &outcomes {
                    let verdict = if outcome.result.success { "pass" } else { "FAIL" };
                    println!(
                        "{:<22} {verdict:<5} {:>6} ms  {}",
                        outcome.gate, outcome.result.duration_ms, outcome.result.message
                    );
                }
                for failure in failed_validations(&outcomes) {
                    println!("failed: {failure}");
                }
            }
            Ok(if passed { 0 } else { 1 })
        }
        Commands::Rollback(command) => {
            let controller = RollbackController::new(config.clone(), runner);
            handle_rollback(command, &config, &controller).await
        }
    }
}

async fn handle_rollback(
    command: RollbackCommand,
    config: &OrchestratorConfig,
    controller: &RollbackController,
) -> Result<i32> {
    match command {
        RollbackCommand::Create { description, json } => {
            let entry = controller
                .create_rollback_point(config.mount_env, &description, None)
                .await
                .context("create rollback point")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entry.point)?);
            } else {
                println!(
                    "Rollback point {} ({} file(s)) stored at {}",
                    entry.point.id,
                    entry.point.files.len(),
                    entry.directory.display()
                );
            }
            Ok(0)
        }
        RollbackCommand::List { json } => {
            let entries = controller.list_rollback_points()?;
            if json {
                let points: Vec<_> = entries.iter().map(|e| &e.point).collect();
                println!("{}", serde_json::to_string_pretty(&points)?);
            } else if entries.is_empty() {
                println!("No rollback points.");
            } else {
                for entry in &entries {
                    println!(
                        "{}  {}  {}  {}",
                        entry.point.id,
                        entry.point.created_at.to_rfc3339(),
                        entry.point.environment,
                        entry.point.description
                    );
                }
            }
            Ok(0)
        }
        RollbackCommand::Verify { id, json } => {
            let entry = match id {
                Some(id) => controller
                    .find_rollback_point(&id)?
                    .with_context(|| format!("rollback point not found: {id}"))?,
                None => controller
                    .latest_rollback_point()?
                    .context("no rollback points exist yet")?,
            };
            let integrity = controller.validate_backup_integrity(&entry)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&integrity)?);
            } else {
                println!(
                    "{}: {} ({}/{} files verified)",
                    integrity.rollback_point_id,
                    if integrity.is_valid { "valid" } else { "INVALID" },
                    integrity.files_verified,
                    integrity.total_files
                );
                for error in &integrity.errors {
                    println!("  error: {error}");
                }
                for warning in &integrity.warnings {
                    println!("  warning: {warning}");
                }
            }
            Ok(if integrity.is_valid { 0 } else { 1 })
        }
        RollbackCommand::Drill { json } => {
            let mechanisms = controller.test_recovery_mechanisms().await;
            let procedures = controller
                .validate_rollback_procedures(Some(config.mount_env))
                .await;
            let functional = mechanisms.iter().all(|m| m.is_functional)
                && procedures.iter().all(|p| p.is_tested);

            if json {
                let payload = serde_json::json!({
                    "mechanisms": mechanisms,
                    "procedures": procedures,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for mechanism in &mechanisms {
                    println!(
                        "{:<16} {}  {:>6} ms",
                        mechanism.id,
                        if mechanism.is_functional { "ok" } else { "FAILED" },
                        mechanism.test_results.duration_ms
                    );
                    for error in &mechanism.test_results.errors {
                        println!("  {error}");
                    }
                }
                for procedure in &procedures {
                    println!(
                        "{:<16} {}",
                        procedure.id,
                        if procedure.is_tested { "tested" } else { "UNTESTED" }
                    );
                }
            }
            Ok(if functional { 0 } else { 1 })
        }
        RollbackCommand::Strategy { id, json } => {
            let verdict = controller
                .validate_rollback_strategy(id.as_deref())
                .await
                .context("validate rollback strategy")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            } else {
                println!(
                    "Strategy for {}: {:?}",
                    verdict.rollback_point_id, verdict.overall_status
                );
                for recommendation in &verdict.recommendations {
                    println!("  {recommendation}");
                }
            }
            Ok(if verdict.is_valid { 0 } else { 1 })
        }
        RollbackCommand::Restore { id } => {
            let entry = controller
                .find_rollback_point(&id)?
                .with_context(|| format!("rollback point not found: {id}"))?;
            let restored = controller.restore(&entry).context("restore rollback point")?;
            println!("Restored {restored} file(s) from {}", entry.point.id);
            Ok(0)
        }
    }
}
