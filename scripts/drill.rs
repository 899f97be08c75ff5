#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Standalone rollback drill runner: exercises the recovery mechanisms
//! and documented procedures without touching the patch queue. Intended
//! for CI and for operators checking a deployment before a migration
//! window.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use patchbay_lib::config::{MountEnv, OrchestratorConfig};
use patchbay_lib::rollback::RollbackController;
use patchbay_lib::runner::{CommandRunner, SystemRunner};

#[derive(Parser)]
#[command(name = "drill", about = "Patchbay rollback drill runner")]
struct Cli {
    /// Working root to drill against. Defaults to PATCHBAY_ROOT or the
    /// current directory.
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Restrict procedure validation to one environment.
    #[arg(long, value_name = "ENV")]
    mount: Option<String>,

    /// Emit machine-readable JSON instead of the table view.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    patchbay_lib::logging::init_quiet();

    let cli = Cli::parse();
    let config = match &cli.root {
        Some(root) => OrchestratorConfig::for_root(root.clone()),
        None => OrchestratorConfig::load(),
    };
    let environment = match &cli.mount {
        Some(raw) => Some(
            MountEnv::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("unknown mount environment '{raw}'"))?,
        ),
        None => Some(config.mount_env),
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(&config.working_root));
    let controller = RollbackController::new(config, runner);

    let mechanisms = controller.test_recovery_mechanisms().await;
    let procedures = controller.validate_rollback_procedures(environment).await;

    if cli.json {
        let payload = serde_json::json!({
            "mechanisms": mechanisms,
            "procedures": procedures,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("Recovery mechanisms:");
        for mechanism in &mechanisms {
            println!(
                "  {:<16} {}  {:>6} ms",
                mechanism.id,
                if mechanism.is_functional { "ok" } else { "FAILED" },
                mechanism.test_results.duration_ms
            );
            for error in &mechanism.test_results.errors {
                println!("    {error}");
            }
        }
        println!("Procedures:");
        for procedure in &procedures {
            println!(
                "  {:<18} {}",
                procedure.id,
                if procedure.is_tested { "tested" } else { "UNTESTED" }
            );
        }
    }

    let all_ok =
        mechanisms.iter().all(|m| m.is_functional) && procedures.iter().all(|p| p.is_tested);
    process::exit(if all_ok { 0 } else { 1 });
}
