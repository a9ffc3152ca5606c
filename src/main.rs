//! Command-line front end for the SRF cavity setup orchestrator.
//!
//! Resolves a target scope of the machine, propagates one command to every
//! cavity under it, and exits non-zero if any cavity failed. Channel access
//! is backed by the simulated service; the binary exercises the full
//! orchestration path without touching hardware.

use clap::{Parser, Subcommand};
use srf_setup::cavity::StageRequests;
use srf_setup::channel::{ChannelAccess, SimChannelService};
use srf_setup::config::Settings;
use srf_setup::hierarchy::Machine;
use srf_setup::orchestrator::{SetupCommand, SetupOrchestrator};
use srf_setup::persist::PositionStore;
use srf_setup::status::{LogStatusSink, StatusSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "srf_setup", about = "SRF cavity setup orchestrator", version)]
struct Cli {
    /// Target scope: "machine", a linac ("L1B"), a cryomodule ("CM01"),
    /// a rack ("CM01:A"), or a cavity ("CM01:3").
    target: String,

    /// Settings file (TOML). Defaults and SRF_SETUP_* env vars apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cryomodules to skip in machine and linac scopes, e.g. "H1".
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Run the setup sequence on every cavity in the target scope.
    Setup {
        /// Skip SSA calibration.
        #[arg(long)]
        skip_ssa_cal: bool,
        /// Skip tuning to resonance.
        #[arg(long)]
        skip_tune: bool,
        /// Skip cavity characterization.
        #[arg(long)]
        skip_characterization: bool,
        /// Skip the RF amplitude ramp.
        #[arg(long)]
        skip_ramp: bool,
    },
    /// Turn RF and SSA off on every cavity in the target scope.
    Shutdown,
    /// Clear pending aborts so the next command is accepted.
    ClearAbort,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    let service: Arc<dyn ChannelAccess> = Arc::new(SimChannelService::new());
    let sink: Arc<dyn StatusSink> = Arc::new(LogStatusSink);
    let store = Arc::new(PositionStore::open(settings.stepper.position_file_path())?);

    let machine = Arc::new(Machine::build(&settings, service, sink, store)?);
    let orchestrator =
        SetupOrchestrator::new(machine).with_exclusions(cli.exclude.iter().cloned());

    let command = match cli.action {
        Action::Setup {
            skip_ssa_cal,
            skip_tune,
            skip_characterization,
            skip_ramp,
        } => SetupCommand::Setup {
            requests: Some(StageRequests {
                ssa_cal: !skip_ssa_cal,
                tune: !skip_tune,
                characterize: !skip_characterization,
                ramp: !skip_ramp,
            }),
        },
        Action::Shutdown => SetupCommand::Shutdown,
        Action::ClearAbort => SetupCommand::ClearAbort,
    };

    let report = orchestrator.propagate(&cli.target, command).await?;
    for rejection in report.rejections() {
        eprintln!("{}: already running, command declined", rejection.cavity);
    }
    for failure in report.failures() {
        eprintln!(
            "{}: {:?}{}",
            failure.cavity,
            failure.status,
            failure
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
    }
    // Rejections are non-fatal; only faulted leaves fail the run.
    if report.failures().next().is_some() {
        std::process::exit(1);
    }
    Ok(())
}
