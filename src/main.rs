use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mop::config::{MopConfig, StoreBackend};
use mop::coordinator::{FitSelection, JobQueueCoordinator};
use mop::env_state::MopEnv;
use mop::fit::ModelFitter;
use mop::harvest::ogle::OgleHarvester;
use mop::harvest::{ingest_events, ingest_photometry, ingest_series, CatalogHarvester};
use mop::photometry::PhotometrySeries;
use mop::scheduler::lco::LcoScheduler;
use mop::scheduler::memory::MemoryScheduler;
use mop::scheduler::SchedulerApi;
use mop::store::memory::MemoryStore;
use mop::store::sqlite::SqliteStore;
use mop::store::Store;
use mop::strategy::{StrategySelector, TapSelection};
use mop::time::{Clock, SystemClock};
use mop::visibility::VisibilityOracle;

#[derive(Parser, Debug)]
#[command(name = "mop", version, about = "Microlensing event fitting and follow-up prioritisation")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MOP_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Token of the LCO observation portal
    #[arg(long, env = "MOP_LCO_TOKEN", hide_env_values = true)]
    lco_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Observe {
    #[value(name = "live_obs")]
    LiveObs,
    None,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit every alive event whose model is older than the staleness window
    FitNeed {
        /// Worker threads of the multi-start fit
        #[arg(long)]
        cores: Option<usize>,
        /// Staleness window in hours
        #[arg(long)]
        run_every: Option<f64>,
    },
    /// Refit a selection of events regardless of staleness, in random order
    FitAll {
        /// `all`, `alive` or a year list such as `[2023,2024]`
        #[arg(value_parser = parse_fit_selection)]
        selection: FitSelection,
        /// Worker threads of the multi-start fit
        #[arg(long)]
        cores: Option<usize>,
    },
    /// Prioritise fitted events and request observations
    RunTap {
        /// Event name, or `all` for every alive event
        target: String,
        #[arg(long, value_enum, default_value = "none")]
        observe: Observe,
    },
    /// Harvest OGLE EWS events and light curves for the given seasons
    HarvestOgle {
        #[arg(required = true)]
        years: Vec<String>,
    },
    /// Import a photometry table (`time filter magnitude error`) for an event
    ImportPhotometry {
        name: String,
        file: Utf8PathBuf,
        /// Source name of the data
        #[arg(long, default_value = "upload")]
        source: String,
    },
}

fn parse_fit_selection(s: &str) -> Result<FitSelection, String> {
    s.parse().map_err(|err: mop::mop_errors::MopError| err.to_string())
}

fn open_store(config: &MopConfig) -> Result<Box<dyn Store>> {
    Ok(match config.store.backend {
        StoreBackend::Sqlite => Box::new(
            SqliteStore::open(&config.store.path)
                .with_context(|| format!("opening store {}", config.store.path))?,
        ),
        StoreBackend::Memory => {
            warn!("in-memory store: nothing will be persisted");
            Box::new(MemoryStore::new())
        }
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mop=info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => MopConfig::load(path).with_context(|| format!("reading configuration {path}"))?,
        None => MopConfig::default(),
    };
    if cli.lco_token.is_some() {
        config.scheduler.token = cli.lco_token.clone();
    }
    let store = open_store(&config)?;

    match cli.command {
        Command::FitNeed { cores, run_every } => {
            if let Some(cores) = cores {
                config.fit.cores = cores;
            }
            let window_hours = run_every.unwrap_or(config.queue.run_every_hours);
            let fitter = ModelFitter::new(config.fit.clone())?;
            let clock = SystemClock;
            let queue = JobQueueCoordinator::new(store.as_ref(), &fitter, &clock, window_hours)?;
            queue.backfill_last_fit()?;
            let report = queue.run()?;
            info!(?report, "fit_need done");
        }
        Command::FitAll { selection, cores } => {
            if let Some(cores) = cores {
                config.fit.cores = cores;
            }
            let fitter = ModelFitter::new(config.fit.clone())?;
            let clock = SystemClock;
            let queue = JobQueueCoordinator::new(
                store.as_ref(),
                &fitter,
                &clock,
                config.queue.run_every_hours,
            )?;
            let report = queue.run_selection(&selection, &mut rand::rng())?;
            info!(?report, "fit_all done");
        }
        Command::RunTap { target, observe } => {
            let oracle = VisibilityOracle::new(config.site_registry(), config.visibility.params.clone());
            let live_obs = observe == Observe::LiveObs;
            let scheduler: Box<dyn SchedulerApi> = if live_obs {
                let Some(token) = config.scheduler.token.as_deref() else {
                    bail!("live observing needs an LCO token (MOP_LCO_TOKEN)");
                };
                if config.scheduler.proposal.is_empty() {
                    bail!("live observing needs scheduler.proposal in the configuration");
                }
                Box::new(LcoScheduler::new(
                    MopEnv::with_timeout(config.scheduler.timeout()),
                    &config.scheduler.base_url,
                    token,
                    &config.scheduler.proposal,
                ))
            } else {
                Box::new(MemoryScheduler::new())
            };
            let selection = if target.eq_ignore_ascii_case("all") {
                TapSelection::AllAlive
            } else {
                TapSelection::Named(target)
            };
            let selector = StrategySelector::new(
                store.as_ref(),
                scheduler.as_ref(),
                &oracle,
                config.policy.clone(),
                live_obs,
            );
            let report = selector.run(&selection, SystemClock.now_jd()?)?;
            info!(?report, "run_TAP done");
        }
        Command::HarvestOgle { years } => {
            let harvester = OgleHarvester::new(
                MopEnv::with_timeout(std::time::Duration::from_secs(config.harvest.timeout_secs)),
                &config.harvest.ogle_url,
            );
            let catalog = harvester.fetch(&years)?;
            let targets = ingest_events(store.as_ref(), &catalog)?;
            let n_points = ingest_photometry(store.as_ref(), &harvester, &targets)?;
            info!(n_events = targets.len(), n_points, "OGLE harvest done");
        }
        Command::ImportPhotometry { name, file, source } => {
            store.get(&name)?;
            let content = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let series = PhotometrySeries::from_table(&name, &source, &content)?;
            let n_points = ingest_series(store.as_ref(), &name, &series)?;
            info!(event = %name, n_points, "photometry imported");
        }
    }
    Ok(())
}
