//! capml CLI: training, evaluation, active-set selection and the live loop.
//!
//! Commands:
//! - `train`: run the offline pipeline for the configured universe
//! - `evaluate`: re-score registry entries over a recent window
//! - `select-top`: pick the best pairs and write the active set
//! - `show-active`: print the active pairs, thresholds, positions and tallies
//! - `live`: start the decision loop
//!
//! Exit codes: 0 success, 2 configuration error, 3 broker unavailable, 1 other.

use anyhow::{Context, Result};
use capml_core::data::{Broker, CandleCache, CandleStore, CapitalClient, CircuitBreaker, DataError, EpicResolver};
use capml_core::domain::{pair_key, Timeframe};
use capml_core::persist::read_json;
use capml_core::registry::ModelRegistry;
use capml_core::{Outcome, SkipReason};
use capml_runner::frequency::{FrequencyState, FREQUENCY_FILE};
use capml_runner::{
    active_universe, evaluate_registry, select_top, ActiveSet, BotConfig, ConfigError, EvaluationReport, LiveLoop,
    PositionBook, Trainer, DEFAULT_CONFIG_FILE,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_OTHER: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_BROKER: u8 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "capml", about = "capml: ML multi-asset trading bot for Capital.com")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug-level logging (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and register models for every configured (symbol, timeframe).
    Train {
        /// Restrict to these symbols (default: the configured universe).
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Re-score authoritative registry entries over the last N bars.
    Evaluate {
        /// Bars per pair to evaluate on.
        #[arg(long, default_value_t = 1000)]
        lookback: usize,
    },
    /// Rank pairs by composite score and write the top K as the active set.
    SelectTop {
        /// Number of pairs to keep.
        k: usize,
    },
    /// Print the active pairs with thresholds, weights, positions and tallies.
    ShowActive,
    /// Start the live decision loop.
    Live {
        /// Stop after this many passes.
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Force dry-run regardless of the config.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
        if cause.downcast_ref::<DataError>().is_some_and(DataError::is_broker_unavailable) {
            return EXIT_BROKER;
        }
    }
    EXIT_OTHER
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = BotConfig::from_file(&cli.config)?;
    match cli.command {
        Commands::Train { symbols } => run_train(config, symbols),
        Commands::Evaluate { lookback } => run_evaluate(config, lookback),
        Commands::SelectTop { k } => run_select_top(config, k),
        Commands::ShowActive => run_show_active(config),
        Commands::Live {
            max_iterations,
            dry_run,
        } => run_live(config, max_iterations, dry_run),
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────

struct Services {
    broker: Arc<dyn Broker>,
    epics: Arc<EpicResolver>,
    store: Arc<CandleStore>,
    registry: Arc<ModelRegistry>,
}

fn registry(config: &BotConfig) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(
        &config.registry.root,
        &config.registry.manifest,
        &config.registry.models_dir,
    ))
}

fn connect(config: &BotConfig) -> Result<Services> {
    let credentials = config.credentials_from_env()?;
    let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(config.broker.auth_cooldown_secs)));
    let client = CapitalClient::new(config.capital_settings(), credentials, breaker)
        .context("failed to build broker client")?;
    let broker: Arc<dyn Broker> = Arc::new(client);
    let epics = Arc::new(EpicResolver::new(config.epic_overrides()).with_cache_file(config.live.state_dir.join("epics.json")));

    let mut store = CandleStore::new(broker.clone(), epics.clone(), config.paging())
        .with_cache(CandleCache::new(&config.data.cache_dir, config.data.cache_format));
    if let Some(secs) = config.data.cache_max_age_secs {
        store = store.with_max_age(chrono::Duration::seconds(secs as i64));
    }
    info!(broker = broker.name(), base_url = %config.broker.base_url, "broker configured");
    Ok(Services {
        broker,
        epics,
        store: Arc::new(store),
        registry: registry(config),
    })
}

/// Flag a stop request. True only for the first request.
fn request_stop(stop: &AtomicBool) -> bool {
    !stop.swap(true, Ordering::SeqCst)
}

/// SIGINT/SIGTERM: the first asks the loop to stop at the next pair
/// boundary, a second exits at once.
fn install_stop_handler(stop: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if request_stop(&stop) {
            warn!("stop requested, finishing the current pair");
        } else {
            warn!("second stop signal, exiting");
            std::process::exit(EXIT_INTERRUPTED);
        }
    })
    .context("failed to install stop signal handler")
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_train(config: BotConfig, symbols: Vec<String>) -> Result<ExitCode> {
    let services = connect(&config)?;
    let pairs: Vec<(String, Timeframe)> = config
        .pairs()
        .into_iter()
        .filter(|(s, _)| symbols.is_empty() || symbols.contains(s))
        .collect();
    info!(pairs = pairs.len(), "training");

    let trainer = Trainer::new(config, services.store, services.registry);
    let reports = trainer.train_all(&pairs);

    let mut registered = 0;
    let mut unavailable = 0;
    for r in &reports {
        match &r.outcome {
            Outcome::Ok(_) => registered += 1,
            Outcome::Skip(SkipReason::BrokerUnavailable) => unavailable += 1,
            _ => {}
        }
        println!(
            "{:<24} {:<9} {}",
            pair_key(&r.symbol, r.timeframe),
            r.stage.to_string(),
            r.outcome.label()
        );
    }
    println!("registered {registered}/{}", reports.len());

    if !reports.is_empty() && unavailable == reports.len() {
        error!("broker unavailable for every pair");
        return Ok(ExitCode::from(EXIT_BROKER));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_evaluate(config: BotConfig, lookback: usize) -> Result<ExitCode> {
    let services = connect(&config)?;
    let report = evaluate_registry(
        &services.registry,
        &services.store,
        lookback,
        config.labeling.vol_span,
        Utc::now(),
    )?;
    report
        .save(&config.live.state_dir)
        .context("failed to write evaluation")?;

    for p in &report.pairs {
        println!(
            "{:<24} entries={:<4} trades={:<4} hit={:.2} pf={:.2} sharpe={:.2} τ={:.2}",
            p.key, p.entries, p.trades, p.hit_rate, p.metrics.pf, p.metrics.sharpe, p.threshold
        );
    }
    for (key, status) in &report.skipped {
        println!("{key:<24} {status}");
    }

    let unavailable = report
        .skipped
        .values()
        .filter(|s| s.as_str() == SkipReason::BrokerUnavailable.code())
        .count();
    if report.pairs.is_empty() && unavailable > 0 && unavailable == report.skipped.len() {
        error!("broker unavailable for every pair");
        return Ok(ExitCode::from(EXIT_BROKER));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_select_top(config: BotConfig, k: usize) -> Result<ExitCode> {
    let state_dir = &config.live.state_dir;
    let entries = registry(&config).authoritative()?;
    let evaluation = match EvaluationReport::load(state_dir) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unreadable evaluation; ranking by CV metrics");
            None
        }
    };
    let active = select_top(&entries, evaluation.as_ref(), k, Utc::now());
    active.save(state_dir).context("failed to write active set")?;

    for (rank, p) in active.pairs.iter().enumerate() {
        println!("{:>2}. {:<24} score={:.3} ({:?})", rank + 1, p.key, p.score, p.source);
    }
    info!(selected = active.pairs.len(), candidates = entries.len(), "active set written");
    Ok(ExitCode::SUCCESS)
}

fn run_show_active(config: BotConfig) -> Result<ExitCode> {
    let state_dir = &config.live.state_dir;
    let source = match ActiveSet::load(state_dir)? {
        Some(set) if !set.pairs.is_empty() => format!("active set ({})", set.generated_at),
        _ => "configured universe".to_string(),
    };
    let pairs = active_universe(state_dir, config.pairs());
    let manifest = registry(&config).load_manifest()?;
    let book = PositionBook::open(state_dir)?;
    let today = Utc::now().date_naive();
    let tallies: Option<FrequencyState> = read_json(&state_dir.join(FREQUENCY_FILE))?;
    let tallies = tallies.filter(|t| t.date == today);

    println!("{} pairs from {source}", pairs.len());
    for (symbol, tf) in &pairs {
        let key = pair_key(symbol, *tf);
        let (tau, weights) = match manifest.latest(&key) {
            Some(e) => (
                format!("{:.2}", e.threshold),
                serde_json::to_string(&e.weights()).unwrap_or_default(),
            ),
            None => ("-".to_string(), "no model".to_string()),
        };
        let position = match book.get(symbol, *tf).filter(|p| p.is_open()) {
            Some(p) => format!(
                "OPEN {} {:.4}{}",
                p.direction.map(|d| d.to_string()).unwrap_or_default(),
                p.size,
                if p.dry_run { " (dry)" } else { "" }
            ),
            None => "CLOSED".to_string(),
        };
        let trades = tallies
            .as_ref()
            .and_then(|t| t.pairs.get(&key))
            .map_or(0, |t| t.count);
        println!("{key:<24} τ={tau:<5} trades_today={trades:<3} {position:<20} {weights}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_live(mut config: BotConfig, max_iterations: Option<usize>, force_dry_run: bool) -> Result<ExitCode> {
    if force_dry_run {
        config.live.dry_run = true;
    }
    let services = connect(&config)?;
    if !config.live.dry_run {
        if let Err(e) = services.broker.account_equity() {
            error!(error = %e, "broker check failed");
            let code = if e.is_broker_unavailable() { EXIT_BROKER } else { EXIT_OTHER };
            return Ok(ExitCode::from(code));
        }
    }

    let pairs = active_universe(&config.live.state_dir, config.pairs());
    let mut live = LiveLoop::new(
        config,
        services.broker,
        services.store,
        services.registry,
        services.epics,
        pairs,
        Utc::now(),
    )?;
    install_stop_handler(live.stop_handle())?;
    let summary = live.run(max_iterations);
    println!(
        "passes={} visits={} routed={} failures={}",
        summary.iterations, summary.visits, summary.routed, summary.failures
    );
    Ok(ExitCode::SUCCESS)
}
