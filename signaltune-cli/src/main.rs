//! SignalTune CLI: run the tuning loop and inspect its artifacts.
//!
//! Commands:
//! - `init`: write a default config and the initial production module
//! - `run`: start the orchestrator loop; stdin takes callback lines
//! - `mutate`: write one mutated draft now
//! - `status`: baseline, production parameters, draft and latest version
//! - `versions`: list promoted versions
//! - `rollback`: restore a version or backup into production

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use signaltune_core::config::{ThresholdsHandle, TunerConfig};
use signaltune_core::metrics::MetricsSnapshot;
use signaltune_core::params::StrategyModule;
use signaltune_core::rng::RngHierarchy;
use signaltune_runner::{
    generate_draft, ApprovalWorkflow, CommandEvaluator, LogEvent, Orchestrator, TunerServices,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "signaltune",
    about = "SignalTune: autonomous parameter tuning for a trading-signal module"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "signaltune.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and the initial production module.
    Init {
        /// Overwrite an existing config file.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Seed the baseline accuracy (0.0 to 1.0).
        #[arg(long)]
        baseline: Option<f64>,
    },
    /// Run the orchestrator loop. Reads callback lines from stdin:
    /// `approve::<id>`, `reject::<id>`, `view::<id>`, `approve_all`,
    /// `pending`, `quit`.
    Run,
    /// Mutate production into a new draft now.
    Mutate {
        /// Replace a draft that is already waiting.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show baseline, production parameters, draft and latest version.
    Status,
    /// List promoted versions.
    Versions {
        /// Print records as JSON lines.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Restore a version id or backup name into production.
    Rollback {
        /// Version id (e.g. v20240501_093000_000000) or backup name.
        target: String,
    },
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force, baseline } => run_init(&cli.config, force, baseline),
        Commands::Run => run_loop(&cli.config),
        Commands::Mutate { force } => run_mutate(&cli.config, force),
        Commands::Status => run_status(&cli.config),
        Commands::Versions { json } => run_versions(&cli.config, json),
        Commands::Rollback { target } => run_rollback(&cli.config, &target),
    }
}

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the
/// default `info` filter.
fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
}

/// Load the config; a relative `paths.root` is taken relative to the
/// config file's directory.
fn load_config(path: &Path) -> Result<TunerConfig> {
    let mut config = TunerConfig::from_file(path)
        .with_context(|| format!("loading {} (run `signaltune init` first?)", path.display()))?;
    if config.paths.root.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.paths.root = base.join(&config.paths.root);
    }
    Ok(config)
}

fn run_init(config_path: &Path, force: bool, baseline: Option<f64>) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let config = TunerConfig::default();
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(config_path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", config_path.display()))?;
    println!("Wrote {}", config_path.display());

    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;
    if services
        .promoter
        .bootstrap_production(&StrategyModule::default_signal_module())?
    {
        println!(
            "Wrote production module {}",
            services.promoter.production_path().display()
        );
    }
    if let Some(accuracy) = baseline {
        services
            .promoter
            .metrics()
            .save(&MetricsSnapshot::baseline(accuracy)?)?;
        println!("Baseline accuracy set to {accuracy:.4}");
    }
    Ok(())
}

fn run_loop(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;
    services
        .promoter
        .bootstrap_production(&StrategyModule::default_signal_module())?;

    let approvals = Arc::new(ApprovalWorkflow::new(services));
    let thresholds = ThresholdsHandle::new(config.thresholds.clone());
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&approvals),
        Box::new(CommandEvaluator::from_config(&config.evaluator)),
        thresholds,
        config.mutation.clone(),
        config.seed,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let worker = {
        let cancel = Arc::clone(&cancel);
        thread::Builder::new()
            .name("signaltune-loop".into())
            .spawn(move || orchestrator.run(&cancel))
            .context("failed to spawn orchestrator thread")?
    };

    for line in io::stdin().lock().lines() {
        let line = line?;
        let command = line.trim();
        match command {
            "" => continue,
            "quit" | "exit" => {
                cancel.store(true, Ordering::Relaxed);
                break;
            }
            "pending" => {
                let pending = approvals.pending();
                if pending.is_empty() {
                    println!("No pending requests.");
                }
                for p in pending {
                    println!(
                        "{}  {:.2}% -> {:.2}%  {}",
                        p.id,
                        p.baseline * 100.0,
                        p.accuracy * 100.0,
                        p.provenance.as_deref().unwrap_or("external draft")
                    );
                }
            }
            data => println!("{}", approvals.handle_callback(data).message()),
        }
    }

    if !cancel.load(Ordering::Relaxed) {
        info!("stdin closed, loop keeps running until the process is stopped");
    }
    if worker.join().is_err() {
        bail!("orchestrator thread panicked");
    }
    Ok(())
}

fn run_mutate(config_path: &Path, force: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;
    if services.draft_slot.exists() && !force {
        bail!(
            "a draft is already waiting at {} (use --force to replace it)",
            services.draft_slot.path().display()
        );
    }

    let now = Utc::now();
    let mut rng = RngHierarchy::new(config.seed).rng_for("cli-mutation", now.timestamp() as u64);
    match generate_draft(&services, &config.thresholds.mutation_bounds, &mut rng, now)? {
        Some(draft) => println!(
            "Draft {} written to {}\n{}",
            draft.short_hash(),
            services.draft_slot.path().display(),
            draft.provenance.as_deref().unwrap_or("")
        ),
        None => println!("Nothing to mutate (no production parameter table)."),
    }
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;
    let promoter = &services.promoter;

    match promoter.metrics().load() {
        Some(snapshot) => println!(
            "Baseline accuracy: {:.2}%",
            snapshot.accuracy * 100.0
        ),
        None => println!("Baseline accuracy: none (0.00%)"),
    }

    match promoter.production_module() {
        Ok(Some(module)) => {
            println!("Production: {}", promoter.production_path().display());
            for (name, param) in &module.params {
                println!("  {name:<12} {:>5}  ({})", param.value, param.class);
            }
        }
        Ok(None) => println!("Production: missing"),
        Err(e) => println!("Production: unreadable ({e})"),
    }

    match services.draft_slot.load()? {
        Some(draft) => println!(
            "Draft: {} {}",
            draft.short_hash(),
            draft.provenance.as_deref().unwrap_or("(external)")
        ),
        None => println!("Draft: none"),
    }

    match promoter.versions().latest()? {
        Some(record) => println!(
            "Latest version: {} at {}",
            record.version_id,
            record.created_at.to_rfc3339()
        ),
        None => println!("Latest version: none"),
    }
    Ok(())
}

fn run_versions(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;
    let records = services.promoter.versions().list()?;

    if records.is_empty() && !json {
        println!("No versions yet.");
    }
    for record in records {
        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            let backup = record
                .backup
                .as_deref()
                .and_then(Path::file_stem)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {}  backup={}  {}",
                record.version_id,
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                backup,
                record.provenance.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn run_rollback(config_path: &Path, target: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let services = TunerServices::from_config(&config)?;

    let record = services.promoter.rollback(target)?;
    services.log.record(LogEvent::RolledBack {
        target: target.to_string(),
        version_id: record.version_id.clone(),
    });
    services.notify(&format!(
        "Production rolled back to {target} as {}",
        record.version_id
    ));
    if services.promoter.metrics().load().is_none() {
        warn!("no baseline recorded; the next draft is measured against 0.0");
    }
    println!("Rolled back to {target} (new version {})", record.version_id);
    Ok(())
}
