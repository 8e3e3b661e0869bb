use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use humansize::{format_size, BINARY};
use log::{info, warn};
use std::path::PathBuf;
use vault::retention::StrategyResult;
use vault::{
    CatalogLibrary, DiskProbe, FsDeleter, FsJobLedger, Mode, RetentionEngine, RetentionPlan, VaultConfig,
};

/// Evict old videos from the library by age or free space
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true, env = "VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what would be deleted
    Plan(PolicyArgs),
    /// Delete the planned videos
    Apply(PolicyArgs),
}

#[derive(ClapArgs, Debug)]
struct PolicyArgs {
    /// Evict videos older than this many days (overrides config)
    #[arg(long)]
    age_days: Option<f64>,

    /// Keep at least this much free space, e.g. 10GB (overrides config)
    #[arg(long)]
    space: Option<String>,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Warn });
    }
    logger.format_timestamp_secs().init();

    let cfg = VaultConfig::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let (mode, policy) = match cli.command {
        Command::Plan(p) => (Mode::Plan, p),
        Command::Apply(p) => (Mode::Apply, p),
    };

    let mut request = cfg.retention.clone();
    if policy.age_days.is_some() {
        request.age_threshold_days = policy.age_days;
    }
    if policy.space.is_some() {
        request.space_threshold = policy.space.clone();
    }

    let engine = RetentionEngine::new(
        Box::new(CatalogLibrary::new(Box::new(FsJobLedger::new(&cfg.job_state_dir)), &cfg.sidecar_dir)),
        Box::new(DiskProbe::new(&cfg.final_root)),
        Box::new(FsDeleter::new(&cfg.final_root)),
    );

    info!("Evaluating retention for {}", cfg.final_root.display());
    let plan = engine.evaluate(&request, mode)?;

    report(&plan, policy.json)
}

/// Print the plan. Per-video eviction failures are part of the report, not a failed run.
fn report(plan: &RetentionPlan, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
    } else {
        print_plan(plan);
    }

    if !plan.errors.is_empty() {
        warn!("{} video(s) could not be deleted", plan.errors.len());
    }
    Ok(())
}

fn print_plan(plan: &RetentionPlan) {
    let verb = match plan.mode {
        Mode::Plan => "would free",
        Mode::Apply => "freed",
    };

    print_strategy("Age", &plan.age_strategy, plan.age_strategy.threshold_days.map(|d| format!("older than {} days", d)));
    print_strategy("Space", &plan.space_strategy, plan.space_strategy.threshold.as_ref().map(|t| format!("keep {} free", t)));

    let totals = &plan.simulation_totals;
    println!();
    println!("Total: {} video(s), {} {}", totals.total, verb, format_size(totals.estimated_freed_bytes, BINARY));
    if plan.mode == Mode::Apply {
        println!("  ✅ deleted: {}", totals.deleted_count);
        if totals.failed_count > 0 {
            println!("  ❌ failed:  {}", totals.failed_count);
        }
    }
    for err in &plan.errors {
        println!("  ❌ {}: {}", err.youtube_id, err.message);
    }
}

fn print_strategy(name: &str, result: &StrategyResult, threshold: Option<String>) {
    if !result.enabled {
        println!("{}: not configured", name);
        return;
    }
    println!("{} ({}):", name, threshold.unwrap_or_default());
    if let Some(status) = &result.storage_status {
        println!(
            "  disk: {} free of {} ({}% free)",
            format_size(status.free_bytes, BINARY),
            format_size(status.total_bytes, BINARY),
            status.percent_free
        );
    }
    if !result.needs_cleanup {
        println!("  nothing to do");
        return;
    }
    println!(
        "  {} candidate(s), {}",
        result.candidate_count,
        format_size(result.estimated_freed_bytes, BINARY)
    );
    for video in &result.sample_videos {
        println!(
            "  - {} [{}] {} ({}, {})",
            video.created_at.format("%Y-%m-%d"),
            video.youtube_id,
            video.title,
            video.channel,
            format_size(video.file_size_bytes, BINARY)
        );
    }
    if result.candidate_count > result.sample_videos.len() {
        println!("  ... and {} more", result.candidate_count - result.sample_videos.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault::retention::{EvictionError, SimulationTotals};

    #[test]
    fn test_eviction_failures_do_not_fail_the_run() {
        let plan = RetentionPlan {
            mode: Mode::Apply,
            age_strategy: StrategyResult::default(),
            space_strategy: StrategyResult::default(),
            simulation_totals: SimulationTotals { total: 2, deleted_count: 1, failed_count: 1, ..SimulationTotals::default() },
            errors: vec![EvictionError {
                video_id: "job1/b".to_string(),
                youtube_id: "b".to_string(),
                message: "permission denied".to_string(),
            }],
        };
        assert!(report(&plan, false).is_ok());
        assert!(report(&plan, true).is_ok());
    }

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::try_parse_from(["vault-retention", "apply", "--age-days", "30", "--space", "10GB", "--json"]).unwrap();
        match cli.command {
            Command::Apply(p) => {
                assert_eq!(p.age_days, Some(30.0));
                assert_eq!(p.space.as_deref(), Some("10GB"));
                assert!(p.json);
            }
            Command::Plan(_) => panic!("expected apply"),
        }
    }
}
