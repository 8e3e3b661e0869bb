use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use vault::finalize::StepOutcome;
use vault::{FinalizeContext, Finalizer, VaultConfig};

/// Finalize a completed download: archive sidecar, tag, move out of staging
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media file produced by the downloader
    media_path: PathBuf,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, env = "VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Download job this file belongs to
    #[arg(long, env = "VAULT_JOB_ID")]
    job_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only raises the default
    let mut logger = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info });
    }
    logger.format_timestamp_secs().init();

    let cfg = VaultConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("Finalizing {}", args.media_path.display());
    info!("  Staging: {}", if cfg.staging_enabled { "enabled" } else { "disabled" });
    info!("  Final root: {}", cfg.final_root.display());
    info!("  Ledger: {}", cfg.ledger_path.display());

    let finalizer = Finalizer::new(FinalizeContext::from_config(cfg, args.job_id));
    let report = finalizer
        .run(&args.media_path)
        .await
        .with_context(|| format!("Finalization failed for {}", args.media_path.display()))?;

    for (step, outcome) in &report.steps {
        match outcome {
            StepOutcome::Failed(_) => warn!("  {:?}: {}", step, outcome),
            _ => info!("  {:?}: {}", step, outcome),
        }
    }

    if report.is_noop() {
        info!("Nothing to finalize for {}", args.media_path.display());
    } else {
        let final_path = report.final_path.as_ref().unwrap_or(&report.media_path);
        info!(
            "✅ Finalized {} -> {}",
            report.video_id.as_deref().unwrap_or("?"),
            final_path.display()
        );
    }

    Ok(())
}
