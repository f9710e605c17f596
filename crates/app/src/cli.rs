use anyhow::{Context, Result};
use anonymizer::{Anonymizer, AnonymizerConfig, CliArgs, telemetry};
use clap::Parser;
use tracing::{info, warn};

/// Parse the command line, then load models and convert the bag.
pub fn run_from_args() -> Result<()> {
    let args = CliArgs::parse();
    let config_path = args.config.clone();
    let config = AnonymizerConfig::try_from(args)
        .with_context(|| format!("configuration {} rejected", config_path.display()))?;
    run(config)
}

pub fn run(config: AnonymizerConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let metrics_out = config.telemetry.metrics_out.clone();

    let mut anonymizer = Anonymizer::from_config(config)?;
    let result = anonymizer.run();

    if let Some(path) = metrics_out {
        if let Err(err) = telemetry::write_metrics_snapshot(&path) {
            warn!("failed to write metrics to {}: {err}", path.display());
        }
    }

    let summary = result.context("anonymization aborted")?;
    info!(
        "{} messages written ({} images, {} passthrough, {} detections)",
        summary.messages(),
        summary.images,
        summary.passthrough,
        summary.detections
    );
    Ok(())
}
