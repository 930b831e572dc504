//! Spectral guard training driver
//!
//! Usage: spectral-guard-train [config.toml]
//!
//! Trains a filtered denoiser on synthetic patterns with the dual-objective
//! trainer, logging every step to `logs/run.jsonl` and every validation
//! round to `logs/eval.jsonl`. Set `RUST_LOG=debug` for per-pass detail.

mod data;
mod logging;

use std::path::Path;

use anyhow::{Context, Result};
use spectral_guard_core::{
    psnr, DualObjectiveTrainer, Evaluator, FilteredDenoiser, ImagePair, Parameterized, PixelLoss,
    RunConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::data::SyntheticImages;
use crate::logging::RunLog;

const DEFAULT_CONFIG: &str = "config/train.toml";
const VALIDATION_BATCH: usize = 2;

fn main() -> Result<()> {
    init_tracing();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = load_config(&path)?;

    let filter = config
        .filter
        .build(config.network.channels)
        .context("building frequency filter")?;
    let network = FilteredDenoiser::new(&config.network, filter).context("building denoiser")?;
    let mut trainer = DualObjectiveTrainer::new(
        network,
        config.train.loss.build(config.train.loss_weight),
        config.optim.backbone.build().context("backbone optimizer")?,
        config.optim.filter.build().context("filter optimizer")?,
        config.train.objective.clone(),
    )?;
    info!(
        parameters = trainer.network().parameter_count(),
        total_iter = config.train.total_iter,
        "trainer ready"
    );

    let seed = config.train.objective.seed;
    let mut train_data = SyntheticImages::new(seed, config.network.channels, config.train.patch_size);
    let validation = SyntheticImages::new(seed.wrapping_add(1), config.network.channels, config.train.patch_size * 2)
        .next_batch(VALIDATION_BATCH);
    let mut evaluator = Evaluator::new(&config.val.evaluation)?;
    let log = RunLog::create("logs").context("creating log directory")?;

    for _ in 0..config.train.total_iter {
        let batch = train_data.next_batch(config.train.batch_size);
        let report = trainer.train_step(&batch)?;
        info!(
            iter = report.iteration,
            l_pix = report.get("l_pix").unwrap_or(f32::NAN),
            l_adv = report.get("l_adv").unwrap_or(f32::NAN),
            l_total_filter = report.get("l_total_filter").unwrap_or(f32::NAN),
            "step"
        );
        if let Err(err) = log.log_step(&report, &trainer.filter_scalars()) {
            warn!(%err, "failed to write step log");
        }

        let every = config.val.every;
        if every > 0 && report.iteration % every == 0 && report.iteration < config.train.total_iter {
            validate(&config, &mut evaluator, &trainer, &validation, &log)?;
        }
    }

    validate(&config, &mut evaluator, &trainer, &validation, &log)?;
    info!("training complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default().with(filter).with(fmt::layer().with_target(false)).init();
}

fn load_config(path: &str) -> Result<RunConfig> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, using defaults");
        return Ok(RunConfig::default());
    }
    let config = RunConfig::load_from_file(path).with_context(|| format!("loading {path}"))?;
    info!(path, "loaded config");
    Ok(config)
}

fn validate(
    config: &RunConfig,
    evaluator: &mut Evaluator,
    trainer: &DualObjectiveTrainer<FilteredDenoiser>,
    pair: &ImagePair,
    log: &RunLog,
) -> Result<()> {
    let iteration = trainer.iteration();
    for &mode in &config.val.modes {
        let result = evaluator.evaluate(mode, trainer.network(), trainer.loss(), pair)?;
        let score = psnr(&result.output, &pair.gt)?;
        let (l_pix, _) = trainer.loss().evaluate(&result.output, &pair.gt)?;
        info!(iter = iteration, mode = %mode, psnr = score, l_pix, "validation");
        if let Err(err) = log.log_evaluation(iteration, mode.label(), score, l_pix) {
            warn!(%err, "failed to write evaluation log");
        }
    }
    Ok(())
}
