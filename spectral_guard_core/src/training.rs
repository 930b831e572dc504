//! Dual-objective adversarial training.
//!
//! One step runs three phases:
//!
//! 1. **Noise injection**: the degraded input is synthesized from the ground
//!    truth, or taken from the batch as is.
//! 2. **Raw pass**: an adversarial counterpart of the degraded input is
//!    built against the current network. The combined loss
//!    `l_pix/(1+α) + α/(1+α)·l_adv` is minimized, where `l_adv` compares the
//!    prediction on the adversarial input with the prediction on the
//!    degraded input. Only the backbone group is stepped.
//! 3. **Filtered pass**: a fresh random band mask is applied to the degraded,
//!    ground-truth and adversarial tensors alike and the same objective is
//!    minimized on the filtered copies. The backbone group steps, then the
//!    filter group steps with reversed gradients, so the filter ascends the
//!    loss the backbone descends.
//!
//! Every pass owns its gradient buffer and consumes it before the next pass
//! starts. Non-finite losses or gradients abort the step.

use std::collections::BTreeMap;

use ndarray::{Array4, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attack::{AttackConfig, PerturbationGenerator};
use crate::error::{ensure_finite, GuardError, GuardResult};
use crate::filter::RandomBandFilter;
use crate::network::RestorationNetwork;
use crate::noise::{NoiseConfig, NoiseGenerator};
use crate::nn::{Gradients, Optimizer, ParameterGroup, PixelLoss};
use crate::spectral::DENSE_BAND_COUNT;

/// A degraded input and its ground truth, both `(batch, channels, h, w)`.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub lq: Array4<f32>,
    pub gt: Array4<f32>,
}

impl ImagePair {
    pub fn new(lq: Array4<f32>, gt: Array4<f32>) -> GuardResult<Self> {
        if lq.dim() != gt.dim() {
            return Err(GuardError::shape("image pair", gt.dim(), lq.dim()));
        }
        Ok(Self { lq, gt })
    }

    pub fn batch_size(&self) -> usize {
        self.gt.dim().0
    }
}

/// Whether the filter group is updated during the filtered pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSchedule {
    /// Step the filter group with reversed gradients.
    #[default]
    Adversarial,
    /// Keep filter parameters fixed.
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    NoiseInjection,
    RawPass,
    FilteredPass,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualObjectiveConfig {
    /// Synthesize the degraded input from the ground truth instead of using
    /// the supplied one.
    pub synthesize_noise: bool,
    pub noise: NoiseConfig,
    pub attack: AttackConfig,
    /// Weight of the adversarial term.
    pub alpha: f32,
    /// Global gradient-norm cap, `None` disables clipping.
    pub grad_clip: Option<f32>,
    /// Band count of the random augmentation mask.
    pub augment_bands: usize,
    pub filter_schedule: FilterSchedule,
    /// Run the filtered pass at all.
    pub filtered_pass: bool,
    pub seed: u64,
}

impl Default for DualObjectiveConfig {
    fn default() -> Self {
        Self {
            synthesize_noise: true,
            noise: NoiseConfig::default(),
            attack: AttackConfig::default(),
            alpha: 1.0,
            grad_clip: Some(0.01),
            augment_bands: DENSE_BAND_COUNT,
            filter_schedule: FilterSchedule::Adversarial,
            filtered_pass: true,
            seed: 0,
        }
    }
}

impl DualObjectiveConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if !(self.alpha.is_finite() && self.alpha >= 0.0) {
            return Err(GuardError::configuration("alpha", "must be finite and >= 0"));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(GuardError::configuration("grad_clip", "must be finite and > 0"));
            }
        }
        if self.augment_bands == 0 {
            return Err(GuardError::configuration("augment_bands", "must be > 0"));
        }
        self.attack.validate()
    }

    fn loss_weights(&self) -> (f32, f32) {
        let norm = 1.0 + self.alpha;
        (1.0 / norm, self.alpha / norm)
    }
}

/// Scalar outcome of one training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub iteration: u64,
    pub losses: BTreeMap<String, f32>,
}

impl StepReport {
    pub fn get(&self, key: &str) -> Option<f32> {
        self.losses.get(key).copied()
    }
}

struct PassOutcome {
    l_pix: f32,
    l_adv: f32,
    l_total: f32,
    grad_norm: f32,
    grads: Gradients,
}

pub struct DualObjectiveTrainer<N: RestorationNetwork> {
    network: N,
    loss: Box<dyn PixelLoss>,
    backbone: ParameterGroup,
    filter: ParameterGroup,
    attack: PerturbationGenerator,
    noise: NoiseGenerator,
    augment: RandomBandFilter,
    config: DualObjectiveConfig,
    rng: StdRng,
    phase: TrainingPhase,
    iteration: u64,
}

impl<N: RestorationNetwork> DualObjectiveTrainer<N> {
    pub fn new(
        network: N,
        loss: Box<dyn PixelLoss>,
        backbone_optimizer: Box<dyn Optimizer>,
        filter_optimizer: Box<dyn Optimizer>,
        config: DualObjectiveConfig,
    ) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self {
            network,
            loss,
            backbone: ParameterGroup::backbone(backbone_optimizer),
            filter: ParameterGroup::filter(filter_optimizer),
            attack: PerturbationGenerator::new(config.attack)?,
            noise: NoiseGenerator::new(config.noise)?,
            augment: RandomBandFilter::new(config.augment_bands)?,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            phase: TrainingPhase::Done,
            iteration: 0,
        })
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn into_network(self) -> N {
        self.network
    }

    pub fn loss(&self) -> &dyn PixelLoss {
        self.loss.as_ref()
    }

    pub fn config(&self) -> &DualObjectiveConfig {
        &self.config
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn backbone_group_mut(&mut self) -> &mut ParameterGroup {
        &mut self.backbone
    }

    pub fn filter_group_mut(&mut self) -> &mut ParameterGroup {
        &mut self.filter
    }

    /// Current value of every scalar filter parameter.
    pub fn filter_scalars(&self) -> BTreeMap<String, f32> {
        self.network.filter_scalars()
    }

    pub fn parameter_snapshot(&self) -> BTreeMap<String, ArrayD<f32>> {
        self.network.parameter_snapshot()
    }

    /// Runs noise injection, the raw pass and the filtered pass on one batch.
    pub fn train_step(&mut self, batch: &ImagePair) -> GuardResult<StepReport> {
        if batch.lq.dim() != batch.gt.dim() {
            return Err(GuardError::shape("image pair", batch.gt.dim(), batch.lq.dim()));
        }
        self.iteration += 1;
        let mut losses = BTreeMap::new();

        self.phase = TrainingPhase::NoiseInjection;
        let degraded = if self.config.synthesize_noise {
            self.noise.inject(&batch.gt, &mut self.rng)?
        } else {
            batch.lq.clone()
        };

        self.phase = TrainingPhase::RawPass;
        let adversarial = self.attack.perturb(
            &self.network,
            self.loss.as_ref(),
            &degraded,
            &batch.gt,
            &mut self.rng,
        )?;
        let mut raw = self.combined_pass(&degraded, &batch.gt, &adversarial, "raw pass")?;
        self.backbone.step(&mut self.network, &mut raw.grads)?;
        losses.insert("l_pix".to_string(), raw.l_pix);
        losses.insert("l_adv".to_string(), raw.l_adv);
        losses.insert("l_total".to_string(), raw.l_total);
        losses.insert("grad_norm".to_string(), raw.grad_norm);

        if self.config.filtered_pass {
            self.phase = TrainingPhase::FilteredPass;
            let (batch_size, _, height, width) = batch.gt.dim();
            let (mask, _) = self.augment.sample_mask(batch_size, height, width, &mut self.rng)?;
            let filtered_lq = self.augment.apply(&degraded, &mask)?;
            let filtered_gt = self.augment.apply(&batch.gt, &mask)?;
            let filtered_adv = self.augment.apply(&adversarial, &mask)?;

            let mut filtered =
                self.combined_pass(&filtered_lq, &filtered_gt, &filtered_adv, "filtered pass")?;
            self.backbone.step(&mut self.network, &mut filtered.grads)?;
            if self.config.filter_schedule == FilterSchedule::Adversarial {
                let updated = self.filter.step(&mut self.network, &mut filtered.grads)?;
                debug!(updated, "filter group stepped with reversed gradients");
            }
            losses.insert("l_pix_filter".to_string(), filtered.l_pix);
            losses.insert("l_adv_filter".to_string(), filtered.l_adv);
            losses.insert("l_total_filter".to_string(), filtered.l_total);
            losses.insert("grad_norm_filter".to_string(), filtered.grad_norm);
        }

        self.phase = TrainingPhase::Done;
        Ok(StepReport {
            iteration: self.iteration,
            losses,
        })
    }

    /// Forward both inputs, evaluate the combined objective and backpropagate
    /// it through both predictions.
    fn combined_pass(
        &self,
        input: &Array4<f32>,
        target: &Array4<f32>,
        adversarial: &Array4<f32>,
        context: &str,
    ) -> GuardResult<PassOutcome> {
        let (prediction, trace) = self.network.forward_traced(input)?;
        let (adv_prediction, adv_trace) = self.network.forward_traced(adversarial)?;

        let (l_pix, grad_pix) = self.loss.evaluate(&prediction, target)?;
        // The prediction on the clean input is the target of the adversarial term.
        let (l_adv, grad_adv) = self.loss.evaluate(&adv_prediction, &prediction)?;

        let (w_pix, w_adv) = self.config.loss_weights();
        let l_total = ensure_finite(&format!("{context} loss"), w_pix * l_pix + w_adv * l_adv)?;

        let grad_prediction = grad_pix * w_pix - &grad_adv * w_adv;
        let grad_adv_prediction = grad_adv * w_adv;

        let mut grads = Gradients::new();
        self.network.backward(&trace, &grad_prediction, &mut grads)?;
        self.network.backward(&adv_trace, &grad_adv_prediction, &mut grads)?;
        grads.ensure_finite(context)?;

        let grad_norm = match self.config.grad_clip {
            Some(max_norm) => {
                let norm = grads.clip_global_norm(max_norm);
                if norm > 1e3 * max_norm {
                    warn!(context, norm, max_norm, "gradient norm far above clip threshold");
                }
                norm
            }
            None => grads.global_norm(),
        };
        debug!(context, l_pix, l_adv, l_total, grad_norm, "pass complete");

        Ok(PassOutcome {
            l_pix,
            l_adv,
            l_total,
            grad_norm,
            grads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterStage, FixedBandFilter};
    use crate::network::{DenoiserConfig, FilteredDenoiser};
    use crate::nn::{MseLoss, SgdOptimizer};

    fn trainer(schedule: FilterSchedule, filtered_pass: bool) -> DualObjectiveTrainer<FilteredDenoiser> {
        let network = FilteredDenoiser::new(
            &DenoiserConfig {
                channels: 1,
                features: 3,
                depth: 2,
                alignment: 1,
                seed: 3,
            },
            FilterStage::Fixed(FixedBandFilter::default()),
        )
        .unwrap();
        let config = DualObjectiveConfig {
            augment_bands: 10,
            filter_schedule: schedule,
            filtered_pass,
            grad_clip: None,
            seed: 21,
            ..DualObjectiveConfig::default()
        };
        DualObjectiveTrainer::new(
            network,
            Box::new(MseLoss { weight: 1.0 }),
            Box::new(SgdOptimizer::new(0.05, 0.0, 0.0)),
            Box::new(SgdOptimizer::new(1.0, 0.0, 0.0)),
            config,
        )
        .unwrap()
    }

    fn batch() -> ImagePair {
        let gt = Array4::from_shape_fn((2, 1, 8, 8), |(b, _, r, c)| {
            0.5 + 0.3 * ((r as f32 * 0.7 + c as f32 * 0.4 + b as f32).sin())
        });
        ImagePair::new(gt.clone(), gt).unwrap()
    }

    #[test]
    fn step_reports_every_loss() {
        let mut trainer = trainer(FilterSchedule::Adversarial, true);
        let report = trainer.train_step(&batch()).unwrap();
        for key in [
            "l_pix",
            "l_adv",
            "l_total",
            "l_pix_filter",
            "l_adv_filter",
            "l_total_filter",
            "grad_norm",
            "grad_norm_filter",
        ] {
            let value = report.get(key).unwrap_or(f32::NAN);
            assert!(value.is_finite(), "{key} = {value}");
        }
        assert_eq!(report.iteration, 1);
        assert_eq!(trainer.phase(), TrainingPhase::Done);
    }

    #[test]
    fn total_loss_is_the_weighted_mix() {
        let mut trainer = trainer(FilterSchedule::Adversarial, false);
        let report = trainer.train_step(&batch()).unwrap();
        let (l_pix, l_adv) = (report.get("l_pix").unwrap(), report.get("l_adv").unwrap());
        let expected = 0.5 * l_pix + 0.5 * l_adv;
        assert!((report.get("l_total").unwrap() - expected).abs() < 1e-6);
        assert!(report.get("l_pix_filter").is_none());
    }

    #[test]
    fn frozen_schedule_keeps_filter_parameters() {
        let mut frozen = trainer(FilterSchedule::Frozen, true);
        let before = frozen.filter_scalars();
        frozen.train_step(&batch()).unwrap();
        assert_eq!(frozen.filter_scalars(), before);

        let mut adversarial = trainer(FilterSchedule::Adversarial, true);
        let before = adversarial.filter_scalars();
        adversarial.train_step(&batch()).unwrap();
        assert_ne!(adversarial.filter_scalars(), before);
    }

    #[test]
    fn raw_pass_only_moves_the_backbone() {
        let mut trainer = trainer(FilterSchedule::Adversarial, false);
        let before = trainer.parameter_snapshot();
        trainer.train_step(&batch()).unwrap();
        let after = trainer.parameter_snapshot();
        assert_eq!(before["filter.band0.value"], after["filter.band0.value"]);
        assert_ne!(before["body.0.weight"], after["body.0.weight"]);
    }

    #[test]
    fn non_finite_input_aborts_the_step() {
        let mut trainer = trainer(FilterSchedule::Adversarial, true);
        trainer.config.synthesize_noise = false;
        let mut pair = batch();
        pair.lq[[0, 0, 3, 3]] = f32::NAN;
        let err = trainer.train_step(&pair).unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    fn invalid_alpha_is_rejected() {
        let config = DualObjectiveConfig {
            alpha: -1.0,
            ..DualObjectiveConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
