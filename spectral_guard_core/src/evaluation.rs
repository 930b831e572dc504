//! Validation under four input conditions.
//!
//! * `Real`: the supplied degraded input.
//! * `Adversarial`: the ground truth perturbed against itself.
//! * `SeenNoise`: Gaussian noise at a random level from the training range.
//! * `UnseenNoise`: Gaussian noise at the fixed level `90/255`.
//!
//! Prediction runs in minibatches, or one sample at a time through the
//! tiling engine when tiling is configured.

use std::fmt;

use ndarray::{concatenate, s, Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attack::{AttackConfig, PerturbationGenerator};
use crate::error::{GuardError, GuardResult};
use crate::network::RestorationNetwork;
use crate::nn::PixelLoss;
use crate::noise::{NoiseConfig, NoiseGenerator, NoiseKind, DEFAULT_SIGMA_MAX, UNSEEN_SIGMA};
use crate::tiling::{predict_minibatched, TiledInference, TilingConfig};
use crate::training::ImagePair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Real,
    Adversarial,
    SeenNoise,
    UnseenNoise,
}

impl EvaluationMode {
    pub const ALL: [EvaluationMode; 4] = [
        EvaluationMode::Real,
        EvaluationMode::Adversarial,
        EvaluationMode::SeenNoise,
        EvaluationMode::UnseenNoise,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EvaluationMode::Real => "real",
            EvaluationMode::Adversarial => "adv",
            EvaluationMode::SeenNoise => "seen_noise",
            EvaluationMode::UnseenNoise => "unseen_noise",
        }
    }
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub attack: AttackConfig,
    pub max_minibatch: Option<usize>,
    pub tiling: Option<TilingConfig>,
    pub seed: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            attack: AttackConfig::default(),
            max_minibatch: None,
            tiling: None,
            seed: 0,
        }
    }
}

/// Input and prediction of one evaluation call.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub mode: EvaluationMode,
    pub input: Array4<f32>,
    pub output: Array4<f32>,
}

pub struct Evaluator {
    attack: PerturbationGenerator,
    seen_noise: NoiseGenerator,
    tiling: Option<TiledInference>,
    max_minibatch: Option<usize>,
    rng: StdRng,
}

impl Evaluator {
    pub fn new(config: &EvaluationConfig) -> GuardResult<Self> {
        if config.max_minibatch == Some(0) {
            return Err(GuardError::configuration("val.max_minibatch", "must be > 0"));
        }
        Ok(Self {
            attack: PerturbationGenerator::new(config.attack)?,
            seen_noise: NoiseGenerator::new(NoiseConfig {
                kind: NoiseKind::Gaussian,
                sigma_max: DEFAULT_SIGMA_MAX,
            })?,
            tiling: config.tiling.map(TiledInference::new).transpose()?,
            max_minibatch: config.max_minibatch,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    /// Degraded input for `mode`.
    pub fn prepare_input<N>(
        &mut self,
        mode: EvaluationMode,
        network: &N,
        loss: &dyn PixelLoss,
        pair: &ImagePair,
    ) -> GuardResult<Array4<f32>>
    where
        N: RestorationNetwork + ?Sized,
    {
        match mode {
            EvaluationMode::Real => Ok(pair.lq.clone()),
            EvaluationMode::Adversarial => {
                self.attack
                    .perturb(network, loss, &pair.gt, &pair.gt, &mut self.rng)
            }
            EvaluationMode::SeenNoise => self.seen_noise.inject(&pair.gt, &mut self.rng),
            EvaluationMode::UnseenNoise => {
                let sigmas = Array1::from_elem(pair.batch_size(), UNSEEN_SIGMA);
                self.seen_noise
                    .inject_with_sigmas(&pair.gt, &sigmas, &mut self.rng)
            }
        }
    }

    pub fn evaluate<N>(
        &mut self,
        mode: EvaluationMode,
        network: &N,
        loss: &dyn PixelLoss,
        pair: &ImagePair,
    ) -> GuardResult<Evaluation>
    where
        N: RestorationNetwork + ?Sized,
    {
        let input = self.prepare_input(mode, network, loss, pair)?;
        let output = self.predict(network, &input)?;
        debug!(mode = mode.label(), batch = input.dim().0, "evaluated");
        Ok(Evaluation { mode, input, output })
    }

    pub fn predict<N>(&self, network: &N, input: &Array4<f32>) -> GuardResult<Array4<f32>>
    where
        N: RestorationNetwork + ?Sized,
    {
        let Some(tiling) = &self.tiling else {
            return predict_minibatched(network, input, self.max_minibatch);
        };

        let batch = input.dim().0;
        let outputs = (0..batch)
            .map(|b| tiling.predict(network, &input.slice(s![b..b + 1, .., .., ..]).to_owned()))
            .collect::<GuardResult<Vec<_>>>()?;
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        concatenate(Axis(0), &views).map_err(|err| GuardError::shape("tiled outputs", batch, err.to_string()))
    }
}

/// Peak signal-to-noise ratio in dB for images in `[0, 1]`.
pub fn psnr(prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<f32> {
    if prediction.dim() != target.dim() {
        return Err(GuardError::shape("psnr", target.dim(), prediction.dim()));
    }
    let mse = (prediction - target).mapv(|d| d * d).mean().unwrap_or(0.0);
    if mse <= f32::EPSILON * f32::EPSILON {
        return Ok(f32::INFINITY);
    }
    Ok(-10.0 * mse.log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Gradients, MseLoss, Parameterized};
    use crate::tiling::CropExtent;
    use ndarray::{ArrayViewD, ArrayViewMutD};

    struct Passthrough;

    impl Parameterized for Passthrough {
        fn visit_parameters(&self, _visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {}
        fn visit_parameters_mut(&mut self, _visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {}
    }

    impl RestorationNetwork for Passthrough {
        type Trace = ();

        fn forward_traced(&self, input: &Array4<f32>) -> GuardResult<(Array4<f32>, ())> {
            Ok((input.clone(), ()))
        }

        fn backward(&self, _trace: &(), grad_output: &Array4<f32>, _grads: &mut Gradients) -> GuardResult<Array4<f32>> {
            Ok(grad_output.clone())
        }
    }

    fn pair() -> ImagePair {
        let gt = Array4::from_shape_fn((3, 1, 8, 8), |(b, _, r, c)| ((b + r * 3 + c) % 16) as f32 / 16.0);
        ImagePair::new(gt.mapv(|v| v * 0.5), gt).unwrap()
    }

    #[test]
    fn real_mode_uses_supplied_input() {
        let mut evaluator = Evaluator::new(&EvaluationConfig::default()).unwrap();
        let pair = pair();
        let result = evaluator
            .evaluate(EvaluationMode::Real, &Passthrough, &MseLoss { weight: 1.0 }, &pair)
            .unwrap();
        assert_eq!(result.input, pair.lq);
        assert_eq!(result.output, pair.lq);
    }

    #[test]
    fn adversarial_mode_stays_in_ball_around_ground_truth() {
        let mut evaluator = Evaluator::new(&EvaluationConfig::default()).unwrap();
        let pair = pair();
        let input = evaluator
            .prepare_input(EvaluationMode::Adversarial, &Passthrough, &MseLoss { weight: 1.0 }, &pair)
            .unwrap();
        let max_shift = (&input - &pair.gt).mapv(f32::abs).fold(0.0f32, |a, &b| a.max(b));
        assert!(max_shift <= 0.1 + 1e-6);
    }

    #[test]
    fn noise_modes_stay_in_range() {
        let mut evaluator = Evaluator::new(&EvaluationConfig::default()).unwrap();
        let pair = pair();
        for mode in [EvaluationMode::SeenNoise, EvaluationMode::UnseenNoise] {
            let input = evaluator
                .prepare_input(mode, &Passthrough, &MseLoss { weight: 1.0 }, &pair)
                .unwrap();
            assert!(input.iter().all(|v| (0.0..=1.0).contains(v)), "{mode}");
            assert_ne!(input, pair.gt);
        }
    }

    #[test]
    fn tiled_prediction_matches_minibatched() {
        let pair = pair();
        let tiled = Evaluator::new(&EvaluationConfig {
            tiling: Some(TilingConfig {
                crop_h: CropExtent::Pixels(5),
                crop_w: CropExtent::Pixels(6),
                scale: 1,
                max_minibatch: Some(2),
            }),
            ..EvaluationConfig::default()
        })
        .unwrap();
        let plain = Evaluator::new(&EvaluationConfig {
            max_minibatch: Some(2),
            ..EvaluationConfig::default()
        })
        .unwrap();
        assert_eq!(
            tiled.predict(&Passthrough, &pair.gt).unwrap(),
            plain.predict(&Passthrough, &pair.gt).unwrap()
        );
    }

    #[test]
    fn psnr_of_identical_images_is_infinite() {
        let pair = pair();
        assert!(psnr(&pair.gt, &pair.gt).unwrap().is_infinite());
        let value = psnr(&pair.lq, &pair.gt).unwrap();
        assert!(value.is_finite() && value > 0.0);
    }
}
