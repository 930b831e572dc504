//! Synthetic degradation: additive noise with a random per-sample level.

use ndarray::{Array1, Array4, Axis};
use rand::Rng;
use rand_distr::{Distribution, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GuardError, GuardResult};

/// Upper bound of the training noise level, `55/255`.
pub const DEFAULT_SIGMA_MAX: f32 = 55.0 / 255.0;

/// Fixed level of the unseen-noise evaluation, `90/255`.
pub const UNSEEN_SIGMA: f32 = 90.0 / 255.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    #[default]
    Gaussian,
    /// `Poisson(1)` samples standardized over the whole batch.
    Poisson,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub kind: NoiseKind,
    pub sigma_max: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            kind: NoiseKind::Gaussian,
            sigma_max: DEFAULT_SIGMA_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    config: NoiseConfig,
}

impl NoiseGenerator {
    pub fn new(config: NoiseConfig) -> GuardResult<Self> {
        if !(config.sigma_max.is_finite() && config.sigma_max >= 0.0) {
            return Err(GuardError::configuration("noise.sigma_max", "must be finite and >= 0"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &NoiseConfig {
        &self.config
    }

    /// One `U(0, sigma_max)` level per sample.
    pub fn sample_sigmas<R: Rng + ?Sized>(&self, batch: usize, rng: &mut R) -> Array1<f32> {
        Array1::from_shape_simple_fn(batch, || rng.gen::<f32>() * self.config.sigma_max)
    }

    /// Zero-centred noise scaled per sample by `sigmas`.
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize, usize, usize),
        sigmas: &Array1<f32>,
        rng: &mut R,
    ) -> GuardResult<Array4<f32>> {
        if sigmas.len() != shape.0 {
            return Err(GuardError::shape("noise levels", shape.0, sigmas.len()));
        }

        let mut noise = match self.config.kind {
            NoiseKind::Gaussian => {
                Array4::<f32>::from_shape_simple_fn(shape, || StandardNormal.sample(&mut *rng))
            }
            NoiseKind::Poisson => standardized_poisson(shape, rng)?,
        };
        for (mut sample, &sigma) in noise.axis_iter_mut(Axis(0)).zip(sigmas.iter()) {
            sample.mapv_inplace(|v| v * sigma);
        }
        Ok(noise)
    }

    /// `clamp(clean + noise, 0, 1)` with freshly drawn levels.
    pub fn inject<R: Rng + ?Sized>(&self, clean: &Array4<f32>, rng: &mut R) -> GuardResult<Array4<f32>> {
        let sigmas = self.sample_sigmas(clean.dim().0, rng);
        self.inject_with_sigmas(clean, &sigmas, rng)
    }

    pub fn inject_with_sigmas<R: Rng + ?Sized>(
        &self,
        clean: &Array4<f32>,
        sigmas: &Array1<f32>,
        rng: &mut R,
    ) -> GuardResult<Array4<f32>> {
        let noise = self.synthesize(clean.dim(), sigmas, rng)?;
        Ok((clean + &noise).mapv(|v| v.clamp(0.0, 1.0)))
    }
}

fn standardized_poisson<R: Rng + ?Sized>(
    shape: (usize, usize, usize, usize),
    rng: &mut R,
) -> GuardResult<Array4<f32>> {
    let poisson = Poisson::<f32>::new(1.0)
        .map_err(|err| GuardError::configuration("noise.poisson", err.to_string()))?;
    let raw = Array4::from_shape_simple_fn(shape, || poisson.sample(&mut *rng));
    if raw.len() < 2 {
        return Ok(Array4::zeros(shape));
    }

    let mean = raw.mean().unwrap_or(0.0);
    let std = raw.std(1.0);
    if std <= f32::EPSILON {
        warn!(elements = raw.len(), "poisson sample has zero variance, emitting no noise");
        return Ok(Array4::zeros(shape));
    }
    Ok(raw.mapv(|v| (v - mean) / std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sigmas_stay_below_the_cap() {
        let generator = NoiseGenerator::new(NoiseConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let sigmas = generator.sample_sigmas(64, &mut rng);
        assert!(sigmas.iter().all(|s| (0.0..DEFAULT_SIGMA_MAX).contains(s)));
    }

    #[test]
    fn zero_sigma_sample_is_noise_free() {
        let generator = NoiseGenerator::new(NoiseConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let clean = Array4::from_elem((2, 3, 8, 8), 0.5);
        let sigmas = Array1::from_vec(vec![0.0, 0.3]);
        let noisy = generator.inject_with_sigmas(&clean, &sigmas, &mut rng).unwrap();
        assert!(noisy.index_axis(Axis(0), 0).iter().all(|&v| v == 0.5));
        assert!(noisy.index_axis(Axis(0), 1).iter().any(|&v| v != 0.5));
        assert!(noisy.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn poisson_noise_is_standardized() {
        let generator = NoiseGenerator::new(NoiseConfig {
            kind: NoiseKind::Poisson,
            sigma_max: 1.0,
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let noise = generator
            .synthesize((2, 3, 32, 32), &Array1::from_elem(2, 1.0), &mut rng)
            .unwrap();
        assert!(noise.mean().unwrap().abs() < 1e-4);
        assert!((noise.std(1.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn level_count_must_match_batch() {
        let generator = NoiseGenerator::new(NoiseConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(generator
            .synthesize((3, 1, 4, 4), &Array1::zeros(2), &mut rng)
            .is_err());
    }
}
