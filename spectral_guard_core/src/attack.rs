//! Projected sign-gradient perturbations against the current network.
//!
//! Each iteration moves the input along `sign(∂loss/∂input)` by a random
//! step, then projects back into the L∞ ball of radius `epsilon` around the
//! clean input and into the valid pixel range `[0, 1]`.

use ndarray::{Array4, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GuardError, GuardResult};
use crate::network::RestorationNetwork;
use crate::nn::activation::sign;
use crate::nn::{Gradients, PixelLoss};

/// Default step cap: `U(0, 16/255)` per sample.
pub const DEFAULT_MAX_STEP: f32 = 16.0 / 255.0;

/// How the step length of one iteration is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDistribution {
    /// One `U(0, max)` step per sample.
    Uniform { max: f32 },
    /// `|N(0, 1)| · scale` per pixel.
    HalfNormal { scale: f32 },
}

impl Default for StepDistribution {
    fn default() -> Self {
        StepDistribution::Uniform {
            max: DEFAULT_MAX_STEP,
        }
    }
}

impl StepDistribution {
    fn validate(&self) -> GuardResult<()> {
        let (name, value) = match *self {
            StepDistribution::Uniform { max } => ("attack.step.max", max),
            StepDistribution::HalfNormal { scale } => ("attack.step.scale", scale),
        };
        if !(value.is_finite() && value >= 0.0) {
            return Err(GuardError::configuration(name, "must be finite and >= 0"));
        }
        Ok(())
    }

    /// Step tensor broadcastable to `shape`.
    pub fn sample<R: Rng + ?Sized>(&self, shape: (usize, usize, usize, usize), rng: &mut R) -> Array4<f32> {
        let (batch, channels, height, width) = shape;
        match *self {
            StepDistribution::Uniform { max } => {
                let per_sample = Array4::from_shape_simple_fn((batch, 1, 1, 1), || rng.gen::<f32>() * max);
                let mut steps = Array4::zeros(shape);
                for (mut plane, step) in steps.axis_iter_mut(Axis(0)).zip(per_sample.iter()) {
                    plane.fill(*step);
                }
                steps
            }
            StepDistribution::HalfNormal { scale } => Array4::from_shape_simple_fn(
                (batch, channels, height, width),
                || {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    z.abs() * scale
                },
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    /// L∞ radius around the clean input.
    pub epsilon: f32,
    pub step: StepDistribution,
    pub iterations: usize,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            step: StepDistribution::default(),
            iterations: 1,
        }
    }
}

impl AttackConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(GuardError::configuration("attack.epsilon", "must be finite and >= 0"));
        }
        if self.iterations == 0 {
            return Err(GuardError::configuration("attack.iterations", "must be > 0"));
        }
        self.step.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackPhase {
    Clean,
    Perturbing { iteration: usize },
    Converged,
}

/// Stateless apart from the phase of the last `perturb` call.
#[derive(Debug, Clone)]
pub struct PerturbationGenerator {
    config: AttackConfig,
    phase: AttackPhase,
}

impl PerturbationGenerator {
    pub fn new(config: AttackConfig) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            phase: AttackPhase::Clean,
        })
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn phase(&self) -> AttackPhase {
        self.phase
    }

    /// Builds the adversarial counterpart of `input` that increases
    /// `loss(network(input), target)`.
    ///
    /// Parameter gradients produced on the way are discarded; the network is
    /// only read.
    pub fn perturb<N, R>(
        &mut self,
        network: &N,
        loss: &dyn PixelLoss,
        input: &Array4<f32>,
        target: &Array4<f32>,
        rng: &mut R,
    ) -> GuardResult<Array4<f32>>
    where
        N: RestorationNetwork + ?Sized,
        R: Rng + ?Sized,
    {
        self.phase = AttackPhase::Clean;
        let mut current = input.clone();

        for iteration in 0..self.config.iterations {
            self.phase = AttackPhase::Perturbing { iteration };

            let (prediction, trace) = network.forward_traced(&current)?;
            let (value, grad_prediction) = loss.evaluate(&prediction, target)?;
            let mut scratch = Gradients::new();
            let grad_input = network.backward(&trace, &grad_prediction, &mut scratch)?;

            let steps = self.config.step.sample(current.dim(), rng);
            current = project_sign_step(&current, &grad_input, &steps, input, self.config.epsilon)?;
            debug!(iteration, loss = value, "perturbation step");
        }

        self.phase = AttackPhase::Converged;
        Ok(current)
    }
}

/// `clamp(clamp(current + sign(grad) · steps, origin ± epsilon), 0, 1)`.
pub fn project_sign_step(
    current: &Array4<f32>,
    grad: &Array4<f32>,
    steps: &Array4<f32>,
    origin: &Array4<f32>,
    epsilon: f32,
) -> GuardResult<Array4<f32>> {
    let dim = current.dim();
    for (context, other) in [("gradient", grad.dim()), ("steps", steps.dim()), ("origin", origin.dim())] {
        if other != dim {
            return Err(GuardError::shape(format!("perturbation {context}"), dim, other));
        }
    }

    let mut next = current.clone();
    Zip::from(&mut next)
        .and(grad)
        .and(steps)
        .and(origin)
        .for_each(|x, &g, &step, &o| {
            let moved = *x + sign(g) * step;
            *x = moved.max(o - epsilon).min(o + epsilon).max(0.0).min(1.0);
        });
    Ok(next)
}
