//! Optimizers with per-parameter state keyed by name.

use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};

/// In-place update rule applied one named parameter at a time.
pub trait Optimizer: Send {
    /// Updates `param` from `gradient`. State for `param_name` is created
    /// on first use.
    fn step(&mut self, param_name: &str, param: ArrayViewMutD<'_, f32>, gradient: ArrayViewD<'_, f32>);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);

    /// Drops all accumulated state.
    fn reset(&mut self);
}

/// Stochastic Gradient Descent with momentum.
///
/// ```text
/// velocity = momentum * velocity + learning_rate * (gradient + weight_decay * param)
/// param = param - velocity
/// ```
#[derive(Debug, Clone)]
pub struct SgdOptimizer {
    pub learning_rate: f32,
    /// 0.0 disables momentum.
    pub momentum: f32,
    /// L2 regularization strength.
    pub weight_decay: f32,
    velocities: HashMap<String, ArrayD<f32>>,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocities: HashMap::new(),
        }
    }
}

impl Optimizer for SgdOptimizer {
    fn step(&mut self, param_name: &str, mut param: ArrayViewMutD<'_, f32>, gradient: ArrayViewD<'_, f32>) {
        let velocity = self
            .velocities
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.weight_decay);
        Zip::from(velocity)
            .and(&mut param)
            .and(&gradient)
            .for_each(|v, p, &g| {
                *v = momentum * *v + lr * (g + decay * *p);
                *p -= *v;
            });
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }
}

#[derive(Debug, Clone)]
struct AdamSlot {
    first_moment: ArrayD<f32>,
    second_moment: ArrayD<f32>,
    t: i32,
}

/// Adam (Adaptive Moment Estimation).
///
/// With `decoupled_weight_decay` the decay is applied directly to the
/// parameter (AdamW) instead of being folded into the gradient.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub decoupled_weight_decay: bool,
    slots: HashMap<String, AdamSlot>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            decoupled_weight_decay: false,
            slots: HashMap::new(),
        }
    }

    pub fn adamw(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            decoupled_weight_decay: true,
            ..Self::new(learning_rate, weight_decay)
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Number of updates applied to `param_name` so far.
    pub fn steps_taken(&self, param_name: &str) -> i32 {
        self.slots.get(param_name).map_or(0, |s| s.t)
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, param_name: &str, mut param: ArrayViewMutD<'_, f32>, gradient: ArrayViewD<'_, f32>) {
        let slot = self
            .slots
            .entry(param_name.to_string())
            .or_insert_with(|| AdamSlot {
                first_moment: ArrayD::zeros(param.raw_dim()),
                second_moment: ArrayD::zeros(param.raw_dim()),
                t: 0,
            });
        slot.t += 1;

        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let decay = self.weight_decay;
        let decoupled = self.decoupled_weight_decay;
        let bias1 = 1.0 - b1.powi(slot.t);
        let bias2 = 1.0 - b2.powi(slot.t);

        Zip::from(&mut slot.first_moment)
            .and(&mut slot.second_moment)
            .and(&mut param)
            .and(&gradient)
            .for_each(|m, v, p, &g| {
                let g = if decoupled { g } else { g + decay * *p };
                if decoupled && decay > 0.0 {
                    *p -= lr * decay * *p;
                }
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.slots.clear();
    }
}

/// Optimizer settings as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        learning_rate: f32,
        #[serde(default)]
        momentum: f32,
        #[serde(default)]
        weight_decay: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default)]
        weight_decay: f32,
    },
    #[serde(rename = "adamw")]
    AdamW {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default)]
        weight_decay: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            learning_rate: 1e-3,
            beta1: default_beta1(),
            beta2: default_beta2(),
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f32 {
        match *self {
            OptimizerConfig::Sgd { learning_rate, .. }
            | OptimizerConfig::Adam { learning_rate, .. }
            | OptimizerConfig::AdamW { learning_rate, .. } => learning_rate,
        }
    }

    pub fn validate(&self) -> GuardResult<()> {
        let lr = self.learning_rate();
        if !lr.is_finite() || lr <= 0.0 {
            return Err(GuardError::configuration("learning_rate", "must be positive"));
        }
        if let OptimizerConfig::Adam { beta1, beta2, .. } | OptimizerConfig::AdamW { beta1, beta2, .. } = *self {
            if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
                return Err(GuardError::configuration("betas", "must lie in [0, 1)"));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> GuardResult<Box<dyn Optimizer>> {
        self.validate()?;
        Ok(match *self {
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
                weight_decay,
            } => Box::new(SgdOptimizer::new(learning_rate, momentum, weight_decay)),
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                weight_decay,
            } => Box::new(AdamOptimizer::new(learning_rate, weight_decay).with_betas(beta1, beta2)),
            OptimizerConfig::AdamW {
                learning_rate,
                beta1,
                beta2,
                weight_decay,
            } => Box::new(AdamOptimizer::adamw(learning_rate, weight_decay).with_betas(beta1, beta2)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn sgd_descends_gradient() {
        let mut optimizer = SgdOptimizer::new(0.1, 0.0, 0.0);
        let mut param = arr1(&[1.0f32, -1.0]).into_dyn();
        let grad = arr1(&[2.0f32, -4.0]).into_dyn();
        optimizer.step("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0]], 0.8);
        assert_abs_diff_eq!(param[[1]], -0.6);
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let mut optimizer = SgdOptimizer::new(0.1, 0.9, 0.0);
        let mut param = arr1(&[0.0f32]).into_dyn();
        let grad = arr1(&[1.0f32]).into_dyn();
        optimizer.step("w", param.view_mut(), grad.view());
        optimizer.step("w", param.view_mut(), grad.view());
        // 0.1 then 0.09 + 0.1
        assert_abs_diff_eq!(param[[0]], -0.29, epsilon = 1e-6);
    }

    #[test]
    fn adam_first_step_has_learning_rate_magnitude() {
        let mut optimizer = AdamOptimizer::new(0.01, 0.0);
        let mut param = arr1(&[0.5f32, 0.5]).into_dyn();
        let grad = arr1(&[3.0f32, -0.2]).into_dyn();
        optimizer.step("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0]], 0.49, epsilon = 1e-5);
        assert_abs_diff_eq!(param[[1]], 0.51, epsilon = 1e-5);
        assert_eq!(optimizer.steps_taken("w"), 1);
        assert_eq!(optimizer.steps_taken("other"), 0);
    }

    #[test]
    fn adamw_decays_parameters_without_gradient() {
        let mut optimizer = AdamOptimizer::adamw(0.1, 0.5);
        let mut param = arr1(&[2.0f32]).into_dyn();
        let grad = arr1(&[0.0f32]).into_dyn();
        optimizer.step("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0]], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn config_rejects_bad_learning_rate() {
        let config = OptimizerConfig::Sgd {
            learning_rate: 0.0,
            momentum: 0.0,
            weight_decay: 0.0,
        };
        assert!(config.build().is_err());
        assert!(OptimizerConfig::default().build().is_ok());
    }
}
