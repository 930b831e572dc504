//! Run configuration loaded from TOML.
//!
//! ```toml
//! [train]
//! total_iter = 200
//! alpha = 1.0
//!
//! [train.attack]
//! epsilon = 0.1
//!
//! [optim.backbone]
//! kind = "adam"
//! learning_rate = 1e-4
//!
//! [filter]
//! kind = "fixed"
//! ```
//!
//! Every key is optional. Values are range-checked when the file is loaded.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::attack::AttackConfig;
use crate::error::GuardError;
use crate::evaluation::{EvaluationConfig, EvaluationMode};
use crate::filter::FilterConfig;
use crate::network::DenoiserConfig;
use crate::noise::NoiseConfig;
use crate::nn::{LossKind, OptimizerConfig};
use crate::tiling::TilingConfig;
use crate::training::{DualObjectiveConfig, FilterSchedule};

/// Complete configuration of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub train: TrainConfig,
    pub optim: OptimConfig,
    pub network: DenoiserConfig,
    pub filter: FilterConfig,
    pub val: ValidationConfig,
}

impl RunConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawRunConfig =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let train = TrainConfig::try_from(&raw.train)?;
        let optim = OptimConfig::try_from(&raw.optim)?;
        let network = raw.network;
        if network.depth < 2 || network.channels == 0 || network.features == 0 || network.alignment == 0 {
            return Err(ConfigError::Parse(
                "network.depth must be ≥ 2 and channels, features, alignment non-zero".into(),
            ));
        }
        let val = ValidationConfig::try_from(&raw.val)?;

        Ok(Self {
            train,
            optim,
            network,
            filter: raw.filter,
            val,
        })
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            train: TrainConfig::default(),
            optim: OptimConfig::default(),
            network: DenoiserConfig::default(),
            filter: FilterConfig::default(),
            val: ValidationConfig::default(),
        }
    }
}

/// `[train]`: step schedule, batch geometry and the dual objective.
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub total_iter: u64,
    pub batch_size: usize,
    pub patch_size: usize,
    pub loss: LossKind,
    pub loss_weight: f32,
    pub objective: DualObjectiveConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_iter: default_total_iter(),
            batch_size: default_batch_size(),
            patch_size: default_patch_size(),
            loss: LossKind::Mse,
            loss_weight: 1.0,
            objective: DualObjectiveConfig::default(),
        }
    }
}

impl TrainConfig {
    fn try_from(raw: &RawTrain) -> Result<Self, ConfigError> {
        if raw.total_iter == 0 {
            return Err(ConfigError::Parse("train.total_iter must be ≥ 1".into()));
        }
        if raw.batch_size == 0 {
            return Err(ConfigError::Parse("train.batch_size must be ≥ 1".into()));
        }
        if raw.patch_size < 2 {
            return Err(ConfigError::Parse("train.patch_size must be ≥ 2".into()));
        }
        if !raw.loss_weight.is_finite() || raw.loss_weight <= 0.0 {
            return Err(ConfigError::Parse("train.loss_weight must be positive".into()));
        }

        let objective = DualObjectiveConfig {
            synthesize_noise: raw.synthesize_noise,
            noise: raw.noise,
            attack: raw.attack,
            alpha: raw.alpha,
            grad_clip: raw.use_grad_clip.then_some(raw.grad_clip),
            augment_bands: raw.augment_bands,
            filter_schedule: raw.filter_schedule,
            filtered_pass: raw.filtered_pass,
            seed: raw.seed,
        };
        objective.validate()?;

        Ok(Self {
            total_iter: raw.total_iter,
            batch_size: raw.batch_size,
            patch_size: raw.patch_size,
            loss: raw.loss,
            loss_weight: raw.loss_weight,
            objective,
        })
    }
}

/// `[optim]`: one optimizer per parameter group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimConfig {
    pub backbone: OptimizerConfig,
    pub filter: OptimizerConfig,
}

impl OptimConfig {
    fn try_from(raw: &RawOptim) -> Result<Self, ConfigError> {
        raw.backbone
            .validate()
            .map_err(|err| ConfigError::Parse(format!("optim.backbone: {err}")))?;
        raw.filter
            .validate()
            .map_err(|err| ConfigError::Parse(format!("optim.filter: {err}")))?;
        Ok(Self {
            backbone: raw.backbone,
            filter: raw.filter,
        })
    }
}

/// `[val]`: evaluation cadence and inference layout.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationConfig {
    /// Evaluate every this many steps, 0 only at the end.
    pub every: u64,
    pub modes: Vec<EvaluationMode>,
    pub evaluation: EvaluationConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            every: 0,
            modes: EvaluationMode::ALL.to_vec(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl ValidationConfig {
    fn try_from(raw: &RawVal) -> Result<Self, ConfigError> {
        if raw.max_minibatch == Some(0) {
            return Err(ConfigError::Parse("val.max_minibatch must be ≥ 1".into()));
        }
        if raw.modes.is_empty() {
            return Err(ConfigError::Parse("val.modes must not be empty".into()));
        }
        if let Some(tiling) = &raw.tiling {
            tiling.validate()?;
        }
        raw.attack.validate()?;

        Ok(Self {
            every: raw.every,
            modes: raw.modes.clone(),
            evaluation: EvaluationConfig {
                attack: raw.attack,
                max_minibatch: raw.max_minibatch,
                tiling: raw.tiling,
                seed: raw.seed,
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawRunConfig {
    #[serde(default)]
    train: RawTrain,
    #[serde(default)]
    optim: RawOptim,
    #[serde(default)]
    network: DenoiserConfig,
    #[serde(default)]
    filter: FilterConfig,
    #[serde(default)]
    val: RawVal,
}

#[derive(Debug, Deserialize)]
struct RawTrain {
    #[serde(default = "default_total_iter")]
    total_iter: u64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_patch_size")]
    patch_size: usize,
    #[serde(default = "default_loss")]
    loss: LossKind,
    #[serde(default = "default_one")]
    loss_weight: f32,
    #[serde(default = "default_one")]
    alpha: f32,
    #[serde(default = "default_true")]
    use_grad_clip: bool,
    #[serde(default = "default_grad_clip")]
    grad_clip: f32,
    #[serde(default = "default_true")]
    synthesize_noise: bool,
    #[serde(default = "default_augment_bands")]
    augment_bands: usize,
    #[serde(default)]
    filter_schedule: FilterSchedule,
    #[serde(default = "default_true")]
    filtered_pass: bool,
    #[serde(default)]
    seed: u64,
    #[serde(default)]
    noise: NoiseConfig,
    #[serde(default)]
    attack: AttackConfig,
}

impl Default for RawTrain {
    fn default() -> Self {
        Self {
            total_iter: default_total_iter(),
            batch_size: default_batch_size(),
            patch_size: default_patch_size(),
            loss: default_loss(),
            loss_weight: default_one(),
            alpha: default_one(),
            use_grad_clip: true,
            grad_clip: default_grad_clip(),
            synthesize_noise: true,
            augment_bands: default_augment_bands(),
            filter_schedule: FilterSchedule::default(),
            filtered_pass: true,
            seed: 0,
            noise: NoiseConfig::default(),
            attack: AttackConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawOptim {
    #[serde(default)]
    backbone: OptimizerConfig,
    #[serde(default)]
    filter: OptimizerConfig,
}

#[derive(Debug, Deserialize)]
struct RawVal {
    #[serde(default)]
    every: u64,
    #[serde(default = "default_modes")]
    modes: Vec<EvaluationMode>,
    #[serde(default)]
    max_minibatch: Option<usize>,
    #[serde(default)]
    tiling: Option<TilingConfig>,
    #[serde(default)]
    attack: AttackConfig,
    #[serde(default)]
    seed: u64,
}

impl Default for RawVal {
    fn default() -> Self {
        Self {
            every: 0,
            modes: default_modes(),
            max_minibatch: None,
            tiling: None,
            attack: AttackConfig::default(),
            seed: 0,
        }
    }
}

fn default_total_iter() -> u64 {
    200
}

fn default_batch_size() -> usize {
    4
}

fn default_patch_size() -> usize {
    32
}

fn default_loss() -> LossKind {
    LossKind::Mse
}

fn default_one() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_grad_clip() -> f32 {
    0.01
}

fn default_augment_bands() -> usize {
    crate::spectral::DENSE_BAND_COUNT
}

fn default_modes() -> Vec<EvaluationMode> {
    EvaluationMode::ALL.to_vec()
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<GuardError> for ConfigError {
    fn from(value: GuardError) -> Self {
        ConfigError::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::StepDistribution;
    use crate::noise::NoiseKind;
    use crate::tiling::CropExtent;

    #[test]
    fn empty_file_yields_defaults() {
        let config = RunConfig::from_str("").unwrap();
        assert_eq!(config.train.total_iter, 200);
        assert_eq!(config.train.objective, DualObjectiveConfig::default());
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.val.modes, EvaluationMode::ALL.to_vec());
    }

    #[test]
    fn nested_sections_parse() {
        let toml = r#"
[train]
alpha = 0.5
use_grad_clip = false
filter_schedule = "frozen"

[train.noise]
kind = "poisson"

[train.attack]
epsilon = 0.05
iterations = 3
step = { kind = "half_normal", scale = 0.2 }

[optim.filter]
kind = "sgd"
learning_rate = 0.01

[filter]
kind = "regression"
bands = 20

[val]
modes = ["real", "unseen_noise"]
tiling = { crop_h = { pixels = 16 }, crop_w = { ratio = 0.5 }, max_minibatch = 2 }
"#;
        let config = RunConfig::from_str(toml).unwrap();
        let objective = &config.train.objective;
        assert_eq!(objective.alpha, 0.5);
        assert_eq!(objective.grad_clip, None);
        assert_eq!(objective.filter_schedule, FilterSchedule::Frozen);
        assert_eq!(objective.noise.kind, NoiseKind::Poisson);
        assert_eq!(objective.attack.iterations, 3);
        assert_eq!(objective.attack.step, StepDistribution::HalfNormal { scale: 0.2 });
        assert!((config.optim.filter.learning_rate() - 0.01).abs() < 1e-9);
        assert!(matches!(config.filter, FilterConfig::Regression { bands: 20, .. }));
        assert_eq!(config.val.modes, vec![EvaluationMode::Real, EvaluationMode::UnseenNoise]);
        let tiling = config.val.evaluation.tiling.unwrap();
        assert_eq!(tiling.crop_h, CropExtent::Pixels(16));
        assert_eq!(tiling.crop_w, CropExtent::Ratio(0.5));
        assert_eq!(tiling.scale, 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RunConfig::from_str("[train]\nalpha = -1.0").is_err());
        assert!(RunConfig::from_str("[train]\nbatch_size = 0").is_err());
        assert!(RunConfig::from_str("[optim.backbone]\nkind = \"adam\"\nlearning_rate = 0.0").is_err());
        assert!(RunConfig::from_str("[network]\ndepth = 1").is_err());
        assert!(RunConfig::from_str("[val]\nmodes = []").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RunConfig::load_from_file("/nonexistent/spectral_guard.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
