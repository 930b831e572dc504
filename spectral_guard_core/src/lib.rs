//! # Spectral Guard Core
//!
//! Frequency-band filtering and adversarial dual-objective training for
//! image restoration networks. Images are `(batch, channel, height, width)`
//! tensors in `[0, 1]`. Filters move them into the centred frequency domain,
//! weight radial bands, and bring them back.
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::Array4;
//! use spectral_guard_core::{FixedBandFilter, FrequencyFilter};
//!
//! let image = Array4::from_elem((1, 3, 64, 64), 0.5f32);
//! let output = FixedBandFilter::default().filter(&image).unwrap();
//!
//! // A flat image only has a DC component, which sits in the first band.
//! assert!((output.filtered[[0, 0, 10, 10]] - 0.5).abs() < 1e-4);
//! ```
//!
//! ## Core Modules
//!
//! - [`spectral`] - Radial geometry, FFT, band masks, mask-and-invert
//! - [`filter`] - Fixed, content-adaptive and random band filters
//! - [`network`] - Backbone contract and a filtered residual denoiser
//! - [`attack`] - Projected sign-gradient perturbations
//! - [`training`] - Dual-objective trainer with gradient reversal
//! - [`tiling`] - Overlapping-crop inference
//! - [`config`] - Run configuration via TOML

pub mod attack;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod filter;
pub mod network;
pub mod nn;
pub mod noise;
pub mod spectral;
pub mod tiling;
pub mod training;

pub use attack::{AttackConfig, AttackPhase, PerturbationGenerator, StepDistribution};
pub use config::{ConfigError, OptimConfig, RunConfig, TrainConfig, ValidationConfig};
pub use error::{GuardError, GuardResult};
pub use evaluation::{psnr, Evaluation, EvaluationConfig, EvaluationMode, Evaluator};
pub use filter::{
    AdaptiveBandFilter, AdaptiveFilterNetwork, FilterConfig, FilterOutput, FilterStage,
    FixedBandFilter, FrequencyFilter, RandomBandFilter,
};
pub use network::{DenoiserConfig, FilteredDenoiser, RestorationNetwork};
pub use nn::{
    Gradients, GroupRole, LossKind, Optimizer, OptimizerConfig, ParameterGroup, Parameterized,
    PixelLoss,
};
pub use noise::{NoiseConfig, NoiseGenerator, NoiseKind};
pub use spectral::{BandSpec, FrequencyMask, MaskMode, Reconstruction};
pub use tiling::{CropExtent, Tile, TilePlan, TiledInference, TilingConfig};
pub use training::{
    DualObjectiveConfig, DualObjectiveTrainer, FilterSchedule, ImagePair, StepReport,
    TrainingPhase,
};
