//! Frequency filters placed in front of the restoration backbone.
//!
//! A filter maps an image to a band-masked copy of itself and reports the
//! mask and the per-band gate values it used. Trainable filters name their
//! parameters under the `filter` prefix so they land in the filter group.

pub mod adaptive;
pub mod fixed;
pub mod random;

use ndarray::{Array2, Array4, ArrayViewD, ArrayViewMutD};
use serde::{Deserialize, Serialize};

use crate::error::GuardResult;
use crate::nn::{Gradients, Parameterized};
use crate::spectral::{BandEdge, FrequencyMask, MaskMode};

pub use adaptive::{
    AdaptiveBandFilter, AdaptiveFilterNetwork, AdaptiveNetworkConfig, AdaptiveTrace, Downsample,
    GatePolicy,
};
pub use fixed::{FixedBandFilter, FixedTrace};
pub use random::RandomBandFilter;

/// Prefix of every filter parameter name.
pub const FILTER_PREFIX: &str = "filter";

/// Result of one filter call.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub filtered: Array4<f32>,
    pub mask: FrequencyMask,
    /// `(rows, bands)` gate values, one row per mask row.
    pub gates: Array2<f32>,
}

/// A differentiable frequency filter.
pub trait FrequencyFilter: Parameterized {
    type Trace;

    fn filter_traced(&self, image: &Array4<f32>) -> GuardResult<(FilterOutput, Self::Trace)>;

    /// Accumulates parameter gradients and returns the gradient w.r.t. the
    /// filter input.
    fn backward(
        &self,
        trace: &Self::Trace,
        grad_filtered: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>>;

    fn band_count(&self) -> usize;

    fn filter(&self, image: &Array4<f32>) -> GuardResult<FilterOutput> {
        Ok(self.filter_traced(image)?.0)
    }
}

/// The filter slot of a backbone: nothing, a fixed band filter, or a
/// content-adaptive one.
#[derive(Debug, Clone)]
pub enum FilterStage {
    Identity,
    Fixed(FixedBandFilter),
    Adaptive(AdaptiveBandFilter),
}

#[derive(Debug, Clone)]
pub enum FilterStageTrace {
    Identity,
    Fixed(FixedTrace),
    Adaptive(AdaptiveTrace),
}

impl FrequencyFilter for FilterStage {
    type Trace = FilterStageTrace;

    fn filter_traced(&self, image: &Array4<f32>) -> GuardResult<(FilterOutput, FilterStageTrace)> {
        match self {
            FilterStage::Identity => {
                let (batch, _, height, width) = image.dim();
                let output = FilterOutput {
                    filtered: image.clone(),
                    mask: FrequencyMask::ones(MaskMode::Shared, batch, height, width),
                    gates: Array2::zeros((1, 0)),
                };
                Ok((output, FilterStageTrace::Identity))
            }
            FilterStage::Fixed(filter) => {
                let (output, trace) = filter.filter_traced(image)?;
                Ok((output, FilterStageTrace::Fixed(trace)))
            }
            FilterStage::Adaptive(filter) => {
                let (output, trace) = filter.filter_traced(image)?;
                Ok((output, FilterStageTrace::Adaptive(trace)))
            }
        }
    }

    fn backward(
        &self,
        trace: &FilterStageTrace,
        grad_filtered: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        match (self, trace) {
            (FilterStage::Fixed(filter), FilterStageTrace::Fixed(t)) => {
                filter.backward(t, grad_filtered, grads)
            }
            (FilterStage::Adaptive(filter), FilterStageTrace::Adaptive(t)) => {
                filter.backward(t, grad_filtered, grads)
            }
            _ => Ok(grad_filtered.clone()),
        }
    }

    fn band_count(&self) -> usize {
        match self {
            FilterStage::Identity => 0,
            FilterStage::Fixed(filter) => filter.band_count(),
            FilterStage::Adaptive(filter) => filter.band_count(),
        }
    }
}

impl Parameterized for FilterStage {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        match self {
            FilterStage::Identity => {}
            FilterStage::Fixed(filter) => filter.visit_parameters(visitor),
            FilterStage::Adaptive(filter) => filter.visit_parameters(visitor),
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        match self {
            FilterStage::Identity => {}
            FilterStage::Fixed(filter) => filter.visit_parameters_mut(visitor),
            FilterStage::Adaptive(filter) => filter.visit_parameters_mut(visitor),
        }
    }
}

fn default_regression_bands() -> usize {
    crate::spectral::mask::DENSE_BAND_COUNT
}

fn default_fractions() -> Vec<f32> {
    crate::spectral::mask::COARSE_BAND_FRACTIONS.to_vec()
}

fn default_fixed_values() -> Vec<f32> {
    fixed::DEFAULT_BAND_VALUES.to_vec()
}

fn default_hidden() -> usize {
    256
}

fn default_outputs() -> usize {
    5
}

fn default_temperature() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_regression_widths() -> Vec<usize> {
    vec![16, 32, 64]
}

fn default_classification_widths() -> Vec<usize> {
    vec![16, 32]
}

fn default_per_sample() -> MaskMode {
    MaskMode::PerSample
}

fn default_shared() -> MaskMode {
    MaskMode::Shared
}

fn default_logistic() -> BandEdge {
    BandEdge::Logistic
}

/// Filter selection as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    Identity,
    Fixed {
        #[serde(default = "default_fractions")]
        fractions: Vec<f32>,
        #[serde(default = "default_fixed_values")]
        values: Vec<f32>,
    },
    Regression {
        #[serde(default = "default_regression_bands")]
        bands: usize,
        #[serde(default = "default_logistic")]
        edge: BandEdge,
        #[serde(default = "default_per_sample")]
        mask_mode: MaskMode,
        #[serde(default = "default_true")]
        include_image: bool,
        #[serde(default = "default_regression_widths")]
        widths: Vec<usize>,
        #[serde(default = "default_hidden")]
        hidden: usize,
        #[serde(default)]
        seed: u64,
    },
    Classification {
        #[serde(default = "default_fractions")]
        fractions: Vec<f32>,
        #[serde(default = "default_outputs")]
        outputs: usize,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_shared")]
        mask_mode: MaskMode,
        #[serde(default = "default_classification_widths")]
        widths: Vec<usize>,
        #[serde(default = "default_hidden")]
        hidden: usize,
        #[serde(default)]
        seed: u64,
    },
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig::Fixed {
            fractions: default_fractions(),
            values: default_fixed_values(),
        }
    }
}

impl FilterConfig {
    /// Builds the filter for images with `channels` channels.
    pub fn build(&self, channels: usize) -> GuardResult<FilterStage> {
        use crate::spectral::BandSpec;

        Ok(match self {
            FilterConfig::Identity => FilterStage::Identity,
            FilterConfig::Fixed { fractions, values } => {
                FilterStage::Fixed(FixedBandFilter::new(fractions.clone(), values.clone())?)
            }
            FilterConfig::Regression {
                bands,
                edge,
                mask_mode,
                include_image,
                widths,
                hidden,
                seed,
            } => {
                let spec = BandSpec::uniform(*bands)?;
                let network = AdaptiveFilterNetwork::new(
                    format!("{FILTER_PREFIX}.net"),
                    AdaptiveNetworkConfig {
                        image_channels: channels,
                        include_image: *include_image,
                        widths: widths.clone(),
                        downsample: Downsample::AvgPool,
                        hidden: *hidden,
                        gates: *bands,
                        seed: *seed,
                    },
                )?;
                FilterStage::Adaptive(AdaptiveBandFilter::regression(network, spec, *edge, *mask_mode)?)
            }
            FilterConfig::Classification {
                fractions,
                outputs,
                temperature,
                mask_mode,
                widths,
                hidden,
                seed,
            } => {
                let spec = BandSpec::new(fractions.clone())?;
                let network = AdaptiveFilterNetwork::new(
                    format!("{FILTER_PREFIX}.net"),
                    AdaptiveNetworkConfig {
                        image_channels: channels,
                        include_image: false,
                        widths: widths.clone(),
                        downsample: Downsample::StridedConv,
                        hidden: *hidden,
                        gates: *outputs,
                        seed: *seed,
                    },
                )?;
                FilterStage::Adaptive(AdaptiveBandFilter::classification(
                    network,
                    spec,
                    *temperature,
                    *mask_mode,
                )?)
            }
        })
    }
}
