//! DnCNN-style residual denoiser with a frequency filter in front.
//!
//! ```text
//! x → pad → filter → conv → relu → (conv → relu) × (depth - 2) → conv → r
//! output = crop(pad(x) - r)
//! ```
//!
//! The residual is subtracted from the unfiltered input, so the filter only
//! shapes what the body sees.

use ndarray::{Array4, ArrayViewD, ArrayViewMutD};
use serde::{Deserialize, Serialize};

use super::padding::{crop_to, pad_to, pad_to_multiple, PadExtent};
use super::RestorationNetwork;
use crate::error::{GuardError, GuardResult};
use crate::filter::{FilterOutput, FilterStage, FilterStageTrace, FrequencyFilter};
use crate::nn::activation::{relu, relu_backward};
use crate::nn::{Conv2d, Gradients, Parameterized};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiserConfig {
    pub channels: usize,
    pub features: usize,
    /// Total convolution count, including the first and last layer.
    pub depth: usize,
    /// Inputs are zero-padded to a multiple of this before the forward pass.
    pub alignment: usize,
    pub seed: u64,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            features: 64,
            depth: 20,
            alignment: 1,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilteredDenoiser {
    filter: FilterStage,
    body: Vec<Conv2d>,
    alignment: usize,
}

#[derive(Debug, Clone)]
pub struct DenoiserTrace {
    extent: PadExtent,
    filter: FilterStageTrace,
    /// Input of every body convolution.
    inputs: Vec<Array4<f32>>,
    /// Output of every body convolution but the last, before ReLU.
    pre_activations: Vec<Array4<f32>>,
}

impl FilteredDenoiser {
    pub fn new(config: &DenoiserConfig, filter: FilterStage) -> GuardResult<Self> {
        if config.depth < 2 {
            return Err(GuardError::configuration("depth", "must be at least 2"));
        }
        if config.channels == 0 || config.features == 0 {
            return Err(GuardError::configuration(
                "denoiser",
                "channels and features must be > 0",
            ));
        }
        if config.alignment == 0 {
            return Err(GuardError::configuration("alignment", "must be > 0"));
        }

        let mut body = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            let in_channels = if i == 0 { config.channels } else { config.features };
            let out_channels = if i + 1 == config.depth {
                config.channels
            } else {
                config.features
            };
            let seed = config.seed.wrapping_add(i as u64 * 7919);
            body.push(Conv2d::new(format!("body.{i}"), in_channels, out_channels, 3, 1, 1, seed)?);
        }

        Ok(Self {
            filter,
            body,
            alignment: config.alignment,
        })
    }

    pub fn filter(&self) -> &FilterStage {
        &self.filter
    }

    /// Runs only the filter stage, for mask introspection.
    pub fn inspect_filter(&self, input: &Array4<f32>) -> GuardResult<FilterOutput> {
        let (padded, _) = pad_to_multiple(input, self.alignment)?;
        self.filter.filter(&padded)
    }
}

impl RestorationNetwork for FilteredDenoiser {
    type Trace = DenoiserTrace;

    fn forward_traced(&self, input: &Array4<f32>) -> GuardResult<(Array4<f32>, DenoiserTrace)> {
        let (padded, extent) = pad_to_multiple(input, self.alignment)?;
        let (filtered, filter_trace) = self.filter.filter_traced(&padded)?;

        let mut x = filtered.filtered;
        let mut inputs = Vec::with_capacity(self.body.len());
        let mut pre_activations = Vec::with_capacity(self.body.len() - 1);
        let last = self.body.len() - 1;
        for (i, conv) in self.body.iter().enumerate() {
            let out = conv.forward(&x)?;
            inputs.push(x);
            if i == last {
                x = out;
            } else {
                x = relu(&out);
                pre_activations.push(out);
            }
        }

        let output = crop_to(&(&padded - &x), &extent);
        let trace = DenoiserTrace {
            extent,
            filter: filter_trace,
            inputs,
            pre_activations,
        };
        Ok((output, trace))
    }

    fn backward(
        &self,
        trace: &DenoiserTrace,
        grad_output: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        let grad_padded = pad_to(grad_output, &trace.extent);

        let mut grad = -&grad_padded;
        let last = self.body.len() - 1;
        for (i, conv) in self.body.iter().enumerate().rev() {
            if i != last {
                grad = relu_backward(&trace.pre_activations[i], &grad);
            }
            grad = conv.backward(&trace.inputs[i], &grad, grads)?;
        }

        let grad_input = grad_padded + self.filter.backward(&trace.filter, &grad, grads)?;
        Ok(crop_to(&grad_input, &trace.extent))
    }
}

impl Parameterized for FilteredDenoiser {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.filter.visit_parameters(visitor);
        for conv in &self.body {
            conv.visit_parameters(visitor);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.filter.visit_parameters_mut(visitor);
        for conv in &mut self.body {
            conv.visit_parameters_mut(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FixedBandFilter;
    use crate::nn::is_filter_parameter;
    use approx::assert_abs_diff_eq;

    fn small_config(alignment: usize) -> DenoiserConfig {
        DenoiserConfig {
            channels: 3,
            features: 4,
            depth: 3,
            alignment,
            seed: 5,
        }
    }

    fn image(h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((2, 3, h, w), |(b, c, r, col)| {
            0.5 + 0.25 * (((b + 1) * (c + 1) * (r * 2 + col)) as f32 * 0.21).cos()
        })
    }

    #[test]
    fn output_matches_input_extent_after_padding() {
        let net = FilteredDenoiser::new(&small_config(8), FilterStage::Fixed(FixedBandFilter::default())).unwrap();
        let x = image(10, 13);
        let (y, _) = net.forward_traced(&x).unwrap();
        assert_eq!(y.dim(), x.dim());
    }

    #[test]
    fn depth_below_two_is_rejected() {
        let mut config = small_config(1);
        config.depth = 1;
        assert!(FilteredDenoiser::new(&config, FilterStage::Identity).is_err());
    }

    #[test]
    fn parameters_split_into_filter_and_body() {
        let net = FilteredDenoiser::new(&small_config(1), FilterStage::Fixed(FixedBandFilter::default())).unwrap();
        let snapshot = net.parameter_snapshot();
        let filter_count = snapshot.keys().filter(|k| is_filter_parameter(k)).count();
        assert_eq!(filter_count, 8);
        assert_eq!(snapshot.len(), 8 + 2 * 3);
        assert!(snapshot.contains_key("body.2.weight"));
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let net = FilteredDenoiser::new(&small_config(4), FilterStage::Fixed(FixedBandFilter::default())).unwrap();
        let x = image(6, 7);
        let direction = Array4::from_shape_fn(x.raw_dim(), |(_, c, r, col)| ((c + r + 2 * col) % 3) as f32 - 1.0);
        let objective = |x: &Array4<f32>| (&net.predict(x).unwrap() * &direction).sum();

        let (_, trace) = net.forward_traced(&x).unwrap();
        let mut grads = Gradients::new();
        let grad = net.backward(&trace, &direction, &mut grads).unwrap();
        assert_eq!(grad.dim(), x.dim());
        assert!(grads.get("filter.band0.value").is_some());
        assert!(grads.get("body.0.weight").is_some());

        let h = 1e-3;
        for idx in [[0, 0, 2, 3], [1, 2, 5, 6]] {
            let (mut plus, mut minus) = (x.clone(), x.clone());
            plus[idx] += h;
            minus[idx] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad[idx], numeric, epsilon = 2e-2);
        }
    }
}
