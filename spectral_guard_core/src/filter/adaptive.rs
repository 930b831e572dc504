//! Content-adaptive band filter.
//!
//! A small convolutional network looks at the log-magnitude spectrum (and
//! optionally the image itself) and emits one raw value per gate. A
//! [`GatePolicy`] turns the raw values into band weights:
//!
//! * `Regression`: LeakyReLU, one gate per band. Gates may go negative or
//!   above one.
//! * `Classification`: sigmoid, temperature-scaled softmax over every
//!   output, then the leading `active_bands` probabilities are kept.
//!
//! With [`MaskMode::Shared`] the gates are averaged over the batch so one
//! mask serves every sample.

use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rustfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};

use super::{FilterOutput, FrequencyFilter};
use crate::error::{GuardError, GuardResult};
use crate::nn::activation::{
    leaky_relu, leaky_relu_backward, relu, relu_backward, sigmoid, sigmoid_backward,
    LEAKY_RELU_SLOPE,
};
use crate::nn::{
    global_average_pool, global_average_pool_backward, AvgPool2d, Conv2d, Gradients, Linear,
    Parameterized,
};
use crate::spectral::{
    band_indicators, combine, combine_backward, filter_backward, filter_spectrum_traced, forward,
    log_magnitude, log_magnitude_backward, radial_field, BandEdge, BandProfile, BandSpec,
    FilterTrace, FrequencyMask, MaskMode, Reconstruction,
};

// ============================================================================
// Gate network
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsample {
    /// 2×2 average pooling.
    AvgPool,
    /// 2×2 convolution with stride 2.
    StridedConv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveNetworkConfig {
    /// Channels of the filtered image.
    pub image_channels: usize,
    /// Feed the raw image next to its log-magnitude spectrum.
    pub include_image: bool,
    /// Output channels of each `conv → relu → downsample` stage.
    pub widths: Vec<usize>,
    pub downsample: Downsample,
    pub hidden: usize,
    /// Number of raw outputs.
    pub gates: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct Stage {
    conv: Conv2d,
    down: Option<Conv2d>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveFilterNetwork {
    image_channels: usize,
    include_image: bool,
    stages: Vec<Stage>,
    pool: AvgPool2d,
    fc1: Linear,
    fc2: Linear,
}

#[derive(Debug, Clone)]
struct StageTrace {
    input: Array4<f32>,
    pre_activation: Array4<f32>,
    activation: Array4<f32>,
}

/// Activations kept for [`AdaptiveFilterNetwork::backward`].
#[derive(Debug, Clone)]
pub struct NetworkTrace {
    stages: Vec<StageTrace>,
    last_dim: (usize, usize, usize, usize),
    pooled: Array2<f32>,
    hidden: Array2<f32>,
}

impl AdaptiveFilterNetwork {
    pub fn new(name: impl Into<String>, config: AdaptiveNetworkConfig) -> GuardResult<Self> {
        let name = name.into();
        if config.gates == 0 {
            return Err(GuardError::configuration("gates", "must be > 0"));
        }
        if config.widths.is_empty() {
            return Err(GuardError::configuration("widths", "at least one stage is required"));
        }
        if config.image_channels == 0 || config.hidden == 0 {
            return Err(GuardError::configuration(
                "adaptive network",
                "image channels and hidden width must be > 0",
            ));
        }

        let mut in_channels = config.image_channels * if config.include_image { 2 } else { 1 };
        let mut seed = config.seed;
        let mut stages = Vec::with_capacity(config.widths.len());
        for (i, &width) in config.widths.iter().enumerate() {
            let conv = Conv2d::new(format!("{name}.stage{i}.conv"), in_channels, width, 3, 1, 1, seed)?;
            seed = seed.wrapping_add(1);
            let down = match config.downsample {
                Downsample::AvgPool => None,
                Downsample::StridedConv => {
                    let down = Conv2d::new(format!("{name}.stage{i}.down"), width, width, 2, 2, 0, seed)?;
                    seed = seed.wrapping_add(1);
                    Some(down)
                }
            };
            stages.push(Stage { conv, down });
            in_channels = width;
        }

        let fc1 = Linear::new(format!("{name}.fc1"), in_channels, config.hidden, seed)?;
        let fc2 = Linear::new(format!("{name}.fc2"), config.hidden, config.gates, seed.wrapping_add(1))?;

        Ok(Self {
            image_channels: config.image_channels,
            include_image: config.include_image,
            stages,
            pool: AvgPool2d::new(2)?,
            fc1,
            fc2,
        })
    }

    pub fn gates(&self) -> usize {
        self.fc2.out_features()
    }

    pub fn includes_image(&self) -> bool {
        self.include_image
    }

    /// Smallest spatial extent the stages can reduce without vanishing.
    pub fn min_extent(&self) -> usize {
        1 << self.stages.len()
    }

    /// Network input: `[image, log10(|X| + 1)]` or just the log-magnitude.
    pub fn features(&self, image: &Array4<f32>, spectrum: &Array4<Complex32>) -> GuardResult<Array4<f32>> {
        let channels = image.len_of(Axis(1));
        if channels != self.image_channels {
            return Err(GuardError::shape("adaptive filter channels", self.image_channels, channels));
        }
        let log_mag = log_magnitude(spectrum);
        if !self.include_image {
            return Ok(log_mag);
        }
        concatenate(Axis(1), &[image.view(), log_mag.view()])
            .map_err(|e| GuardError::shape("adaptive features", image.dim(), e.to_string()))
    }

    pub fn forward_traced(&self, features: &Array4<f32>) -> GuardResult<(Array2<f32>, NetworkTrace)> {
        let (_, _, height, width) = features.dim();
        let min = self.min_extent();
        if height < min || width < min {
            return Err(GuardError::shape(
                "adaptive filter input",
                format!("at least {min}x{min}"),
                (height, width),
            ));
        }

        let mut x = features.clone();
        let mut traces = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let pre_activation = stage.conv.forward(&x)?;
            let activation = relu(&pre_activation);
            let next = match &stage.down {
                Some(down) => down.forward(&activation)?,
                None => self.pool.forward(&activation)?,
            };
            traces.push(StageTrace {
                input: x,
                pre_activation,
                activation,
            });
            x = next;
        }

        let pooled = global_average_pool(&x);
        let hidden = self.fc1.forward(&pooled)?;
        let raw = self.fc2.forward(&hidden)?;
        let trace = NetworkTrace {
            stages: traces,
            last_dim: x.dim(),
            pooled,
            hidden,
        };
        Ok((raw, trace))
    }

    /// Returns the gradient w.r.t. the network input features.
    pub fn backward(
        &self,
        trace: &NetworkTrace,
        grad_raw: &Array2<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        let grad_hidden = self.fc2.backward(&trace.hidden, grad_raw, grads)?;
        let grad_pooled = self.fc1.backward(&trace.pooled, &grad_hidden, grads)?;
        let mut grad = global_average_pool_backward(trace.last_dim, &grad_pooled);

        for (stage, st) in self.stages.iter().zip(trace.stages.iter()).rev() {
            grad = match &stage.down {
                Some(down) => down.backward(&st.activation, &grad, grads)?,
                None => self.pool.backward(st.activation.dim(), &grad),
            };
            grad = relu_backward(&st.pre_activation, &grad);
            grad = stage.conv.backward(&st.input, &grad, grads)?;
        }
        Ok(grad)
    }
}

impl Parameterized for AdaptiveFilterNetwork {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for stage in &self.stages {
            stage.conv.visit_parameters(visitor);
            if let Some(down) = &stage.down {
                down.visit_parameters(visitor);
            }
        }
        self.fc1.visit_parameters(visitor);
        self.fc2.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for stage in &mut self.stages {
            stage.conv.visit_parameters_mut(visitor);
            if let Some(down) = &mut stage.down {
                down.visit_parameters_mut(visitor);
            }
        }
        self.fc1.visit_parameters_mut(visitor);
        self.fc2.visit_parameters_mut(visitor);
    }
}

// ============================================================================
// Band filter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatePolicy {
    Regression { slope: f32 },
    Classification { temperature: f32, active_bands: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBandFilter {
    network: AdaptiveFilterNetwork,
    spec: BandSpec,
    policy: GatePolicy,
    edge: BandEdge,
    profile: BandProfile,
    mask_mode: MaskMode,
    reconstruction: Reconstruction,
}

#[derive(Debug, Clone)]
pub struct AdaptiveTrace {
    network: NetworkTrace,
    raw: Array2<f32>,
    /// Full softmax output for classification gates.
    probabilities: Option<Array2<f32>>,
    indicators: Array3<f32>,
    mask: FrequencyMask,
    spectral: FilterTrace,
}

impl AdaptiveBandFilter {
    /// Regression gates: one LeakyReLU output per band of `spec`.
    pub fn regression(
        network: AdaptiveFilterNetwork,
        spec: BandSpec,
        edge: BandEdge,
        mask_mode: MaskMode,
    ) -> GuardResult<Self> {
        if network.gates() != spec.len() {
            return Err(GuardError::configuration(
                "gates",
                format!("network emits {} gates for {} bands", network.gates(), spec.len()),
            ));
        }
        Ok(Self {
            network,
            spec,
            policy: GatePolicy::Regression {
                slope: LEAKY_RELU_SLOPE,
            },
            edge,
            profile: BandProfile::Annular,
            mask_mode,
            reconstruction: Reconstruction::ClampedRealPart,
        })
    }

    /// Classification gates: softmax over every output, leading
    /// `spec.len()` probabilities used as nested band weights.
    pub fn classification(
        network: AdaptiveFilterNetwork,
        spec: BandSpec,
        temperature: f32,
        mask_mode: MaskMode,
    ) -> GuardResult<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(GuardError::configuration("temperature", "must be positive"));
        }
        if network.gates() < spec.len() {
            return Err(GuardError::configuration(
                "gates",
                format!(
                    "network emits {} outputs but {} bands are active",
                    network.gates(),
                    spec.len()
                ),
            ));
        }
        let active_bands = spec.len();
        Ok(Self {
            network,
            spec,
            policy: GatePolicy::Classification {
                temperature,
                active_bands,
            },
            edge: BandEdge::Logistic,
            profile: BandProfile::Nested,
            mask_mode,
            reconstruction: Reconstruction::Magnitude,
        })
    }

    pub fn with_reconstruction(mut self, reconstruction: Reconstruction) -> Self {
        self.reconstruction = reconstruction;
        self
    }

    pub fn with_profile(mut self, profile: BandProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    pub fn mask_mode(&self) -> MaskMode {
        self.mask_mode
    }

    pub fn spec(&self) -> &BandSpec {
        &self.spec
    }

    pub fn network(&self) -> &AdaptiveFilterNetwork {
        &self.network
    }

    fn pool_rows(&self, values: Array2<f32>) -> Array2<f32> {
        match self.mask_mode {
            MaskMode::PerSample => values,
            MaskMode::Shared => {
                let cols = values.ncols();
                values
                    .mean_axis(Axis(0))
                    .map(|m| m.insert_axis(Axis(0)))
                    .unwrap_or_else(|| Array2::zeros((1, cols)))
            }
        }
    }

    fn unpool_rows(&self, grad: Array2<f32>, batch: usize) -> Array2<f32> {
        match self.mask_mode {
            MaskMode::PerSample => grad,
            MaskMode::Shared => {
                let scaled = grad / batch.max(1) as f32;
                let row = scaled.row(0).to_owned();
                Array2::from_shape_fn((batch, row.len()), |(_, k)| row[k])
            }
        }
    }

    /// Raw network outputs to gate weights. Also returns the softmax output
    /// for classification.
    fn gates_forward(&self, raw: &Array2<f32>) -> (Array2<f32>, Option<Array2<f32>>) {
        match self.policy {
            GatePolicy::Regression { slope } => (self.pool_rows(leaky_relu(raw, slope)), None),
            GatePolicy::Classification {
                temperature,
                active_bands,
            } => {
                let pooled = self.pool_rows(sigmoid(raw));
                let mut probs = pooled / temperature;
                for mut row in probs.rows_mut() {
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
                let gates = probs.slice(s![.., ..active_bands]).to_owned();
                (gates, Some(probs))
            }
        }
    }

    fn gates_backward(
        &self,
        raw: &Array2<f32>,
        probabilities: Option<&Array2<f32>>,
        grad_gates: &Array2<f32>,
    ) -> GuardResult<Array2<f32>> {
        let batch = raw.nrows();
        match self.policy {
            GatePolicy::Regression { slope } => {
                let grad_act = self.unpool_rows(grad_gates.clone(), batch);
                Ok(leaky_relu_backward(raw, &grad_act, slope))
            }
            GatePolicy::Classification {
                temperature,
                active_bands,
            } => {
                let probs = probabilities.ok_or_else(|| {
                    GuardError::shape("classification trace", "softmax output", "none")
                })?;
                let mut grad_probs = Array2::<f32>::zeros(probs.raw_dim());
                grad_probs
                    .slice_mut(s![.., ..active_bands])
                    .assign(grad_gates);
                let mut grad_logits = Array2::<f32>::zeros(probs.raw_dim());
                for ((mut gl, gp), p) in grad_logits
                    .rows_mut()
                    .into_iter()
                    .zip(grad_probs.rows())
                    .zip(probs.rows())
                {
                    let dot = (&gp * &p).sum();
                    gl.assign(&(&p * &(&gp - dot)));
                }
                let grad_pooled = grad_logits / temperature;
                let grad_sig = self.unpool_rows(grad_pooled, batch);
                Ok(sigmoid_backward(raw, &grad_sig))
            }
        }
    }
}

impl FrequencyFilter for AdaptiveBandFilter {
    type Trace = AdaptiveTrace;

    fn filter_traced(&self, image: &Array4<f32>) -> GuardResult<(FilterOutput, AdaptiveTrace)> {
        let (_, _, height, width) = image.dim();
        let spectrum = forward(image);
        let features = self.network.features(image, &spectrum)?;
        let (raw, network) = self.network.forward_traced(&features)?;
        let (gates, probabilities) = self.gates_forward(&raw);

        let field = radial_field(height, width);
        let radii = self.spec.radii(&field);
        let indicators = band_indicators(&field, &radii, self.edge, self.profile);
        let mask = combine(&indicators, &gates, self.mask_mode)?;
        let (filtered, spectral) = filter_spectrum_traced(spectrum, &mask, self.reconstruction)?;

        let output = FilterOutput {
            filtered,
            mask: mask.clone(),
            gates,
        };
        let trace = AdaptiveTrace {
            network,
            raw,
            probabilities,
            indicators,
            mask,
            spectral,
        };
        Ok((output, trace))
    }

    fn backward(
        &self,
        trace: &AdaptiveTrace,
        grad_filtered: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        let (mut grad_input, grad_mask) =
            filter_backward(&trace.spectral, &trace.mask, self.reconstruction, grad_filtered)?;
        let grad_gates = combine_backward(&trace.indicators, &grad_mask)?;
        let grad_raw = self.gates_backward(&trace.raw, trace.probabilities.as_ref(), &grad_gates)?;
        let grad_features = self.network.backward(&trace.network, &grad_raw, grads)?;

        let channels = grad_input.len_of(Axis(1));
        let grad_log_mag = if self.network.includes_image() {
            grad_input += &grad_features.slice(s![.., ..channels, .., ..]);
            grad_features.slice(s![.., channels.., .., ..]).to_owned()
        } else {
            grad_features
        };
        grad_input += &log_magnitude_backward(trace.spectral.spectrum(), &grad_log_mag)?;
        Ok(grad_input)
    }

    fn band_count(&self) -> usize {
        self.spec.len()
    }
}

impl Parameterized for AdaptiveBandFilter {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.network.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.network.visit_parameters_mut(visitor);
    }
}
