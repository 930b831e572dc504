//! 2-D convolution with explicit forward/backward.
//!
//! Implemented as im2col followed by a matrix product, one sample per rayon
//! task. The layer does not cache activations; callers keep the input and
//! hand it back to [`Conv2d::backward`].

use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use super::params::{Gradients, Parameterized};
use crate::error::{GuardError, GuardResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2d {
    name: String,
    /// `(out_channels, in_channels, kernel, kernel)`.
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Creates a convolution with Kaiming-normal weights and zero bias.
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter prefix (`{name}.weight`, `{name}.bias`)
    /// * `in_channels`, `out_channels` - Channel counts
    /// * `kernel` - Square kernel size
    /// * `stride`, `padding` - Spatial stride and zero padding
    /// * `seed` - Seed for weight initialization
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        seed: u64,
    ) -> GuardResult<Self> {
        let name = name.into();
        if in_channels == 0 || out_channels == 0 || kernel == 0 || stride == 0 {
            return Err(GuardError::configuration(
                name,
                "channels, kernel and stride must be > 0",
            ));
        }
        let fan_in = (in_channels * kernel * kernel) as f32;
        let std = (2.0 / fan_in).sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|e| GuardError::configuration(name.clone(), e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = Array4::from_shape_simple_fn((out_channels, in_channels, kernel, kernel), || {
            normal.sample(&mut rng)
        });

        Ok(Self {
            name,
            weight,
            bias: Array1::zeros(out_channels),
            kernel,
            stride,
            padding,
        })
    }

    /// Scales the initial weights, e.g. to start a residual branch near zero.
    pub fn with_weight_scale(mut self, scale: f32) -> Self {
        self.weight.mapv_inplace(|w| w * scale);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_channels(&self) -> usize {
        self.weight.len_of(Axis(1))
    }

    pub fn out_channels(&self) -> usize {
        self.weight.len_of(Axis(0))
    }

    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let span_h = height + 2 * self.padding;
        let span_w = width + 2 * self.padding;
        if span_h < self.kernel || span_w < self.kernel {
            return None;
        }
        Some((
            (span_h - self.kernel) / self.stride + 1,
            (span_w - self.kernel) / self.stride + 1,
        ))
    }

    fn check_input(&self, input: &Array4<f32>) -> GuardResult<(usize, usize)> {
        let (_, channels, height, width) = input.dim();
        if channels != self.in_channels() {
            return Err(GuardError::shape(
                format!("{} input channels", self.name),
                self.in_channels(),
                channels,
            ));
        }
        self.output_size(height, width).ok_or_else(|| {
            GuardError::shape(
                format!("{} input extent", self.name),
                format!("at least {0}x{0} after padding", self.kernel),
                (height, width),
            )
        })
    }

    fn weight_matrix(&self) -> GuardResult<Array2<f32>> {
        let rows = self.out_channels();
        let cols = self.in_channels() * self.kernel * self.kernel;
        self.weight
            .to_owned()
            .into_shape((rows, cols))
            .map_err(|e| GuardError::shape(format!("{} weight", self.name), (rows, cols), e.to_string()))
    }

    /// Forward pass.
    pub fn forward(&self, input: &Array4<f32>) -> GuardResult<Array4<f32>> {
        let (out_h, out_w) = self.check_input(input)?;
        let batch = input.len_of(Axis(0));
        let weights = self.weight_matrix()?;

        let samples: Vec<Array2<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let cols = self.im2col(input, b, out_h, out_w);
                let mut out = weights.dot(&cols);
                for (mut row, &bias) in out.axis_iter_mut(Axis(0)).zip(self.bias.iter()) {
                    row += bias;
                }
                out
            })
            .collect();

        let mut output = Array4::<f32>::zeros((batch, self.out_channels(), out_h, out_w));
        for (b, sample) in samples.into_iter().enumerate() {
            for (o, row) in sample.axis_iter(Axis(0)).enumerate() {
                for (idx, &v) in row.iter().enumerate() {
                    output[[b, o, idx / out_w, idx % out_w]] = v;
                }
            }
        }
        Ok(output)
    }

    /// Backward pass. Accumulates `{name}.weight` / `{name}.bias` into
    /// `grads` and returns the gradient w.r.t. `input`.
    pub fn backward(
        &self,
        input: &Array4<f32>,
        grad_output: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        let (out_h, out_w) = self.check_input(input)?;
        let batch = input.len_of(Axis(0));
        let expected = (batch, self.out_channels(), out_h, out_w);
        if grad_output.dim() != expected {
            return Err(GuardError::shape(
                format!("{} output gradient", self.name),
                expected,
                grad_output.dim(),
            ));
        }
        let weights = self.weight_matrix()?;
        let out_channels = self.out_channels();

        let per_sample: Vec<(Array2<f32>, Array4<f32>)> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let cols = self.im2col(input, b, out_h, out_w);
                let g = Array2::from_shape_vec(
                    (out_channels, out_h * out_w),
                    grad_output.index_axis(Axis(0), b).iter().copied().collect(),
                )
                .map_err(|e| GuardError::shape(format!("{} output gradient", self.name), expected, e.to_string()))?;
                let grad_w = g.dot(&cols.t());
                let grad_cols = weights.t().dot(&g);
                Ok((grad_w, self.col2im(&grad_cols, input.dim(), out_h, out_w)))
            })
            .collect::<GuardResult<_>>()?;

        let mut grad_weight = Array2::<f32>::zeros(weights.raw_dim());
        let mut grad_input = Array4::<f32>::zeros(input.raw_dim());
        for (b, (gw, gi)) in per_sample.into_iter().enumerate() {
            grad_weight += &gw;
            grad_input
                .index_axis_mut(Axis(0), b)
                .assign(&gi.index_axis(Axis(0), 0));
        }
        let grad_bias = grad_output.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0));

        let grad_weight = grad_weight
            .into_shape(self.weight.raw_dim())
            .map_err(|e| GuardError::shape(format!("{} weight gradient", self.name), self.weight.dim(), e.to_string()))?;
        grads.accumulate(&format!("{}.weight", self.name), grad_weight.into_dyn())?;
        grads.accumulate(&format!("{}.bias", self.name), grad_bias.into_dyn())?;
        Ok(grad_input)
    }

    /// Unfolds one sample into a `(C·k·k, out_h·out_w)` matrix.
    fn im2col(&self, input: &Array4<f32>, sample: usize, out_h: usize, out_w: usize) -> Array2<f32> {
        let (_, channels, height, width) = input.dim();
        let k = self.kernel;
        let pad = self.padding as isize;
        let mut cols = Array2::<f32>::zeros((channels * k * k, out_h * out_w));

        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let row = (c * k + ky) * k + kx;
                    for oy in 0..out_h {
                        let iy = (oy * self.stride + ky) as isize - pad;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let ix = (ox * self.stride + kx) as isize - pad;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            cols[[row, oy * out_w + ox]] =
                                input[[sample, c, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        cols
    }

    /// Folds a column matrix back into a single-sample image, summing overlaps.
    fn col2im(
        &self,
        cols: &Array2<f32>,
        input_dim: (usize, usize, usize, usize),
        out_h: usize,
        out_w: usize,
    ) -> Array4<f32> {
        let (_, channels, height, width) = input_dim;
        let k = self.kernel;
        let pad = self.padding as isize;
        let mut image = Array4::<f32>::zeros((1, channels, height, width));

        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let row = (c * k + ky) * k + kx;
                    for oy in 0..out_h {
                        let iy = (oy * self.stride + ky) as isize - pad;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let ix = (ox * self.stride + kx) as isize - pad;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            image[[0, c, iy as usize, ix as usize]] += cols[[row, oy * out_w + ox]];
                        }
                    }
                }
            }
        }
        image
    }
}

impl Parameterized for Conv2d {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        visitor(&format!("{}.weight", self.name), self.weight.view().into_dyn());
        visitor(&format!("{}.bias", self.name), self.bias.view().into_dyn());
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        visitor(&format!("{}.weight", self.name), self.weight.view_mut().into_dyn());
        visitor(&format!("{}.bias", self.name), self.bias.view_mut().into_dyn());
    }
}
