//! Average pooling.

use ndarray::{Array2, Array4, Axis};

use crate::error::{GuardError, GuardResult};

/// Non-overlapping `k × k` average pooling; trailing rows/columns that do
/// not fill a window are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvgPool2d {
    kernel: usize,
}

impl AvgPool2d {
    pub fn new(kernel: usize) -> GuardResult<Self> {
        if kernel == 0 {
            return Err(GuardError::configuration("pool kernel", "must be > 0"));
        }
        Ok(Self { kernel })
    }

    pub fn forward(&self, input: &Array4<f32>) -> GuardResult<Array4<f32>> {
        let (batch, channels, height, width) = input.dim();
        let k = self.kernel;
        let (out_h, out_w) = (height / k, width / k);
        if out_h == 0 || out_w == 0 {
            return Err(GuardError::shape(
                "average pool input",
                format!("at least {k}x{k}"),
                (height, width),
            ));
        }
        let norm = 1.0 / (k * k) as f32;
        Ok(Array4::from_shape_fn((batch, channels, out_h, out_w), |(b, c, r, col)| {
            let mut acc = 0.0;
            for dy in 0..k {
                for dx in 0..k {
                    acc += input[[b, c, r * k + dy, col * k + dx]];
                }
            }
            acc * norm
        }))
    }

    /// Spreads each output gradient evenly over its window.
    pub fn backward(&self, input_dim: (usize, usize, usize, usize), grad_output: &Array4<f32>) -> Array4<f32> {
        let k = self.kernel;
        let (_, _, out_h, out_w) = grad_output.dim();
        let norm = 1.0 / (k * k) as f32;
        Array4::from_shape_fn(input_dim, |(b, c, r, col)| {
            let (pr, pc) = (r / k, col / k);
            if pr < out_h && pc < out_w {
                grad_output[[b, c, pr, pc]] * norm
            } else {
                0.0
            }
        })
    }
}

/// Mean over the spatial axes: `(B, C, H, W) → (B, C)`.
pub fn global_average_pool(input: &Array4<f32>) -> Array2<f32> {
    let (_, _, height, width) = input.dim();
    let norm = 1.0 / (height * width).max(1) as f32;
    input.sum_axis(Axis(3)).sum_axis(Axis(2)) * norm
}

pub fn global_average_pool_backward(
    input_dim: (usize, usize, usize, usize),
    grad_output: &Array2<f32>,
) -> Array4<f32> {
    let (_, _, height, width) = input_dim;
    let norm = 1.0 / (height * width).max(1) as f32;
    Array4::from_shape_fn(input_dim, |(b, c, _, _)| grad_output[[b, c]] * norm)
}
