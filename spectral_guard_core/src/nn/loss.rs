//! Pixel losses with gradients.
//!
//! Every loss depends only on `prediction - target`, so the gradient w.r.t.
//! the target is the negated prediction gradient.

use ndarray::{Array4, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::activation::sign;
use crate::error::{GuardError, GuardResult};

/// A differentiable image-to-image loss.
pub trait PixelLoss: Send + Sync {
    /// Returns `(loss, ∂loss/∂prediction)`.
    fn evaluate(&self, prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<(f32, Array4<f32>)>;

    fn name(&self) -> &'static str;
}

fn check_shapes(context: &str, prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<()> {
    if prediction.dim() != target.dim() {
        return Err(GuardError::shape(context, prediction.dim(), target.dim()));
    }
    if prediction.is_empty() {
        return Err(GuardError::shape(context, "non-empty tensor", prediction.dim()));
    }
    Ok(())
}

/// Weighted mean squared error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MseLoss {
    pub weight: f32,
}

impl PixelLoss for MseLoss {
    fn evaluate(&self, prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<(f32, Array4<f32>)> {
        check_shapes("mse loss", prediction, target)?;
        let diff = prediction - target;
        let n = diff.len() as f32;
        let loss = diff.mapv(|d| d * d).sum() / n;
        let grad = diff * (2.0 * self.weight / n);
        Ok((loss * self.weight, grad))
    }

    fn name(&self) -> &'static str {
        "mse"
    }
}

/// Weighted mean absolute error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L1Loss {
    pub weight: f32,
}

impl PixelLoss for L1Loss {
    fn evaluate(&self, prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<(f32, Array4<f32>)> {
        check_shapes("l1 loss", prediction, target)?;
        let diff = prediction - target;
        let n = diff.len() as f32;
        let loss = diff.mapv(f32::abs).sum() / n;
        let scale = self.weight / n;
        let grad = diff.mapv(|d| sign(d) * scale);
        Ok((loss * self.weight, grad))
    }

    fn name(&self) -> &'static str {
        "l1"
    }
}

/// Negative-PSNR style loss: `weight · 10/ln(10) · mean_b ln(mse_b + 1e-8)`.
///
/// Lower is better; minimizing it maximizes per-sample PSNR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsnrLoss {
    pub weight: f32,
}

const PSNR_EPS: f32 = 1e-8;

impl PixelLoss for PsnrLoss {
    fn evaluate(&self, prediction: &Array4<f32>, target: &Array4<f32>) -> GuardResult<(f32, Array4<f32>)> {
        check_shapes("psnr loss", prediction, target)?;
        let scale = 10.0 / std::f32::consts::LN_10;
        let batch = prediction.len_of(Axis(0));
        let per_sample = prediction.len() / batch;
        let diff = prediction - target;

        let mut loss = 0.0;
        let mut grad = Array4::<f32>::zeros(diff.raw_dim());
        for (d, mut g) in diff.axis_iter(Axis(0)).zip(grad.axis_iter_mut(Axis(0))) {
            let mse = d.mapv(|v| v * v).sum() / per_sample as f32;
            loss += (mse + PSNR_EPS).ln();
            let coef = self.weight * scale / batch as f32 / (mse + PSNR_EPS) * 2.0 / per_sample as f32;
            Zip::from(&mut g).and(&d).for_each(|g, &v| *g = v * coef);
        }
        Ok((self.weight * scale * loss / batch as f32, grad))
    }

    fn name(&self) -> &'static str {
        "psnr"
    }
}

/// Loss selector used by configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Mse,
    L1,
    Psnr,
}

impl LossKind {
    pub fn build(self, weight: f32) -> Box<dyn PixelLoss> {
        match self {
            LossKind::Mse => Box::new(MseLoss { weight }),
            LossKind::L1 => Box::new(L1Loss { weight }),
            LossKind::Psnr => Box::new(PsnrLoss { weight }),
        }
    }
}
