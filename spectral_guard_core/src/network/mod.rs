//! Restoration backbones.
//!
//! The training and inference engines only see [`RestorationNetwork`]:
//! a traced forward pass, a backward pass that returns the input gradient
//! and collects parameter gradients by name, and a plain prediction call.

pub mod denoiser;
pub mod padding;

use ndarray::Array4;

use crate::error::GuardResult;
use crate::nn::{Gradients, Parameterized};

pub use denoiser::{DenoiserConfig, DenoiserTrace, FilteredDenoiser};
pub use padding::{crop_to, pad_to, pad_to_multiple, PadExtent};

pub trait RestorationNetwork: Parameterized + Send + Sync {
    /// Whatever the backward pass needs from the forward pass.
    type Trace: Send;

    fn forward_traced(&self, input: &Array4<f32>) -> GuardResult<(Array4<f32>, Self::Trace)>;

    /// Accumulates parameter gradients into `grads` and returns the gradient
    /// w.r.t. the input of the traced forward call.
    fn backward(
        &self,
        trace: &Self::Trace,
        grad_output: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>>;

    fn predict(&self, input: &Array4<f32>) -> GuardResult<Array4<f32>> {
        Ok(self.forward_traced(input)?.0)
    }

    /// Output resolution divided by input resolution.
    fn scale_factor(&self) -> usize {
        1
    }
}
