//! Fully connected layer.

use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::params::{Gradients, Parameterized};
use crate::error::{GuardError, GuardResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    name: String,
    /// `(out_features, in_features)`.
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Xavier-normal weights, zero bias.
    pub fn new(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        seed: u64,
    ) -> GuardResult<Self> {
        let name = name.into();
        if in_features == 0 || out_features == 0 {
            return Err(GuardError::configuration(name, "feature counts must be > 0"));
        }
        let std = (2.0 / (in_features + out_features) as f32).sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|e| GuardError::configuration(name.clone(), e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weight =
            Array2::from_shape_simple_fn((out_features, in_features), || normal.sample(&mut rng));

        Ok(Self {
            name,
            weight,
            bias: Array1::zeros(out_features),
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `input` is `(batch, in_features)`.
    pub fn forward(&self, input: &Array2<f32>) -> GuardResult<Array2<f32>> {
        if input.ncols() != self.in_features() {
            return Err(GuardError::shape(
                format!("{} input features", self.name),
                self.in_features(),
                input.ncols(),
            ));
        }
        Ok(input.dot(&self.weight.t()) + &self.bias)
    }

    pub fn backward(
        &self,
        input: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array2<f32>> {
        if grad_output.dim() != (input.nrows(), self.out_features()) {
            return Err(GuardError::shape(
                format!("{} output gradient", self.name),
                (input.nrows(), self.out_features()),
                grad_output.dim(),
            ));
        }
        let grad_weight = grad_output.t().dot(input);
        let grad_bias = grad_output.sum_axis(Axis(0));
        grads.accumulate(&format!("{}.weight", self.name), grad_weight.into_dyn())?;
        grads.accumulate(&format!("{}.bias", self.name), grad_bias.into_dyn())?;
        Ok(grad_output.dot(&self.weight))
    }
}

impl Parameterized for Linear {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        visitor(&format!("{}.weight", self.name), self.weight.view().into_dyn());
        visitor(&format!("{}.bias", self.name), self.bias.view().into_dyn());
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        visitor(&format!("{}.weight", self.name), self.weight.view_mut().into_dyn());
        visitor(&format!("{}.bias", self.name), self.bias.view_mut().into_dyn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn forward_applies_weight_and_bias() {
        let mut layer = Linear::new("fc", 2, 1, 0).unwrap();
        layer.weight = array![[2.0, -1.0]];
        layer.bias = array![0.5];
        let out = layer.forward(&array![[1.0, 3.0]]).unwrap();
        assert_abs_diff_eq!(out[[0, 0]], -0.5);
    }

    #[test]
    fn backward_matches_closed_form() {
        let mut layer = Linear::new("fc", 2, 2, 0).unwrap();
        layer.weight = array![[1.0, 2.0], [3.0, 4.0]];
        let x = array![[1.0, -1.0], [0.5, 2.0]];
        let g = array![[1.0, 0.0], [0.0, 1.0]];
        let mut grads = Gradients::new();
        let gx = layer.backward(&x, &g, &mut grads).unwrap();
        assert_eq!(gx, array![[1.0, 2.0], [3.0, 4.0]]);
        let gw = grads.get("fc.weight").unwrap();
        assert_eq!(gw.as_slice().unwrap(), &[1.0, -1.0, 0.5, 2.0]);
        assert_eq!(grads.get("fc.bias").unwrap().as_slice().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn feature_mismatch_is_shape_error() {
        let layer = Linear::new("fc", 3, 2, 0).unwrap();
        assert!(layer.forward(&Array2::zeros((1, 4))).is_err());
    }
}
