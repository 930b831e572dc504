//! Element-wise activations and their derivatives.
//!
//! Backward functions take the forward *input* and the upstream gradient.

use ndarray::{Array, Dimension, Zip};

/// Slope of the negative half in [`leaky_relu`], PyTorch's default.
pub const LEAKY_RELU_SLOPE: f32 = 0.01;

pub fn relu<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(|v| v.max(0.0))
}

pub fn relu_backward<D: Dimension>(x: &Array<f32, D>, grad: &Array<f32, D>) -> Array<f32, D> {
    let mut out = grad.clone();
    Zip::from(&mut out).and(x).for_each(|g, &v| {
        if v <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

pub fn leaky_relu<D: Dimension>(x: &Array<f32, D>, slope: f32) -> Array<f32, D> {
    x.mapv(|v| if v > 0.0 { v } else { v * slope })
}

pub fn leaky_relu_backward<D: Dimension>(
    x: &Array<f32, D>,
    grad: &Array<f32, D>,
    slope: f32,
) -> Array<f32, D> {
    let mut out = grad.clone();
    Zip::from(&mut out).and(x).for_each(|g, &v| {
        if v <= 0.0 {
            *g *= slope;
        }
    });
    out
}

pub fn sigmoid<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(crate::spectral::mask::sigmoid)
}

pub fn sigmoid_backward<D: Dimension>(x: &Array<f32, D>, grad: &Array<f32, D>) -> Array<f32, D> {
    let mut out = grad.clone();
    Zip::from(&mut out).and(x).for_each(|g, &v| {
        let s = crate::spectral::mask::sigmoid(v);
        *g *= s * (1.0 - s);
    });
    out
}

/// Sign with `sign(0) = 0`.
#[inline]
pub fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn relu_gates_gradient() {
        let x = array![-1.0, 0.0, 2.0];
        assert_eq!(relu(&x), array![0.0, 0.0, 2.0]);
        assert_eq!(relu_backward(&x, &array![1.0, 1.0, 1.0]), array![0.0, 0.0, 1.0]);
    }

    #[test]
    fn leaky_relu_keeps_negative_slope() {
        let x = array![-2.0, 3.0];
        assert_eq!(leaky_relu(&x, 0.1), array![-0.2, 3.0]);
        assert_eq!(leaky_relu_backward(&x, &array![1.0, 1.0], 0.1), array![0.1, 1.0]);
    }

    #[test]
    fn sigmoid_derivative_peaks_at_zero() {
        let g = sigmoid_backward(&array![0.0f32], &array![1.0f32]);
        assert_eq!(g[0], 0.25);
    }

    #[test]
    fn sign_of_zero_is_zero() {
        assert_eq!(sign(0.0), 0.0);
        assert_eq!(sign(-0.0), 0.0);
        assert_eq!(sign(-3.0), -1.0);
    }
}
