//! Forward spectrum, masked inverse and their gradients.
//!
//! The pipeline is `x → shift(fft2(x)) → ·mask → ifft2(unshift(·)) → reconstruct`.
//! Every stage is linear except the final reconstruction, so the backward
//! pass only needs the centered spectrum and the complex inverse.

use ndarray::{Array3, Array4, Axis, Zip};
use rustfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};

use super::fft::{center_shift, fft2_in_place, to_complex, uncenter_shift, TransformDirection};
use super::mask::FrequencyMask;
use crate::error::{GuardError, GuardResult};

const MAGNITUDE_FLOOR: f32 = 1e-12;

/// How a complex inverse becomes a real image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconstruction {
    /// `|y|`.
    Magnitude,
    /// `Re(y)`.
    RealPart,
    /// `clamp(Re(y), 0, 1)`.
    ClampedRealPart,
}

impl Reconstruction {
    #[inline]
    fn apply(self, y: Complex32) -> f32 {
        match self {
            Reconstruction::Magnitude => y.norm(),
            Reconstruction::RealPart => y.re,
            Reconstruction::ClampedRealPart => y.re.clamp(0.0, 1.0),
        }
    }

    /// Complex cotangent `∂L/∂Re + i ∂L/∂Im` given `∂L/∂output`.
    #[inline]
    fn cotangent(self, y: Complex32, grad: f32) -> Complex32 {
        match self {
            Reconstruction::Magnitude => {
                let norm = y.norm();
                if norm < MAGNITUDE_FLOOR {
                    Complex32::new(0.0, 0.0)
                } else {
                    y * (grad / norm)
                }
            }
            Reconstruction::RealPart => Complex32::new(grad, 0.0),
            Reconstruction::ClampedRealPart => {
                if (0.0..=1.0).contains(&y.re) {
                    Complex32::new(grad, 0.0)
                } else {
                    Complex32::new(0.0, 0.0)
                }
            }
        }
    }
}

/// Centered spectrum of every `(batch, channel)` plane.
pub fn forward(image: &Array4<f32>) -> Array4<Complex32> {
    let mut spectrum = to_complex(image);
    fft2_in_place(&mut spectrum, TransformDirection::Forward);
    center_shift(&spectrum)
}

fn masked_inverse(spectrum: &Array4<Complex32>, mask: &FrequencyMask) -> GuardResult<Array4<Complex32>> {
    let (batch, _, height, width) = spectrum.dim();
    mask.ensure_compatible(batch, height, width)?;

    let mut masked = spectrum.clone();
    for (b, mut sample) in masked.axis_iter_mut(Axis(0)).enumerate() {
        let plane = mask.plane(b);
        for mut channel in sample.axis_iter_mut(Axis(0)) {
            Zip::from(&mut channel).and(&plane).for_each(|z, &m| *z *= m);
        }
    }

    let mut inverse = uncenter_shift(&masked);
    fft2_in_place(&mut inverse, TransformDirection::Inverse);
    Ok(inverse)
}

/// Multiplies `spectrum` by `mask`, inverts, and reconstructs a real image.
pub fn apply_and_invert(
    spectrum: &Array4<Complex32>,
    mask: &FrequencyMask,
    reconstruction: Reconstruction,
) -> GuardResult<Array4<f32>> {
    let inverse = masked_inverse(spectrum, mask)?;
    Ok(inverse.mapv(|y| reconstruction.apply(y)))
}

/// Intermediate values kept for [`filter_backward`].
#[derive(Debug, Clone)]
pub struct FilterTrace {
    spectrum: Array4<Complex32>,
    inverse: Array4<Complex32>,
}

impl FilterTrace {
    /// The centered spectrum of the filter input.
    pub fn spectrum(&self) -> &Array4<Complex32> {
        &self.spectrum
    }
}

/// Filters `image` with `mask` and keeps what the backward pass needs.
pub fn filter_traced(
    image: &Array4<f32>,
    mask: &FrequencyMask,
    reconstruction: Reconstruction,
) -> GuardResult<(Array4<f32>, FilterTrace)> {
    filter_spectrum_traced(forward(image), mask, reconstruction)
}

/// Same as [`filter_traced`] for a spectrum the caller already computed.
pub fn filter_spectrum_traced(
    spectrum: Array4<Complex32>,
    mask: &FrequencyMask,
    reconstruction: Reconstruction,
) -> GuardResult<(Array4<f32>, FilterTrace)> {
    let inverse = masked_inverse(&spectrum, mask)?;
    let output = inverse.mapv(|y| reconstruction.apply(y));
    Ok((output, FilterTrace { spectrum, inverse }))
}

/// Gradient of a filter call w.r.t. its input image and its mask.
///
/// The mask gradient has the mask's own row count: per-sample rows stay
/// separate, shared masks sum over the batch. Channels always sum.
pub fn filter_backward(
    trace: &FilterTrace,
    mask: &FrequencyMask,
    reconstruction: Reconstruction,
    grad_output: &Array4<f32>,
) -> GuardResult<(Array4<f32>, Array3<f32>)> {
    if grad_output.dim() != trace.inverse.dim() {
        return Err(GuardError::shape(
            "filter output gradient",
            trace.inverse.dim(),
            grad_output.dim(),
        ));
    }
    let (_, _, height, width) = grad_output.dim();
    let n = (height * width) as f32;

    let mut cotangent = Array4::<Complex32>::zeros(grad_output.raw_dim());
    Zip::from(&mut cotangent)
        .and(&trace.inverse)
        .and(grad_output)
        .for_each(|c, &y, &g| *c = reconstruction.cotangent(y, g));

    // Adjoint of the normalized inverse: unnormalized forward, then shift.
    fft2_in_place(&mut cotangent, TransformDirection::Forward);
    let grad_spectrum = center_shift(&cotangent);

    let mut grad_mask = Array3::<f32>::zeros(mask.values().raw_dim());
    let shared = mask.values().len_of(Axis(0)) == 1;
    for (b, (g_sample, s_sample)) in grad_spectrum
        .axis_iter(Axis(0))
        .zip(trace.spectrum.axis_iter(Axis(0)))
        .enumerate()
    {
        let row = if shared { 0 } else { b };
        let mut target = grad_mask.index_axis_mut(Axis(0), row);
        for (g_chan, s_chan) in g_sample.axis_iter(Axis(0)).zip(s_sample.axis_iter(Axis(0))) {
            Zip::from(&mut target)
                .and(&g_chan)
                .and(&s_chan)
                .for_each(|t, g, s| *t += (g.conj() * *s).re / n);
        }
    }

    let mut through_mask = grad_spectrum;
    for (b, mut sample) in through_mask.axis_iter_mut(Axis(0)).enumerate() {
        let plane = mask.plane(b);
        for mut channel in sample.axis_iter_mut(Axis(0)) {
            Zip::from(&mut channel).and(&plane).for_each(|z, &m| *z *= m);
        }
    }
    let mut back = uncenter_shift(&through_mask);
    fft2_in_place(&mut back, TransformDirection::Inverse);
    let grad_input = back.mapv(|z| z.re);

    Ok((grad_input, grad_mask))
}

/// `log10(|X| + 1)` of a centered spectrum.
pub fn log_magnitude(spectrum: &Array4<Complex32>) -> Array4<f32> {
    spectrum.mapv(|z| (z.norm() + 1.0).log10())
}

/// Gradient of `log_magnitude(forward(image))` w.r.t. `image`.
pub fn log_magnitude_backward(
    spectrum: &Array4<Complex32>,
    grad_features: &Array4<f32>,
) -> GuardResult<Array4<f32>> {
    if grad_features.dim() != spectrum.dim() {
        return Err(GuardError::shape(
            "log-magnitude gradient",
            spectrum.dim(),
            grad_features.dim(),
        ));
    }
    let (_, _, height, width) = spectrum.dim();
    let n = (height * width) as f32;
    let ln10 = std::f32::consts::LN_10;

    let mut cotangent = Array4::<Complex32>::zeros(spectrum.raw_dim());
    Zip::from(&mut cotangent)
        .and(spectrum)
        .and(grad_features)
        .for_each(|c, &z, &g| {
            let norm = z.norm();
            if norm >= MAGNITUDE_FLOOR {
                *c = z * (g / (norm * (norm + 1.0) * ln10));
            }
        });

    let mut back = uncenter_shift(&cotangent);
    fft2_in_place(&mut back, TransformDirection::Inverse);
    Ok(back.mapv(|z| z.re * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::mask::MaskMode;
    use approx::assert_abs_diff_eq;

    fn sample_image(batch: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, 3, h, w), |(b, c, r, col)| {
            0.5 + 0.2 * (((b + 1) * (c + 2) * (r * 3 + col * 5)) as f32 * 0.13).sin()
        })
    }

    #[test]
    fn all_pass_round_trip() {
        let image = sample_image(2, 8, 7);
        let spectrum = forward(&image);
        let mask = FrequencyMask::ones(MaskMode::Shared, 2, 8, 7);
        let restored = apply_and_invert(&spectrum, &mask, Reconstruction::RealPart).unwrap();
        for (a, b) in image.iter().zip(restored.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn mask_shape_mismatch_is_shape_error() {
        let image = sample_image(2, 8, 8);
        let spectrum = forward(&image);
        let mask = FrequencyMask::ones(MaskMode::PerSample, 3, 8, 8);
        let err = apply_and_invert(&spectrum, &mask, Reconstruction::RealPart).unwrap_err();
        assert!(matches!(err, GuardError::Shape { .. }));
    }

    #[test]
    fn dc_lands_at_center() {
        let image = Array4::from_elem((1, 1, 6, 6), 1.0f32);
        let spectrum = forward(&image);
        assert_abs_diff_eq!(spectrum[[0, 0, 3, 3]].re, 36.0, epsilon = 1e-4);
    }

    fn finite_difference_check(reconstruction: Reconstruction) {
        let image = sample_image(1, 6, 6);
        let mask_values = Array3::from_shape_fn((1, 6, 6), |(_, r, c)| 0.6 + 0.05 * ((r + 2 * c) % 5) as f32);
        let mask = FrequencyMask::new(MaskMode::Shared, mask_values.clone()).unwrap();
        let direction = Array4::from_shape_fn(image.raw_dim(), |(_, c, r, col)| {
            ((c * 11 + r * 3 + col) % 7) as f32 / 7.0 - 0.4
        });

        let objective = |img: &Array4<f32>, m: &FrequencyMask| -> f32 {
            let out = apply_and_invert(&forward(img), m, reconstruction).unwrap();
            (&out * &direction).sum()
        };

        let (_, trace) = filter_traced(&image, &mask, reconstruction).unwrap();
        let (grad_input, grad_mask) = filter_backward(&trace, &mask, reconstruction, &direction).unwrap();

        let h = 1e-2;
        for &(c, r, col) in &[(0, 1, 2), (1, 4, 4), (2, 0, 5)] {
            let mut plus = image.clone();
            plus[[0, c, r, col]] += h;
            let mut minus = image.clone();
            minus[[0, c, r, col]] -= h;
            let numeric = (objective(&plus, &mask) - objective(&minus, &mask)) / (2.0 * h);
            assert_abs_diff_eq!(grad_input[[0, c, r, col]], numeric, epsilon = 2e-2);
        }
        for &(r, col) in &[(3, 3), (2, 4), (0, 1)] {
            let mut plus = mask_values.clone();
            plus[[0, r, col]] += h;
            let mut minus = mask_values.clone();
            minus[[0, r, col]] -= h;
            let mp = FrequencyMask::new(MaskMode::Shared, plus).unwrap();
            let mm = FrequencyMask::new(MaskMode::Shared, minus).unwrap();
            let numeric = (objective(&image, &mp) - objective(&image, &mm)) / (2.0 * h);
            assert_abs_diff_eq!(grad_mask[[0, r, col]], numeric, epsilon = 2e-2);
        }
    }

    #[test]
    fn real_part_gradients_match_finite_differences() {
        finite_difference_check(Reconstruction::RealPart);
    }

    #[test]
    fn magnitude_gradients_match_finite_differences() {
        finite_difference_check(Reconstruction::Magnitude);
    }

    #[test]
    fn log_magnitude_gradient_matches_finite_difference() {
        // A unit impulse has a flat unit spectrum; a small texture on top keeps
        // every bin well away from |X| = 0, where the magnitude has a kink.
        let image = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, r, col)| {
            let impulse = if (r, col) == (0, 0) { 1.0 } else { 0.0 };
            impulse + 0.02 * (((c * 5 + r * 3 + col * 7) % 9) as f32 / 9.0 - 0.5)
        });
        assert!(forward(&image).iter().all(|z| z.norm() > 0.5));
        let direction = Array4::from_shape_fn(image.raw_dim(), |(_, c, r, col)| ((c + r + col) % 3) as f32 - 1.0);
        let objective = |img: &Array4<f32>| (&log_magnitude(&forward(img)) * &direction).sum();
        let grad = log_magnitude_backward(&forward(&image), &direction).unwrap();

        let h = 2e-3;
        for &(c, r, col) in &[(0, 0, 0), (1, 2, 3), (2, 3, 1)] {
            let mut plus = image.clone();
            plus[[0, c, r, col]] += h;
            let mut minus = image.clone();
            minus[[0, c, r, col]] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad[[0, c, r, col]], numeric, epsilon = 3e-2);
        }
    }
}
