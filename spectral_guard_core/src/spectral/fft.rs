//! Plane-wise 2-D FFT and center-shift kernels.
//!
//! Tensors are `(batch, channel, height, width)`; each `(batch, channel)`
//! plane is transformed independently, in parallel.

use ndarray::Array4;
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    Forward,
    /// Inverse transform, normalized by `1 / (height * width)`.
    Inverse,
}

/// Transforms every spatial plane of `data` in place.
pub fn fft2_in_place(data: &mut Array4<Complex32>, direction: TransformDirection) {
    let (_, _, height, width) = data.dim();
    if height == 0 || width == 0 || data.is_empty() {
        return;
    }
    if !data.is_standard_layout() {
        *data = data.as_standard_layout().to_owned();
    }

    let mut planner = FftPlanner::<f32>::new();
    let (row_fft, col_fft) = match direction {
        TransformDirection::Forward => (
            planner.plan_fft_forward(width),
            planner.plan_fft_forward(height),
        ),
        TransformDirection::Inverse => (
            planner.plan_fft_inverse(width),
            planner.plan_fft_inverse(height),
        ),
    };
    let norm = match direction {
        TransformDirection::Forward => 1.0,
        TransformDirection::Inverse => 1.0 / (height * width) as f32,
    };

    let plane_len = height * width;
    if let Some(values) = data.as_slice_mut() {
        values.par_chunks_mut(plane_len).for_each(|plane| {
            transform_plane(plane, height, width, row_fft.as_ref(), col_fft.as_ref(), norm)
        });
    }
}

fn transform_plane(
    plane: &mut [Complex32],
    height: usize,
    width: usize,
    row_fft: &dyn Fft<f32>,
    col_fft: &dyn Fft<f32>,
    norm: f32,
) {
    // Rows are contiguous; rustfft processes the buffer in `width`-sized chunks.
    row_fft.process(plane);

    let mut columns = vec![Complex32::new(0.0, 0.0); height * width];
    for r in 0..height {
        for c in 0..width {
            columns[c * height + r] = plane[r * width + c];
        }
    }
    col_fft.process(&mut columns);

    for r in 0..height {
        for c in 0..width {
            plane[r * width + c] = columns[c * height + r] * norm;
        }
    }
}

/// Moves the zero-frequency bin to `(height / 2, width / 2)`.
pub fn center_shift<T: Copy>(data: &Array4<T>) -> Array4<T> {
    let (_, _, h, w) = data.dim();
    let (dy, dx) = (h / 2, w / 2);
    Array4::from_shape_fn(data.dim(), |(b, c, r, col)| {
        data[[b, c, (r + h - dy) % h, (col + w - dx) % w]]
    })
}

/// Exact inverse of [`center_shift`], also for odd sizes.
pub fn uncenter_shift<T: Copy>(data: &Array4<T>) -> Array4<T> {
    let (_, _, h, w) = data.dim();
    let (dy, dx) = (h / 2, w / 2);
    Array4::from_shape_fn(data.dim(), |(b, c, r, col)| {
        data[[b, c, (r + dy) % h, (col + dx) % w]]
    })
}

/// Lifts a real tensor into the complex domain.
pub fn to_complex(image: &Array4<f32>) -> Array4<Complex32> {
    image.mapv(|v| Complex32::new(v, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn shift_matches_numpy_convention_for_odd_sizes() {
        let data = Array4::from_shape_vec((1, 1, 1, 5), vec![0, 1, 2, 3, 4]).unwrap();
        let shifted = center_shift(&data);
        assert_eq!(shifted.iter().copied().collect::<Vec<_>>(), vec![3, 4, 0, 1, 2]);
        let back = uncenter_shift(&shifted);
        assert_eq!(back, data);
    }

    #[test]
    fn forward_then_inverse_is_identity() {
        let image = Array4::from_shape_fn((2, 3, 6, 5), |(b, c, r, col)| {
            ((b * 7 + c * 3 + r * 5 + col) % 11) as f32 / 11.0
        });
        let mut data = to_complex(&image);
        fft2_in_place(&mut data, TransformDirection::Forward);
        fft2_in_place(&mut data, TransformDirection::Inverse);
        for (orig, z) in image.iter().zip(data.iter()) {
            assert_abs_diff_eq!(*orig, z.re, epsilon = 1e-5);
            assert_abs_diff_eq!(0.0, z.im, epsilon = 1e-5);
        }
    }

    #[test]
    fn constant_plane_has_only_dc() {
        let image = Array4::from_elem((1, 1, 4, 4), 0.5f32);
        let mut data = to_complex(&image);
        fft2_in_place(&mut data, TransformDirection::Forward);
        assert_abs_diff_eq!(data[[0, 0, 0, 0]].re, 8.0, epsilon = 1e-5);
        let off_dc: f32 = data.iter().skip(1).map(|z| z.norm()).sum();
        assert!(off_dc < 1e-4);
    }
}
