//! Zero padding to an alignment multiple, and the matching crop.
//!
//! Padding is applied at the bottom and right edges only, so cropping the
//! top-left `height × width` window restores the original geometry.

use ndarray::{s, Array4};

use crate::error::{GuardError, GuardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadExtent {
    pub height: usize,
    pub width: usize,
    pub padded_height: usize,
    pub padded_width: usize,
}

impl PadExtent {
    pub fn for_size(height: usize, width: usize, multiple: usize) -> GuardResult<Self> {
        if multiple == 0 {
            return Err(GuardError::configuration("alignment", "must be > 0"));
        }
        let round_up = |n: usize| n + (multiple - n % multiple) % multiple;
        Ok(Self {
            height,
            width,
            padded_height: round_up(height),
            padded_width: round_up(width),
        })
    }

    pub fn is_noop(&self) -> bool {
        self.height == self.padded_height && self.width == self.padded_width
    }
}

/// Zero-pads `input` so both spatial extents are multiples of `multiple`.
pub fn pad_to_multiple(input: &Array4<f32>, multiple: usize) -> GuardResult<(Array4<f32>, PadExtent)> {
    let (_, _, height, width) = input.dim();
    let extent = PadExtent::for_size(height, width, multiple)?;
    Ok((pad_to(input, &extent), extent))
}

/// Zero-pads a `height × width` tensor to the padded extent.
pub fn pad_to(input: &Array4<f32>, extent: &PadExtent) -> Array4<f32> {
    if extent.is_noop() {
        return input.clone();
    }
    let (batch, channels, _, _) = input.dim();
    let mut padded = Array4::zeros((batch, channels, extent.padded_height, extent.padded_width));
    padded
        .slice_mut(s![.., .., ..extent.height, ..extent.width])
        .assign(input);
    padded
}

/// Keeps the top-left `extent.height × extent.width` window.
pub fn crop_to(input: &Array4<f32>, extent: &PadExtent) -> Array4<f32> {
    if extent.is_noop() {
        return input.clone();
    }
    input
        .slice(s![.., .., ..extent.height, ..extent.width])
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_bottom_right_and_crops_back() {
        let x = Array4::from_shape_fn((1, 2, 5, 6), |(_, c, r, col)| (c * 100 + r * 10 + col) as f32);
        let (padded, extent) = pad_to_multiple(&x, 4).unwrap();
        assert_eq!(padded.dim(), (1, 2, 8, 8));
        assert_eq!(padded[[0, 1, 4, 5]], x[[0, 1, 4, 5]]);
        assert_eq!(padded[[0, 0, 7, 7]], 0.0);
        assert_eq!(crop_to(&padded, &extent), x);
    }

    #[test]
    fn aligned_input_is_untouched() {
        let extent = PadExtent::for_size(16, 8, 8).unwrap();
        assert!(extent.is_noop());
        assert!(PadExtent::for_size(16, 8, 0).is_err());
    }
}
