//! Random band filter used as a training-time augmentation.
//!
//! Each sample gets its own i.i.d. `U(0, 1)` weight per band. The same mask
//! can be applied to several tensors of a batch (noisy input, ground truth,
//! adversarial input) so they stay spectrally aligned. No gradients flow
//! into the weights.

use ndarray::{Array2, Array4};
use rand::Rng;

use crate::error::GuardResult;
use crate::spectral::{
    apply_and_invert, band_indicators, combine, forward, radial_field, BandEdge, BandProfile,
    BandSpec, FrequencyMask, MaskMode, Reconstruction,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RandomBandFilter {
    spec: BandSpec,
    reconstruction: Reconstruction,
}

impl RandomBandFilter {
    /// `bands` evenly spaced annular bands.
    pub fn new(bands: usize) -> GuardResult<Self> {
        Ok(Self {
            spec: BandSpec::uniform(bands)?,
            reconstruction: Reconstruction::ClampedRealPart,
        })
    }

    pub fn with_spec(spec: BandSpec) -> Self {
        Self {
            spec,
            reconstruction: Reconstruction::ClampedRealPart,
        }
    }

    pub fn band_count(&self) -> usize {
        self.spec.len()
    }

    /// Draws fresh weights and builds a per-sample mask.
    ///
    /// Returns the mask together with the `(batch, bands)` weights.
    pub fn sample_mask<R: Rng + ?Sized>(
        &self,
        batch: usize,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> GuardResult<(FrequencyMask, Array2<f32>)> {
        let field = radial_field(height, width);
        let radii = self.spec.radii(&field);
        let indicators = band_indicators(&field, &radii, BandEdge::Logistic, BandProfile::Annular);
        let weights = Array2::from_shape_simple_fn((batch, self.spec.len()), || rng.gen::<f32>());
        let mask = combine(&indicators, &weights, MaskMode::PerSample)?;
        Ok((mask, weights))
    }

    pub fn apply(&self, image: &Array4<f32>, mask: &FrequencyMask) -> GuardResult<Array4<f32>> {
        apply_and_invert(&forward(image), mask, self.reconstruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn masks_are_per_sample_and_bounded() {
        let filter = RandomBandFilter::new(100).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (mask, weights) = filter.sample_mask(4, 16, 16, &mut rng).unwrap();
        assert_eq!(mask.shape(), vec![4, 16, 16]);
        assert_eq!(weights.dim(), (4, 100));
        assert!(weights.iter().all(|w| (0.0..1.0).contains(w)));
        // Annular bands sum to at most one, so the mask stays in [0, 1].
        assert!(mask.values().iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)));
    }

    #[test]
    fn applied_output_is_clamped() {
        let filter = RandomBandFilter::new(10).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let image = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, r, col)| ((b + c + r * col) % 2) as f32);
        let (mask, _) = filter.sample_mask(2, 8, 8, &mut rng).unwrap();
        let out = filter.apply(&image, &mask).unwrap();
        assert_eq!(out.dim(), image.dim());
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn batch_mismatch_is_rejected() {
        let filter = RandomBandFilter::new(10).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let (mask, _) = filter.sample_mask(3, 8, 8, &mut rng).unwrap();
        assert!(filter.apply(&Array4::zeros((2, 3, 8, 8)), &mask).is_err());
    }
}
