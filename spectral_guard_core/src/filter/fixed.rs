//! Fixed band filter with trainable `(radius, value)` pairs.
//!
//! The mask is a weighted sum of annular logistic bands. Pairs are sorted by
//! radius on every forward call, so radii that cross during training simply
//! swap bands.

use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayViewD, ArrayViewMutD};

use super::{FilterOutput, FrequencyFilter, FILTER_PREFIX};
use crate::error::{GuardError, GuardResult};
use crate::nn::{Gradients, Parameterized};
use crate::spectral::{
    band_indicators, combine, combine_backward, filter_backward, filter_traced, radial_field,
    radius_gradient, BandEdge, BandProfile, BandSpec, FilterTrace, FrequencyMask, MaskMode,
    RadialField, Reconstruction,
};

/// Initial band values, from the lowest to the highest band.
pub const DEFAULT_BAND_VALUES: [f32; 4] = [1.0, 0.7, 0.5, 0.2];

#[derive(Debug, Clone, PartialEq)]
pub struct FixedBandFilter {
    /// Radius fractions, in parameter order.
    radii: Array1<f32>,
    values: Array1<f32>,
    reconstruction: Reconstruction,
}

#[derive(Debug, Clone)]
pub struct FixedTrace {
    field: Arc<RadialField>,
    /// `order[i]` is the parameter index of the i-th band by radius.
    order: Vec<usize>,
    radii: Vec<f32>,
    indicators: Array3<f32>,
    weights: Array2<f32>,
    mask: FrequencyMask,
    spectral: FilterTrace,
}

impl Default for FixedBandFilter {
    fn default() -> Self {
        Self {
            radii: Array1::from(BandSpec::coarse().fractions().to_vec()),
            values: Array1::from(DEFAULT_BAND_VALUES.to_vec()),
            reconstruction: Reconstruction::Magnitude,
        }
    }
}

impl FixedBandFilter {
    /// Creates a filter from initial radius fractions and band values.
    ///
    /// The initial fractions go through the validating [`BandSpec`]
    /// constructor; later training may move them freely.
    pub fn new(fractions: Vec<f32>, values: Vec<f32>) -> GuardResult<Self> {
        let spec = BandSpec::new(fractions)?;
        if values.len() != spec.len() {
            return Err(GuardError::configuration(
                "values",
                format!("{} values supplied for {} bands", values.len(), spec.len()),
            ));
        }
        Ok(Self {
            radii: Array1::from(spec.fractions().to_vec()),
            values: Array1::from(values),
            reconstruction: Reconstruction::Magnitude,
        })
    }

    pub fn with_reconstruction(mut self, reconstruction: Reconstruction) -> Self {
        self.reconstruction = reconstruction;
        self
    }

    pub fn radius_fractions(&self) -> &Array1<f32> {
        &self.radii
    }

    pub fn band_values(&self) -> &Array1<f32> {
        &self.values
    }

    fn sorted_bands(&self) -> GuardResult<(Vec<usize>, BandSpec, Array2<f32>)> {
        let mut order: Vec<usize> = (0..self.radii.len()).collect();
        order.sort_by(|&a, &b| self.radii[a].total_cmp(&self.radii[b]));
        let spec = BandSpec::sorted(order.iter().map(|&k| self.radii[k]).collect())?;
        let weights = Array2::from_shape_fn((1, order.len()), |(_, i)| self.values[order[i]]);
        Ok((order, spec, weights))
    }
}

impl FrequencyFilter for FixedBandFilter {
    type Trace = FixedTrace;

    fn filter_traced(&self, image: &Array4<f32>) -> GuardResult<(FilterOutput, FixedTrace)> {
        let (_, _, height, width) = image.dim();
        let field = radial_field(height, width);
        let (order, spec, weights) = self.sorted_bands()?;
        let radii = spec.radii(&field);

        let indicators = band_indicators(&field, &radii, BandEdge::Logistic, BandProfile::Annular);
        let mask = combine(&indicators, &weights, MaskMode::Shared)?;
        let (filtered, spectral) = filter_traced(image, &mask, self.reconstruction)?;

        let output = FilterOutput {
            filtered,
            mask: mask.clone(),
            gates: weights.clone(),
        };
        let trace = FixedTrace {
            field,
            order,
            radii,
            indicators,
            weights,
            mask,
            spectral,
        };
        Ok((output, trace))
    }

    fn backward(
        &self,
        trace: &FixedTrace,
        grad_filtered: &Array4<f32>,
        grads: &mut Gradients,
    ) -> GuardResult<Array4<f32>> {
        let (grad_input, grad_mask) =
            filter_backward(&trace.spectral, &trace.mask, self.reconstruction, grad_filtered)?;

        let grad_weights = combine_backward(&trace.indicators, &grad_mask)?;
        let grad_radii = radius_gradient(
            &trace.field,
            &trace.radii,
            &trace.weights,
            &grad_mask,
            BandEdge::Logistic,
            BandProfile::Annular,
        );
        let max_radius = trace.field.max_radius();

        for (i, &k) in trace.order.iter().enumerate() {
            grads.accumulate_scalar(&format!("{FILTER_PREFIX}.band{k}.value"), grad_weights[[0, i]])?;
            grads.accumulate_scalar(
                &format!("{FILTER_PREFIX}.band{k}.radius"),
                grad_radii[i] * max_radius,
            )?;
        }
        Ok(grad_input)
    }

    fn band_count(&self) -> usize {
        self.radii.len()
    }
}

impl Parameterized for FixedBandFilter {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for k in 0..self.radii.len() {
            visitor(
                &format!("{FILTER_PREFIX}.band{k}.radius"),
                self.radii.slice(s![k]).into_dyn(),
            );
            visitor(
                &format!("{FILTER_PREFIX}.band{k}.value"),
                self.values.slice(s![k]).into_dyn(),
            );
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for k in 0..self.radii.len() {
            visitor(
                &format!("{FILTER_PREFIX}.band{k}.radius"),
                self.radii.slice_mut(s![k]).into_dyn(),
            );
            visitor(
                &format!("{FILTER_PREFIX}.band{k}.value"),
                self.values.slice_mut(s![k]).into_dyn(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mid_gray_keeps_first_band_gain() {
        let filter = FixedBandFilter::default();
        let image = Array4::from_elem((1, 3, 64, 64), 0.5f32);
        let out = filter.filter(&image).unwrap();
        for &v in out.filtered.iter() {
            assert_abs_diff_eq!(v, 0.5, epsilon = 1e-4);
        }
        assert_eq!(out.mask.shape(), vec![64, 64]);
        assert_eq!(out.gates.dim(), (1, 4));
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let err = FixedBandFilter::new(vec![0.3, 0.6], vec![1.0]).unwrap_err();
        assert!(matches!(err, GuardError::Configuration { .. }));
        assert!(FixedBandFilter::new(vec![0.6, 0.3], vec![1.0, 0.5]).is_err());
    }

    #[test]
    fn scalar_parameters_are_filter_tagged() {
        let filter = FixedBandFilter::default();
        let scalars = filter.filter_scalars();
        assert_eq!(scalars.len(), 8);
        assert_abs_diff_eq!(scalars["filter.band0.value"], 1.0);
        assert_abs_diff_eq!(scalars["filter.band3.radius"], 1.0);
    }

    #[test]
    fn crossed_radii_are_sorted_before_use() {
        let mut filter = FixedBandFilter::default();
        filter.visit_parameters_mut(&mut |name, mut view| {
            if name == "filter.band0.radius" {
                view.fill(0.6);
            }
        });
        let (order, spec, weights) = filter.sorted_bands().unwrap();
        assert_eq!(order, vec![1, 0, 2, 3]);
        assert_eq!(spec.fractions(), &[0.5, 0.6, 0.7, 1.0]);
        assert_abs_diff_eq!(weights[[0, 0]], 0.7);
    }

    #[test]
    fn value_gradient_matches_finite_difference() {
        let filter = FixedBandFilter::default();
        let image = Array4::from_shape_fn((1, 1, 8, 8), |(_, _, r, c)| {
            0.5 + 0.3 * ((r as f32 * 0.9).sin() * (c as f32 * 1.3).cos())
        });
        let direction = Array4::from_shape_fn(image.raw_dim(), |(_, _, r, c)| ((r * 8 + c) % 5) as f32 * 0.2);
        let objective = |f: &FixedBandFilter| (&f.filter(&image).unwrap().filtered * &direction).sum();

        let (_, trace) = filter.filter_traced(&image).unwrap();
        let mut grads = Gradients::new();
        filter.backward(&trace, &direction, &mut grads).unwrap();

        let h = 1e-2;
        for name in ["filter.band1.value", "filter.band2.radius"] {
            let shift = |delta: f32| {
                let mut f = filter.clone();
                f.visit_parameters_mut(&mut |n, mut view| {
                    if n == name {
                        view.mapv_inplace(|v| v + delta);
                    }
                });
                objective(&f)
            };
            let numeric = (shift(h) - shift(-h)) / (2.0 * h);
            let analytic = grads.get(name).unwrap().sum();
            assert_abs_diff_eq!(analytic, numeric, epsilon = 5e-2);
        }
    }
}
