//! Band specifications, band indicators and frequency masks.
//!
//! A mask is built in two steps: [`band_indicators`] turns a [`BandSpec`]
//! into one `(H, W)` indicator plane per band, then [`combine`] takes a
//! weighted sum of those planes with one weight row per mask. Both steps
//! have matching backward helpers so trainable weights and radii receive
//! gradients.

use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::geometry::RadialField;
use crate::error::{GuardError, GuardResult};

/// Fractions used by the fixed and classification filters.
pub const COARSE_BAND_FRACTIONS: [f32; 4] = [0.3, 0.5, 0.7, 1.0];

/// Band count of the dense specs used by regression and augmentation filters.
pub const DENSE_BAND_COUNT: usize = 100;

// ============================================================================
// Band specification
// ============================================================================

/// Ordered radius fractions, each a fraction of the half-diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSpec {
    fractions: Vec<f32>,
}

impl BandSpec {
    /// Validating constructor: fractions must be finite, in `(0, 1]` and
    /// strictly increasing.
    pub fn new(fractions: Vec<f32>) -> GuardResult<Self> {
        if fractions.is_empty() {
            return Err(GuardError::configuration("bands", "at least one band is required"));
        }
        for (k, &f) in fractions.iter().enumerate() {
            if !f.is_finite() || f <= 0.0 || f > 1.0 {
                return Err(GuardError::configuration(
                    "bands",
                    format!("fraction {k} = {f} is outside (0, 1]"),
                ));
            }
        }
        if let Some(k) = fractions.windows(2).position(|w| w[1] <= w[0]) {
            return Err(GuardError::configuration(
                "bands",
                format!(
                    "fractions must be strictly increasing ({} follows {})",
                    fractions[k + 1],
                    fractions[k]
                ),
            ));
        }
        Ok(Self { fractions })
    }

    /// Sorting constructor for trainable radii, which may drift out of order
    /// or outside `(0, 1]` during training. Only finiteness is enforced.
    pub fn sorted(mut fractions: Vec<f32>) -> GuardResult<Self> {
        if fractions.is_empty() {
            return Err(GuardError::configuration("bands", "at least one band is required"));
        }
        if let Some(&bad) = fractions.iter().find(|f| !f.is_finite()) {
            return Err(GuardError::numerical("band radius", bad));
        }
        fractions.sort_by(|a, b| a.total_cmp(b));
        Ok(Self { fractions })
    }

    /// `count` bands at even spacing: `1/count, 2/count, ..., 1`.
    pub fn uniform(count: usize) -> GuardResult<Self> {
        if count == 0 {
            return Err(GuardError::configuration("bands", "band count must be > 0"));
        }
        Self::new((1..=count).map(|k| k as f32 / count as f32).collect())
    }

    pub fn coarse() -> Self {
        Self {
            fractions: COARSE_BAND_FRACTIONS.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.fractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fractions.is_empty()
    }

    pub fn fractions(&self) -> &[f32] {
        &self.fractions
    }

    /// Absolute radii for `field`'s resolution.
    pub fn radii(&self, field: &RadialField) -> Vec<f32> {
        field.radii(&self.fractions)
    }
}

// ============================================================================
// Indicators
// ============================================================================

/// Response of a single radius edge at distance `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandEdge {
    /// `sigmoid(R - d)`: smooth, differentiable in `R`.
    Logistic,
    /// `1` where `d <= R`, else `0`.
    Hard,
}

impl BandEdge {
    #[inline]
    pub fn response(self, radius: f32, distance: f32) -> f32 {
        match self {
            BandEdge::Logistic => sigmoid(radius - distance),
            BandEdge::Hard => {
                if distance <= radius {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// How edges turn into bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandProfile {
    /// Rings: `edge_k - edge_{k-1}`, the first band being a plain disc.
    Annular,
    /// Discs: every band is its raw edge, so bands overlap cumulatively.
    Nested,
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Builds the `(N, H, W)` indicator stack for `radii` (absolute, ascending).
pub fn band_indicators(
    field: &RadialField,
    radii: &[f32],
    edge: BandEdge,
    profile: BandProfile,
) -> Array3<f32> {
    let (height, width) = field.dims();
    let distance = field.distance();
    let mut indicators = Array3::<f32>::zeros((radii.len(), height, width));

    for (k, &radius) in radii.iter().enumerate() {
        let mut plane = indicators.index_axis_mut(Axis(0), k);
        plane.zip_mut_with(distance, |v, &d| *v = edge.response(radius, d));
    }

    if profile == BandProfile::Annular {
        for k in (1..radii.len()).rev() {
            let (lower, mut upper) = indicators.view_mut().split_at(Axis(0), k);
            let lower = lower.index_axis(Axis(0), k - 1);
            let mut band = upper.index_axis_mut(Axis(0), 0);
            band -= &lower;
        }
    }
    indicators
}

// ============================================================================
// Masks
// ============================================================================

/// Whether one mask is broadcast over the batch or each sample owns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    Shared,
    PerSample,
}

/// Per-pixel multiplicative weights applied to a centered spectrum.
///
/// `values` is `(1, H, W)` for [`MaskMode::Shared`] and `(B, H, W)` for
/// [`MaskMode::PerSample`]. Masks are broadcast over channels.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyMask {
    mode: MaskMode,
    values: Array3<f32>,
}

impl FrequencyMask {
    pub fn new(mode: MaskMode, values: Array3<f32>) -> GuardResult<Self> {
        if mode == MaskMode::Shared && values.len_of(Axis(0)) != 1 {
            return Err(GuardError::shape(
                "shared mask rows",
                1,
                values.len_of(Axis(0)),
            ));
        }
        Ok(Self { mode, values })
    }

    /// All-pass mask.
    pub fn ones(mode: MaskMode, batch: usize, height: usize, width: usize) -> Self {
        let rows = match mode {
            MaskMode::Shared => 1,
            MaskMode::PerSample => batch,
        };
        Self {
            mode,
            values: Array3::ones((rows, height, width)),
        }
    }

    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn into_values(self) -> Array3<f32> {
        self.values
    }

    /// `[H, W]` for shared masks, `[B, H, W]` for per-sample ones.
    pub fn shape(&self) -> Vec<usize> {
        let (rows, h, w) = self.values.dim();
        match self.mode {
            MaskMode::Shared => vec![h, w],
            MaskMode::PerSample => vec![rows, h, w],
        }
    }

    /// The plane applied to batch element `sample`.
    pub fn plane(&self, sample: usize) -> ArrayView2<'_, f32> {
        let row = match self.mode {
            MaskMode::Shared => 0,
            MaskMode::PerSample => sample,
        };
        self.values.index_axis(Axis(0), row)
    }

    /// Checks that the mask can be applied to a `(batch, _, height, width)` tensor.
    pub fn ensure_compatible(&self, batch: usize, height: usize, width: usize) -> GuardResult<()> {
        let (rows, h, w) = self.values.dim();
        let rows_ok = match self.mode {
            MaskMode::Shared => rows == 1,
            MaskMode::PerSample => rows == batch,
        };
        if !rows_ok || h != height || w != width {
            let expected_rows = match self.mode {
                MaskMode::Shared => 1,
                MaskMode::PerSample => batch,
            };
            return Err(GuardError::shape(
                "frequency mask",
                (expected_rows, height, width),
                (rows, h, w),
            ));
        }
        Ok(())
    }
}

/// Weighted sum of indicator planes: `mask[r] = Σ_k weights[r, k] · indicators[k]`.
pub fn combine(
    indicators: &Array3<f32>,
    weights: &Array2<f32>,
    mode: MaskMode,
) -> GuardResult<FrequencyMask> {
    let (bands, height, width) = indicators.dim();
    let (rows, weight_bands) = weights.dim();
    if weight_bands != bands {
        return Err(GuardError::configuration(
            "band weights",
            format!("{weight_bands} weights supplied for {bands} bands"),
        ));
    }
    let flat = indicators
        .view()
        .into_shape((bands, height * width))
        .map_err(|e| GuardError::shape("indicator reshape", bands * height * width, e.to_string()))?;
    let values = weights
        .dot(&flat)
        .into_shape((rows, height, width))
        .map_err(|e| GuardError::shape("mask reshape", (rows, height, width), e.to_string()))?;
    FrequencyMask::new(mode, values)
}

/// Gradient of [`combine`] w.r.t. `weights`, shaped `(rows, N)`.
pub fn combine_backward(
    indicators: &Array3<f32>,
    grad_mask: &Array3<f32>,
) -> GuardResult<Array2<f32>> {
    let (bands, height, width) = indicators.dim();
    let (rows, gh, gw) = grad_mask.dim();
    if (gh, gw) != (height, width) {
        return Err(GuardError::shape("mask gradient", (height, width), (gh, gw)));
    }
    let grad = grad_mask.as_standard_layout();
    let ind = indicators.as_standard_layout();
    let grad_flat = grad
        .view()
        .into_shape((rows, height * width))
        .map_err(|e| GuardError::shape("mask gradient reshape", rows * height * width, e.to_string()))?;
    let ind_flat = ind
        .view()
        .into_shape((bands, height * width))
        .map_err(|e| GuardError::shape("indicator reshape", bands * height * width, e.to_string()))?;
    Ok(grad_flat.dot(&ind_flat.t()))
}

/// Gradient of the combined mask w.r.t. each absolute radius.
///
/// Only logistic edges carry a radius gradient; hard edges return zeros.
pub fn radius_gradient(
    field: &RadialField,
    radii: &[f32],
    weights: &Array2<f32>,
    grad_mask: &Array3<f32>,
    edge: BandEdge,
    profile: BandProfile,
) -> Vec<f32> {
    let bands = radii.len();
    if edge == BandEdge::Hard {
        return vec![0.0; bands];
    }
    let distance = field.distance();
    let rows = weights.nrows();

    (0..bands)
        .map(|k| {
            // Coefficient of edge k in each mask row.
            let coeffs: Vec<f32> = (0..rows)
                .map(|r| match profile {
                    BandProfile::Nested => weights[[r, k]],
                    BandProfile::Annular => {
                        let next = if k + 1 < bands { weights[[r, k + 1]] } else { 0.0 };
                        weights[[r, k]] - next
                    }
                })
                .collect();

            let mut total = 0.0f32;
            for ((row, col), &d) in distance.indexed_iter() {
                let s = sigmoid(radii[k] - d);
                let slope = s * (1.0 - s);
                if slope == 0.0 {
                    continue;
                }
                let upstream: f32 = coeffs
                    .iter()
                    .enumerate()
                    .map(|(r, c)| grad_mask[[r, row, col]] * c)
                    .sum();
                total += slope * upstream;
            }
            total
        })
        .collect()
}

/// Sum over bands, per pixel. Used to check annular coverage.
pub fn coverage(indicators: &Array3<f32>) -> Array2<f32> {
    indicators.sum_axis(Axis(0))
}
