//! Radial distance fields over a centered spectrum.
//!
//! Every band filter measures frequency as the Euclidean distance from the
//! image center. Fields are pure functions of `(height, width)`, so they are
//! memoized process-wide in a small LRU cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use lru::LruCache;
use ndarray::Array2;

/// Number of distinct resolutions kept alive by [`radial_field`].
pub const RADIAL_CACHE_CAPACITY: usize = 32;

/// Distance-from-center field for one spatial resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RadialField {
    height: usize,
    width: usize,
    distance: Array2<f32>,
    max_radius: f32,
}

impl RadialField {
    /// Computes the field for an `height × width` grid.
    ///
    /// The center sits at `(height / 2, width / 2)` in real arithmetic, so odd
    /// sizes get a half-integer center.
    pub fn compute(height: usize, width: usize) -> Self {
        let center_row = height as f32 / 2.0;
        let center_col = width as f32 / 2.0;
        let distance = Array2::from_shape_fn((height, width), |(row, col)| {
            let dr = row as f32 - center_row;
            let dc = col as f32 - center_col;
            (dr * dr + dc * dc).sqrt()
        });
        let max_radius = ((height * height + width * width) as f32).sqrt() / 2.0;

        Self {
            height,
            width,
            distance,
            max_radius,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn distance(&self) -> &Array2<f32> {
        &self.distance
    }

    /// Half the diagonal: the radius that reaches the corners.
    pub fn max_radius(&self) -> f32 {
        self.max_radius
    }

    /// Converts radius fractions into absolute radii for this resolution.
    pub fn radii(&self, fractions: &[f32]) -> Vec<f32> {
        fractions.iter().map(|f| f * self.max_radius).collect()
    }
}

type FieldCache = Mutex<LruCache<(usize, usize), Arc<RadialField>>>;

static FIELD_CACHE: OnceLock<FieldCache> = OnceLock::new();

fn field_cache() -> &'static FieldCache {
    FIELD_CACHE.get_or_init(|| {
        let capacity =
            NonZeroUsize::new(RADIAL_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Mutex::new(LruCache::new(capacity))
    })
}

/// Returns the (possibly cached) radial field for `height × width`.
pub fn radial_field(height: usize, width: usize) -> Arc<RadialField> {
    let key = (height, width);
    if let Ok(mut cache) = field_cache().lock() {
        if let Some(field) = cache.get(&key) {
            return Arc::clone(field);
        }
        let field = Arc::new(RadialField::compute(height, width));
        cache.put(key, Arc::clone(&field));
        return field;
    }

    tracing::warn!("radial field cache poisoned; computing {height}x{width} uncached");
    Arc::new(RadialField::compute(height, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn center_is_zero_for_even_sizes() {
        let field = RadialField::compute(8, 6);
        assert_eq!(field.distance()[[4, 3]], 0.0);
        assert_abs_diff_eq!(field.distance()[[0, 0]], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn odd_sizes_use_half_integer_center() {
        let field = RadialField::compute(3, 3);
        // Center at (1.5, 1.5): the nearest grid points sit sqrt(0.5) away.
        assert_abs_diff_eq!(field.distance()[[1, 1]], 0.5f32.sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(field.distance()[[2, 2]], 0.5f32.sqrt(), epsilon = 1e-6);
    }

    #[test]
    fn max_radius_is_half_diagonal() {
        let field = RadialField::compute(64, 64);
        assert_abs_diff_eq!(field.max_radius(), (2.0f32 * 64.0 * 64.0).sqrt() / 2.0);
        let radii = field.radii(&[0.5, 1.0]);
        assert_abs_diff_eq!(radii[1], field.max_radius());
    }

    #[test]
    fn cache_returns_shared_field() {
        let a = radial_field(17, 23);
        let b = radial_field(17, 23);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dims(), (17, 23));
    }
}
