//! Synthetic image batches for training without a dataset on disk.

use ndarray::{Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spectral_guard_core::ImagePair;

/// Pattern families mixed into every generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Sinusoidal grating with random frequency and orientation.
    Grating,
    /// Axis-aligned checkerboard with random cell size.
    Checker,
    /// Soft disc at a random position.
    Disc,
}

const PATTERNS: [Pattern; 3] = [Pattern::Grating, Pattern::Checker, Pattern::Disc];

/// Deterministic stream of clean/degraded batches.
pub struct SyntheticImages {
    rng: StdRng,
    channels: usize,
    size: usize,
}

impl SyntheticImages {
    pub fn new(seed: u64, channels: usize, size: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            channels,
            size,
        }
    }

    /// Ground truth plus a blurred, contrast-reduced degraded copy.
    pub fn next_batch(&mut self, batch: usize) -> ImagePair {
        let mut gt = Array4::zeros((batch, self.channels, self.size, self.size));
        for mut sample in gt.axis_iter_mut(Axis(0)) {
            let pattern = PATTERNS[self.rng.gen_range(0..PATTERNS.len())];
            let tint: Vec<f32> = (0..self.channels).map(|_| self.rng.gen_range(0.6..1.0)).collect();
            let field = self.pattern_field(pattern);
            for ((c, r, col), v) in sample.indexed_iter_mut() {
                *v = (field[[r, col]] * tint[c]).clamp(0.0, 1.0);
            }
        }
        let lq = degrade(&gt);
        ImagePair { lq, gt }
    }

    fn pattern_field(&mut self, pattern: Pattern) -> Array2<f32> {
        let n = self.size;
        match pattern {
            Pattern::Grating => {
                let freq = self.rng.gen_range(0.05..0.6);
                let angle = self.rng.gen_range(0.0..std::f32::consts::PI);
                let (s, c) = angle.sin_cos();
                Array2::from_shape_fn((n, n), |(r, col)| {
                    0.5 + 0.45 * ((r as f32 * s + col as f32 * c) * freq).sin()
                })
            }
            Pattern::Checker => {
                let cell = self.rng.gen_range(2..=(n / 2).max(2));
                Array2::from_shape_fn((n, n), |(r, col)| {
                    if (r / cell + col / cell) % 2 == 0 {
                        0.85
                    } else {
                        0.15
                    }
                })
            }
            Pattern::Disc => {
                let center = (self.rng.gen_range(0.0..n as f32), self.rng.gen_range(0.0..n as f32));
                let radius = self.rng.gen_range(n as f32 * 0.15..n as f32 * 0.45);
                Array2::from_shape_fn((n, n), |(r, col)| {
                    let d = ((r as f32 - center.0).powi(2) + (col as f32 - center.1).powi(2)).sqrt();
                    0.2 + 0.7 / (1.0 + (d - radius).exp())
                })
            }
        }
    }
}

/// 3×3 box blur with edge replication, then contrast reduced toward 0.5.
fn degrade(gt: &Array4<f32>) -> Array4<f32> {
    let (_, _, h, w) = gt.dim();
    let mut out = gt.clone();
    for ((b, c, r, col), v) in out.indexed_iter_mut() {
        let mut sum = 0.0;
        for dr in [-1i32, 0, 1] {
            for dc in [-1i32, 0, 1] {
                let rr = (r as i32 + dr).clamp(0, h as i32 - 1) as usize;
                let cc = (col as i32 + dc).clamp(0, w as i32 - 1) as usize;
                sum += gt[[b, c, rr, cc]];
            }
        }
        *v = 0.5 + (sum / 9.0 - 0.5) * 0.8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_have_requested_shape_and_range() {
        let mut images = SyntheticImages::new(3, 3, 16);
        let pair = images.next_batch(4);
        assert_eq!(pair.gt.dim(), (4, 3, 16, 16));
        assert_eq!(pair.lq.dim(), pair.gt.dim());
        assert!(pair.gt.iter().chain(pair.lq.iter()).all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn same_seed_same_stream() {
        let a = SyntheticImages::new(9, 1, 8).next_batch(2);
        let b = SyntheticImages::new(9, 1, 8).next_batch(2);
        assert_eq!(a.gt, b.gt);
    }
}
