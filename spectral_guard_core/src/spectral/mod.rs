//! Spectral machinery: radial geometry, 2-D FFT, band masks and the
//! differentiable mask-and-invert pipeline.

pub mod fft;
pub mod geometry;
pub mod mask;
pub mod transform;

pub use geometry::{radial_field, RadialField};
pub use mask::{
    band_indicators, combine, combine_backward, coverage, radius_gradient, BandEdge, BandProfile,
    BandSpec, FrequencyMask, MaskMode, COARSE_BAND_FRACTIONS, DENSE_BAND_COUNT,
};
pub use transform::{
    apply_and_invert, filter_backward, filter_spectrum_traced, filter_traced, forward, log_magnitude,
    log_magnitude_backward, FilterTrace, Reconstruction,
};
