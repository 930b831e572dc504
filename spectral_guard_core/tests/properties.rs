use ndarray::{Array4, ArrayViewD, ArrayViewMutD};
use proptest::prelude::*;
use spectral_guard_core::attack::project_sign_step;
use spectral_guard_core::filter::FilterConfig;
use spectral_guard_core::nn::SgdOptimizer;
use spectral_guard_core::spectral::{
    apply_and_invert, band_indicators, coverage, forward, radial_field, BandEdge, BandProfile,
};
use spectral_guard_core::{
    BandSpec, CropExtent, DenoiserConfig, FilterStage, FilteredDenoiser, FixedBandFilter,
    FrequencyFilter, FrequencyMask, Gradients, GuardResult, MaskMode, ParameterGroup,
    Parameterized, Reconstruction, RestorationNetwork, TiledInference, TilingConfig,
};

fn textured(batch: usize, channels: usize, height: usize, width: usize) -> Array4<f32> {
    Array4::from_shape_fn((batch, channels, height, width), |(b, c, r, col)| {
        0.5 + 0.4 * ((r * 3 + col * 5 + b * 7 + c * 11) as f32 * 0.37).sin()
    })
}

/// Image whose values are multiples of 1/64, so sums of a few copies are exact.
fn dyadic(channels: usize, height: usize, width: usize) -> Array4<f32> {
    Array4::from_shape_fn((1, channels, height, width), |(_, c, r, col)| {
        ((r * 7 + col * 3 + c * 13) % 64) as f32 / 64.0
    })
}

struct Identity;

impl Parameterized for Identity {
    fn visit_parameters(&self, _visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {}
    fn visit_parameters_mut(&mut self, _visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {}
}

impl RestorationNetwork for Identity {
    type Trace = ();

    fn forward_traced(&self, input: &Array4<f32>) -> GuardResult<(Array4<f32>, ())> {
        Ok((input.clone(), ()))
    }

    fn backward(&self, _trace: &(), grad_output: &Array4<f32>, _grads: &mut Gradients) -> GuardResult<Array4<f32>> {
        Ok(grad_output.clone())
    }
}

/// Nearest-neighbour ×2 upsampler.
struct Upsample2;

impl Parameterized for Upsample2 {
    fn visit_parameters(&self, _visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {}
    fn visit_parameters_mut(&mut self, _visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {}
}

impl RestorationNetwork for Upsample2 {
    type Trace = ();

    fn forward_traced(&self, input: &Array4<f32>) -> GuardResult<(Array4<f32>, ())> {
        let (b, c, h, w) = input.dim();
        let out = Array4::from_shape_fn((b, c, h * 2, w * 2), |(b, c, r, col)| input[[b, c, r / 2, col / 2]]);
        Ok((out, ()))
    }

    fn backward(&self, _trace: &(), grad_output: &Array4<f32>, _grads: &mut Gradients) -> GuardResult<Array4<f32>> {
        let (b, c, h, w) = grad_output.dim();
        let mut grad = Array4::zeros((b, c, h / 2, w / 2));
        for ((bi, ci, r, col), g) in grad_output.indexed_iter() {
            grad[[bi, ci, r / 2, col / 2]] += g;
        }
        Ok(grad)
    }

    fn scale_factor(&self) -> usize {
        2
    }
}

#[test]
fn all_ones_mask_round_trips() {
    let image = textured(2, 3, 16, 12);
    let mask = FrequencyMask::ones(MaskMode::PerSample, 2, 16, 12);
    let restored = apply_and_invert(&forward(&image), &mask, Reconstruction::RealPart).expect("round trip");
    for (a, b) in image.iter().zip(restored.iter()) {
        assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0));
    }
}

#[test]
fn dense_annular_bands_cover_almost_everything() {
    let field = radial_field(32, 32);
    let spec = BandSpec::uniform(100).expect("band spec");
    let indicators = band_indicators(&field, &spec.radii(&field), BandEdge::Logistic, BandProfile::Annular);
    let total = coverage(&indicators);
    assert!(total.iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)));

    let max_radius = field.max_radius();
    for ((r, c), &v) in total.indexed_iter() {
        if field.distance()[[r, c]] < max_radius - 6.0 {
            assert!(v > 0.99, "coverage {v} at ({r}, {c})");
        }
    }
}

#[test]
fn gate_vectors_match_band_count() {
    let image = textured(2, 3, 16, 16);
    for bands in [4, 10, 20, 100] {
        let config = FilterConfig::Regression {
            bands,
            edge: BandEdge::Logistic,
            mask_mode: MaskMode::PerSample,
            include_image: true,
            widths: vec![4, 4],
            hidden: 8,
            seed: 1,
        };
        let filter = config.build(3).expect("regression filter");
        let output = filter.filter(&image).expect("filter");
        assert_eq!(output.gates.dim(), (2, bands));
        assert_eq!(output.mask.shape(), vec![2, 16, 16]);
    }

    let shared = FilterConfig::Classification {
        fractions: vec![0.3, 0.5, 0.7, 1.0],
        outputs: 5,
        temperature: 1.0,
        mask_mode: MaskMode::Shared,
        widths: vec![4, 4],
        hidden: 8,
        seed: 1,
    };
    let output = shared.build(3).expect("classification filter").filter(&image).expect("filter");
    assert_eq!(output.mask.shape(), vec![16, 16]);
    assert_eq!(output.gates.dim(), (1, 4));
}

#[test]
fn reversed_filter_group_ascends_its_raw_gradient() {
    let mut network = FilteredDenoiser::new(
        &DenoiserConfig {
            channels: 1,
            features: 3,
            depth: 3,
            alignment: 1,
            seed: 9,
        },
        FilterStage::Fixed(FixedBandFilter::default()),
    )
    .expect("network");
    let image = textured(1, 1, 12, 12);
    let (output, trace) = network.forward_traced(&image).expect("forward");
    let mut grads = Gradients::new();
    network.backward(&trace, &output, &mut grads).expect("backward");
    let raw = grads.clone();
    let before = network.parameter_snapshot();

    let lr = 0.1;
    let mut backbone = ParameterGroup::backbone(Box::new(SgdOptimizer::new(lr, 0.0, 0.0)));
    let mut filter = ParameterGroup::filter(Box::new(SgdOptimizer::new(lr, 0.0, 0.0)));
    backbone.step(&mut network, &mut grads).expect("backbone step");
    filter.step(&mut network, &mut grads).expect("filter step");
    let after = network.parameter_snapshot();

    let mut moved = 0;
    for (name, grad) in raw.iter() {
        let delta = &after[name] - &before[name];
        let alignment: f32 = (&delta * grad).sum();
        if grad.iter().all(|g| g.abs() < 1e-3) {
            continue;
        }
        moved += 1;
        if name.starts_with("filter") {
            assert!(alignment > 0.0, "{name} should ascend");
        } else {
            assert!(alignment < 0.0, "{name} should descend");
        }
    }
    assert!(moved > 2);
}

#[test]
fn tiled_identity_reconstructs_input_exactly() {
    let image = dyadic(3, 37, 29);
    let engine = TiledInference::new(TilingConfig {
        crop_h: CropExtent::Pixels(16),
        crop_w: CropExtent::Pixels(12),
        scale: 1,
        max_minibatch: Some(3),
    })
    .expect("tiling");
    let output = engine.predict(&Identity, &image).expect("tiled predict");
    assert_eq!(output, image);
}

#[test]
fn tiled_upsampler_matches_direct_prediction() {
    let image = dyadic(2, 12, 10);
    let engine = TiledInference::new(TilingConfig {
        crop_h: CropExtent::Pixels(8),
        crop_w: CropExtent::Pixels(8),
        scale: 2,
        max_minibatch: None,
    })
    .expect("tiling");
    let tiled = engine.predict(&Upsample2, &image).expect("tiled predict");
    assert_eq!(tiled, Upsample2.predict(&image).expect("predict"));
}

#[test]
fn tiling_scale_must_match_network() {
    let engine = TiledInference::new(TilingConfig {
        crop_h: CropExtent::Pixels(4),
        crop_w: CropExtent::Pixels(4),
        scale: 1,
        max_minibatch: None,
    })
    .expect("tiling");
    assert!(engine.predict(&Upsample2, &dyadic(1, 8, 8)).is_err());
}

#[test]
fn mid_gray_passes_fixed_filter_at_first_band_value() {
    let image = Array4::from_elem((1, 3, 64, 64), 0.5);
    let output = FixedBandFilter::default().filter(&image).expect("filter");
    assert!(output.filtered.iter().all(|v| (v - 0.5).abs() < 1e-3));
}

proptest! {
    #[test]
    fn projected_step_stays_in_box(
        origin in prop::collection::vec(0.0f32..=1.0, 12),
        offsets in prop::collection::vec(-0.3f32..0.3, 12),
        grads in prop::collection::vec(-1.0f32..1.0, 12),
        steps in prop::collection::vec(0.0f32..0.5, 12),
        epsilon in 0.0f32..0.3,
    ) {
        let shape = (1, 1, 3, 4);
        let origin = Array4::from_shape_vec(shape, origin).unwrap();
        let current = (&origin + &Array4::from_shape_vec(shape, offsets).unwrap()).mapv(|v| v.clamp(0.0, 1.0));
        let grad = Array4::from_shape_vec(shape, grads).unwrap();
        let steps = Array4::from_shape_vec(shape, steps).unwrap();

        let next = project_sign_step(&current, &grad, &steps, &origin, epsilon).unwrap();
        for (v, o) in next.iter().zip(origin.iter()) {
            prop_assert!((0.0..=1.0).contains(v));
            prop_assert!((v - o).abs() <= epsilon + 1e-6);
        }
    }
}
