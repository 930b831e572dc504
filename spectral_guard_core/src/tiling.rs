//! Tiled inference for inputs too large to run in one pass.
//!
//! The full-resolution extent is covered by possibly-overlapping crops. The
//! last row and column of crops is moved back so it ends exactly at the
//! boundary. Crop sizes and steps are multiples of the network's scale
//! factor, and the low-resolution input is sliced at `offset / scale`.
//! Predictions are summed into an output buffer alongside a count buffer
//! and divided, so overlaps are averaged.

use ndarray::{concatenate, s, Array2, Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GuardError, GuardResult};
use crate::network::RestorationNetwork;

/// Crop size along one axis, in full-resolution pixels or as a fraction of
/// the full-resolution extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropExtent {
    Pixels(usize),
    Ratio(f32),
}

impl CropExtent {
    fn resolve(self, extent: usize) -> usize {
        match self {
            CropExtent::Pixels(pixels) => pixels,
            CropExtent::Ratio(ratio) => (ratio * extent as f32) as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    pub crop_h: CropExtent,
    pub crop_w: CropExtent,
    #[serde(default = "default_scale")]
    pub scale: usize,
    /// Crops per network call, `None` runs every crop at once.
    #[serde(default)]
    pub max_minibatch: Option<usize>,
}

fn default_scale() -> usize {
    1
}

impl TilingConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if self.scale == 0 {
            return Err(GuardError::configuration("tiling.scale", "must be > 0"));
        }
        if self.max_minibatch == Some(0) {
            return Err(GuardError::configuration("tiling.max_minibatch", "must be > 0"));
        }
        for (name, crop) in [("tiling.crop_h", self.crop_h), ("tiling.crop_w", self.crop_w)] {
            let valid = match crop {
                CropExtent::Pixels(pixels) => pixels > 0,
                CropExtent::Ratio(ratio) => ratio.is_finite() && ratio > 0.0,
            };
            if !valid {
                return Err(GuardError::configuration(name, "must be > 0"));
            }
        }
        Ok(())
    }
}

/// Top-left corner of one crop in full-resolution coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
}

/// Crop layout for one image. Tiles are ordered row-major, and that order is
/// the order of the crops in the batch built by [`TilePlan::grids`].
#[derive(Debug, Clone, PartialEq)]
pub struct TilePlan {
    pub height: usize,
    pub width: usize,
    pub crop_h: usize,
    pub crop_w: usize,
    pub scale: usize,
    pub tiles: Vec<Tile>,
}

impl TilePlan {
    /// Lays out crops over a `height × width` full-resolution extent.
    pub fn new(config: &TilingConfig, height: usize, width: usize) -> GuardResult<Self> {
        config.validate()?;
        let scale = config.scale;
        if height % scale != 0 || width % scale != 0 {
            return Err(GuardError::configuration(
                "tiling.scale",
                format!("{height}x{width} is not divisible by {scale}"),
            ));
        }

        let crop_h = round_down(config.crop_h.resolve(height).min(height), scale);
        let crop_w = round_down(config.crop_w.resolve(width).min(width), scale);
        if crop_h == 0 || crop_w == 0 {
            return Err(GuardError::configuration(
                "tiling.crop",
                format!("crop {crop_h}x{crop_w} is empty after rounding to scale {scale}"),
            ));
        }

        let rows = offsets(height, crop_h, step(height, crop_h, scale));
        let cols = offsets(width, crop_w, step(width, crop_w, scale));
        let tiles = rows
            .iter()
            .flat_map(|&row| cols.iter().map(move |&col| Tile { row, col }))
            .collect();

        Ok(Self {
            height,
            width,
            crop_h,
            crop_w,
            scale,
            tiles,
        })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Slices the low-resolution `input` into one crop per tile, stacked on
    /// the batch axis.
    pub fn grids(&self, input: &Array4<f32>) -> GuardResult<Array4<f32>> {
        let (batch, channels, height, width) = input.dim();
        if batch != 1 {
            return Err(GuardError::configuration("tiling", format!("batch size must be 1, got {batch}")));
        }
        let expected = (1, channels, self.height / self.scale, self.width / self.scale);
        if input.dim() != expected {
            return Err(GuardError::shape("tiled input", expected, (batch, channels, height, width)));
        }

        let (lr_h, lr_w) = (self.crop_h / self.scale, self.crop_w / self.scale);
        let crops: Vec<ArrayView4<'_, f32>> = self
            .tiles
            .iter()
            .map(|tile| {
                let (r, c) = (tile.row / self.scale, tile.col / self.scale);
                input.slice(s![.., .., r..r + lr_h, c..c + lr_w])
            })
            .collect();
        concatenate(Axis(0), &crops).map_err(|err| GuardError::shape("tile stack", expected, err.to_string()))
    }

    /// Averages per-tile predictions back into a `(1, channels, height, width)` image.
    pub fn grids_inverse(&self, predictions: &Array4<f32>) -> GuardResult<Array4<f32>> {
        let (count, channels, crop_h, crop_w) = predictions.dim();
        let expected = (self.tiles.len(), channels, self.crop_h, self.crop_w);
        if (count, crop_h, crop_w) != (expected.0, expected.2, expected.3) {
            return Err(GuardError::shape("tile predictions", expected, predictions.dim()));
        }

        let mut output = Array4::<f32>::zeros((1, channels, self.height, self.width));
        let mut counts = Array2::<f32>::zeros((self.height, self.width));
        for (tile, prediction) in self.tiles.iter().zip(predictions.axis_iter(Axis(0))) {
            let (r, c) = (tile.row, tile.col);
            let mut window = output.slice_mut(s![0, .., r..r + self.crop_h, c..c + self.crop_w]);
            window += &prediction;
            counts
                .slice_mut(s![r..r + self.crop_h, c..c + self.crop_w])
                .mapv_inplace(|n| n + 1.0);
        }

        output /= &counts;
        Ok(output)
    }
}

fn round_down(value: usize, multiple: usize) -> usize {
    value / multiple * multiple
}

/// Step that spreads the crops evenly, rounded down to the scale and never
/// below it.
fn step(extent: usize, crop: usize, scale: usize) -> usize {
    let count = (extent - 1) / crop + 1;
    let raw = if count == 1 {
        crop
    } else {
        ((extent - crop) as f64 / (count - 1) as f64 - 1e-8).ceil() as usize
    };
    round_down(raw, scale).max(scale)
}

fn offsets(extent: usize, crop: usize, step: usize) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    loop {
        if offset + crop >= extent {
            offsets.push(extent - crop);
            return offsets;
        }
        offsets.push(offset);
        offset += step;
    }
}

/// Runs `network` over the batch axis in chunks of at most `max_minibatch`.
pub fn predict_minibatched<N>(
    network: &N,
    input: &Array4<f32>,
    max_minibatch: Option<usize>,
) -> GuardResult<Array4<f32>>
where
    N: RestorationNetwork + ?Sized,
{
    let batch = input.dim().0;
    let chunk = max_minibatch.unwrap_or(batch).max(1);
    if batch <= chunk {
        return network.predict(input);
    }

    let mut outputs = Vec::with_capacity(batch.div_ceil(chunk));
    for start in (0..batch).step_by(chunk) {
        let end = (start + chunk).min(batch);
        let part = input.slice(s![start..end, .., .., ..]).to_owned();
        outputs.push(network.predict(&part)?);
    }
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    concatenate(Axis(0), &views).map_err(|err| GuardError::shape("minibatch outputs", batch, err.to_string()))
}

/// Crop, predict and reassemble one image.
#[derive(Debug, Clone)]
pub struct TiledInference {
    config: TilingConfig,
}

impl TiledInference {
    pub fn new(config: TilingConfig) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TilingConfig {
        &self.config
    }

    pub fn predict<N>(&self, network: &N, input: &Array4<f32>) -> GuardResult<Array4<f32>>
    where
        N: RestorationNetwork + ?Sized,
    {
        if network.scale_factor() != self.config.scale {
            return Err(GuardError::configuration(
                "tiling.scale",
                format!(
                    "network scales by {}, tiling expects {}",
                    network.scale_factor(),
                    self.config.scale
                ),
            ));
        }
        let (_, _, height, width) = input.dim();
        let plan = TilePlan::new(&self.config, height * self.config.scale, width * self.config.scale)?;
        let crops = plan.grids(input)?;
        debug!(tiles = plan.len(), crop_h = plan.crop_h, crop_w = plan.crop_w, "tiled inference");
        let predictions = predict_minibatched(network, &crops, self.config.max_minibatch)?;
        plan.grids_inverse(&predictions)
    }
}
