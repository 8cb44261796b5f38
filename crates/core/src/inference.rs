//! Model-agnostic inference wrapper.
//!
//! Every network sees NCHW float32 input padded so both spatial sizes are a
//! multiple of the model's alignment; the output is cropped back to
//! `input * scale` and clamped to `[0, 1]`. Large images can be processed in
//! overlapping tiles.

use anyhow::{bail, Context, Result};
use ndarray::{s, Array3, Array4, Axis};
use serde::Serialize;
use tracing::debug;

use crate::pixels::PixelBuffer;

/// Context pixels added on every side of a tile to hide seams.
pub const DEFAULT_TILE_OVERLAP: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Architecture name, e.g. `RealESRGAN`, `SPSR`, `SRVGG (Compact)`.
    pub name: String,
    pub in_nc: usize,
    pub out_nc: usize,
    /// Integer upscale factor; `None` when only a run can tell (ONNX graphs).
    pub scale: Option<usize>,
    /// Spatial sizes fed to the network must be multiples of this.
    pub pad_align: usize,
    pub num_feat: Option<usize>,
    /// Trunk blocks (RRDB/SPSR) or body convolutions (compact).
    pub num_blocks: Option<usize>,
}

/// A loaded super-resolution network.
pub trait SuperResModel {
    fn info(&self) -> &ModelInfo;

    /// Runs the network on a `1 x in_nc x H x W` batch.
    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;
}

/// Upscales `image` with `model`. `tile_size == 0` disables tiling.
pub fn infer(
    model: &mut dyn SuperResModel,
    image: &PixelBuffer,
    tile_size: usize,
) -> Result<PixelBuffer> {
    let expected = model.info().in_nc;
    if image.channels() != expected {
        bail!(
            "image has {} channels but {} expects {expected}",
            image.channels(),
            model.info().name
        );
    }

    let input = hwc_to_nchw(image.data());
    let (_, _, height, width) = input.dim();
    let output = if tile_size > 0 && (height > tile_size || width > tile_size) {
        run_tiled(model, &input, tile_size)?
    } else {
        run_padded(model, &input)?.0
    };

    let mut hwc = nchw_to_hwc(&output);
    hwc.mapv_inplace(|v| v.clamp(0.0, 1.0));
    PixelBuffer::new(hwc)
}

pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    image
        .view()
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

pub fn nchw_to_hwc(batch: &Array4<f32>) -> Array3<f32> {
    batch
        .index_axis(Axis(0), 0)
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned()
}

pub fn pad_amount(dim: usize, align: usize) -> usize {
    if align <= 1 {
        0
    } else {
        (align - dim % align) % align
    }
}

/// Mirror index into `0..len` that stays valid for any overshoot, so even a
/// 1-pixel image can be padded.
fn mirror(pos: usize, len: usize) -> usize {
    let period = 2 * len;
    let m = pos % period;
    if m < len {
        m
    } else {
        period - 1 - m
    }
}

/// Pads bottom and right edges by mirroring until both sizes are multiples of `align`.
pub fn pad_reflect(input: &Array4<f32>, align: usize) -> Array4<f32> {
    let (n, c, h, w) = input.dim();
    let (pad_h, pad_w) = (pad_amount(h, align), pad_amount(w, align));
    if pad_h == 0 && pad_w == 0 {
        return input.clone();
    }

    Array4::from_shape_fn((n, c, h + pad_h, w + pad_w), |(b, ch, y, x)| {
        input[[b, ch, mirror(y, h), mirror(x, w)]]
    })
}

/// Scale implied by a forward pass, rejecting non-integer or anisotropic ratios.
pub fn infer_scale(in_hw: (usize, usize), out_hw: (usize, usize)) -> Result<usize> {
    let (in_h, in_w) = in_hw;
    let (out_h, out_w) = out_hw;
    if in_h == 0
        || in_w == 0
        || out_h % in_h != 0
        || out_w % in_w != 0
        || out_h / in_h != out_w / in_w
    {
        bail!("model output {out_h}x{out_w} is not an integer multiple of input {in_h}x{in_w}");
    }
    Ok(out_h / in_h)
}

/// One forward pass over the whole (padded) input. Returns the cropped output
/// and the scale it was produced at.
fn run_padded(model: &mut dyn SuperResModel, input: &Array4<f32>) -> Result<(Array4<f32>, usize)> {
    let (_, _, h, w) = input.dim();
    let padded = pad_reflect(input, model.info().pad_align);
    let (_, _, padded_h, padded_w) = padded.dim();

    let output = model
        .forward(&padded)
        .with_context(|| format!("{} forward pass failed", model.info().name))?;
    let (_, _, out_h, out_w) = output.dim();
    let scale = infer_scale((padded_h, padded_w), (out_h, out_w))?;
    if let Some(expected) = model.info().scale {
        if expected != scale {
            bail!("{} produced scale {scale}, expected {expected}", model.info().name);
        }
    }

    if padded_h == h && padded_w == w {
        return Ok((output, scale));
    }
    let cropped = output.slice(s![.., .., ..h * scale, ..w * scale]).to_owned();
    Ok((cropped, scale))
}

fn run_tiled(
    model: &mut dyn SuperResModel,
    input: &Array4<f32>,
    tile_size: usize,
) -> Result<Array4<f32>> {
    let overlap = DEFAULT_TILE_OVERLAP;
    let step = tile_size.saturating_sub(overlap * 2);
    if step == 0 {
        bail!("tile_size ({tile_size}) is too small for overlap ({overlap})");
    }

    let (_, _, h, w) = input.dim();
    debug!(tile_size, overlap, step, h, w, "Starting tiled inference");

    let mut output: Option<Array4<f32>> = None;
    let mut scale = 0;
    for y in (0..h).step_by(step) {
        for x in (0..w).step_by(step) {
            let (in_y0, in_x0) = (y.saturating_sub(overlap), x.saturating_sub(overlap));
            let (in_y1, in_x1) = ((y + step + overlap).min(h), (x + step + overlap).min(w));
            let tile = input.slice(s![.., .., in_y0..in_y1, in_x0..in_x1]).to_owned();

            let (tile_out, tile_scale) = run_padded(model, &tile)?;
            if output.is_none() {
                scale = tile_scale;
                let channels = tile_out.dim().1;
                output = Some(Array4::zeros((1, channels, h * scale, w * scale)));
            } else if tile_scale != scale {
                bail!("tile scale {tile_scale} differs from first tile scale {scale}");
            }
            let out = output.as_mut().context("tile output buffer")?;

            let (core_h, core_w) = ((h - y).min(step), (w - x).min(step));
            let (crop_y, crop_x) = ((y - in_y0) * scale, (x - in_x0) * scale);
            out.slice_mut(s![
                ..,
                ..,
                y * scale..(y + core_h) * scale,
                x * scale..(x + core_w) * scale
            ])
            .assign(&tile_out.slice(s![
                ..,
                ..,
                crop_y..crop_y + core_h * scale,
                crop_x..crop_x + core_w * scale
            ]));
        }
    }

    output.context("tiled inference on an empty image")
}
