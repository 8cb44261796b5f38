//! The upscale run: decode, pick a model, infer, write.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::alpha;
use crate::arch::{detect, Architecture, CheckpointModel};
use crate::backend::InferenceBackend;
use crate::checkpoint::{Checkpoint, CheckpointFormat};
use crate::config::InferenceConfig;
use crate::device::{device_label, select_device, DevicePreference};
use crate::imageio;
use crate::inference::{infer, ModelInfo, SuperResModel};
use crate::onnx::OnnxModel;
use crate::pixels::{adapt_channels, PixelBuffer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: PathBuf,
    /// Optional pre-downscale target for the longer side.
    pub downscale: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleOptions {
    pub device: DevicePreference,
    pub onnx_backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
    pub tile_size: usize,
}

impl UpscaleOptions {
    pub fn from_config(config: &InferenceConfig, data_dir: Option<&Path>) -> Self {
        Self {
            device: config.device,
            onnx_backend: config.onnx_backend,
            trt_cache_dir: config.resolved_trt_cache_dir(data_dir),
            tile_size: config.tile_size,
        }
    }
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self::from_config(&InferenceConfig::default(), None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpscaleSummary {
    /// `None` for the generic loader.
    pub architecture: Option<Architecture>,
    pub model: ModelInfo,
    /// `(width, height)` fed to the network, after any downscale.
    pub input_size: (usize, usize),
    pub output_size: (usize, usize),
    pub alpha_passes: bool,
}

pub fn upscale(request: &UpscaleRequest, options: &UpscaleOptions) -> Result<UpscaleSummary> {
    if request.downscale == Some(0) {
        bail!("downscale size must be at least 1");
    }
    let started = Instant::now();
    let image = imageio::decode(&request.input)?;

    let summary = if CheckpointFormat::from_path(&request.model) == CheckpointFormat::Onnx {
        upscale_generic(request, options, &image)?
    } else {
        upscale_known(request, options, &image)?
    };

    info!(
        output = %request.output.display(),
        width = summary.output_size.0,
        height = summary.output_size.1,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upscale finished"
    );
    Ok(summary)
}

fn upscale_known(
    request: &UpscaleRequest,
    options: &UpscaleOptions,
    image: &image::DynamicImage,
) -> Result<UpscaleSummary> {
    let device = select_device(options.device);
    let checkpoint = Checkpoint::load(&request.model, &device)?;
    let Some(architecture) = detect(&checkpoint) else {
        bail!(
            "unsupported checkpoint {}: no known architecture matches its {} tensors \
             (generic models must be ONNX graphs)",
            request.model.display(),
            checkpoint.weights().len()
        );
    };
    info!(architecture = %architecture, device = device_label(&device), "Architecture detected");

    let mut model = CheckpointModel::load(architecture, checkpoint, &device)?;
    let image = match request.downscale {
        Some(size) => imageio::resize_longest_side(image, size),
        None => image.clone(),
    };
    let buffer = imageio::to_pixel_buffer(&image)?;
    let input_size = (buffer.width(), buffer.height());

    let (output, alpha_passes) = run_model(&mut model, buffer, options.tile_size)?;
    imageio::encode(&output, &request.output)?;

    Ok(UpscaleSummary {
        architecture: Some(architecture),
        model: model.info().clone(),
        input_size,
        output_size: (output.width(), output.height()),
        alpha_passes,
    })
}

fn upscale_generic(
    request: &UpscaleRequest,
    options: &UpscaleOptions,
    image: &image::DynamicImage,
) -> Result<UpscaleSummary> {
    let backend = options.onnx_backend.for_device(options.device);
    let mut model = OnnxModel::load(&request.model, backend, &options.trt_cache_dir)?;

    let image = match request.downscale {
        Some(bound) => imageio::thumbnail_within(image, bound),
        None => image.clone(),
    };
    let buffer = adapt_channels(imageio::to_rgb_buffer(&image)?, model.info().in_nc)?;
    let input_size = (buffer.width(), buffer.height());

    let started = Instant::now();
    let output = infer(&mut model, &buffer, options.tile_size)?;
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Generic inference done");
    imageio::encode(&output, &request.output)?;

    Ok(UpscaleSummary {
        architecture: None,
        model: model.info().clone(),
        input_size,
        output_size: (output.width(), output.height()),
        alpha_passes: false,
    })
}

/// Runs `image` through `model`: two premultiplied passes for RGBA on an
/// RGB model, one pass after channel adaptation otherwise. The flag reports
/// which path was taken.
pub fn run_model(
    model: &mut dyn SuperResModel,
    image: PixelBuffer,
    tile_size: usize,
) -> Result<(PixelBuffer, bool)> {
    let started = Instant::now();
    let result = if alpha::applies(&image, model.info()) {
        let passes = alpha::premultiply(&image)?;
        let over_black = infer(model, &passes.over_black, tile_size)?;
        let over_white = infer(model, &passes.over_white, tile_size)?;
        (alpha::reassemble(&over_black, &over_white)?, true)
    } else {
        let adapted = adapt_channels(image, model.info().in_nc)?;
        (infer(model, &adapted, tile_size)?, false)
    };
    debug!(
        alpha_passes = result.1,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Inference done"
    );
    Ok(result)
}
