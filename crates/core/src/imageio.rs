//! Decoding, resizing and encoding images at the pipeline edges.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage};
use tracing::debug;

use crate::pixels::PixelBuffer;

/// Decodes any supported format, sniffing the content rather than trusting
/// the extension.
pub fn decode(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read image header: {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "Image decoded"
    );
    Ok(image)
}

/// Size with the longer side set to `size` and the other scaled to keep the
/// aspect ratio (truncated, at least 1).
pub fn longest_side_dims(width: u32, height: u32, size: u32) -> (u32, u32) {
    let scaled = |side: u32, long: u32| {
        ((u64::from(side) * u64::from(size)) / u64::from(long)).max(1) as u32
    };
    if width < height {
        (scaled(width, height), size)
    } else {
        (size, scaled(height, width))
    }
}

/// Resizes so the longer side equals `size`, shrinking or enlarging.
pub fn resize_longest_side(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = longest_side_dims(image.width(), image.height(), size);
    if (width, height) == (image.width(), image.height()) {
        return image.clone();
    }
    debug!(from = ?(image.width(), image.height()), to = ?(width, height), "Resizing input");
    if width <= image.width() && height <= image.height() {
        image.thumbnail_exact(width, height)
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Bounding-box fit that only ever shrinks. The free side is rounded to
/// whichever neighbouring integer keeps the aspect ratio closest. `None`
/// when the image already fits.
pub fn thumbnail_dims(width: u32, height: u32, bound: u32) -> Option<(u32, u32)> {
    if width <= bound && height <= bound {
        return None;
    }
    let aspect = f64::from(width) / f64::from(height);
    let bound_f = f64::from(bound);
    let closest = |exact: f64, error: &dyn Fn(f64) -> f64| {
        let (lo, hi) = (exact.floor(), exact.ceil());
        let pick = if error(hi) < error(lo) { hi } else { lo };
        (pick as u32).max(1)
    };

    if aspect <= 1.0 {
        let w = closest(bound_f * aspect, &|n| (aspect - n / bound_f).abs());
        Some((w, bound))
    } else {
        let h = closest(bound_f / aspect, &|n| {
            if n == 0.0 {
                0.0
            } else {
                (aspect - bound_f / n).abs()
            }
        });
        Some((bound, h))
    }
}

/// Shrinks to fit within `bound x bound`, leaving smaller images alone.
pub fn thumbnail_within(image: &DynamicImage, bound: u32) -> DynamicImage {
    match thumbnail_dims(image.width(), image.height(), bound) {
        Some((width, height)) => {
            debug!(
                from = ?(image.width(), image.height()),
                to = ?(width, height),
                "Thumbnailing input"
            );
            image.resize_exact(width, height, FilterType::CatmullRom)
        }
        None => image.clone(),
    }
}

/// Keeps the source layout: gray stays one channel, anything with alpha
/// (gray+alpha included) becomes RGBA, color becomes RGB. Samples are
/// normalized by the source's native maximum.
pub fn to_pixel_buffer(image: &DynamicImage) -> Result<PixelBuffer> {
    let color = image.color();
    let (width, height) = (image.width() as usize, image.height() as usize);
    let (channels, samples) = match (color.has_color(), color.has_alpha()) {
        (_, true) => (4, image.to_rgba32f().into_raw()),
        (true, false) => (3, image.to_rgb32f().into_raw()),
        (false, false) => (1, image.to_luma32f().into_raw()),
    };
    PixelBuffer::from_interleaved(width, height, channels, samples, 1.0)
}

/// Three-channel view with any alpha discarded.
pub fn to_rgb_buffer(image: &DynamicImage) -> Result<PixelBuffer> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    PixelBuffer::from_interleaved(width, height, 3, image.to_rgb32f().into_raw(), 1.0)
}

/// Writes 8-bit samples in the format implied by the extension. Formats
/// that cannot carry alpha get the color planes only.
pub fn encode(buffer: &PixelBuffer, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("cannot tell output format from: {}", path.display()))?;
    let (width, height) = (buffer.width() as u32, buffer.height() as u32);
    let samples = buffer.to_u8_samples();

    let image = match buffer.channels() {
        1 => GrayImage::from_raw(width, height, samples).map(DynamicImage::ImageLuma8),
        2 => GrayAlphaImage::from_raw(width, height, samples).map(DynamicImage::ImageLumaA8),
        3 => RgbImage::from_raw(width, height, samples).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, samples).map(DynamicImage::ImageRgba8),
        other => bail!("cannot encode a {other}-channel image"),
    }
    .context("sample count does not match image size")?;

    let image = if format == ImageFormat::Jpeg && image.color().has_alpha() {
        debug!("Dropping alpha for JPEG output");
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    image
        .save_with_format(path, format)
        .with_context(|| format!("failed to write image: {}", path.display()))?;
    debug!(path = %path.display(), width, height, ?format, "Image written");
    Ok(())
}
