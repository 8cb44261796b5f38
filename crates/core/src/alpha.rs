//! Dual-pass inference for transparent images.
//!
//! An RGB model cannot see alpha, so the image is run twice: composited over
//! black and over white. Where the two results agree the pixel is opaque; the
//! gap between them measures transparency.

use anyhow::{bail, Result};
use ndarray::{concatenate, s, Axis, Zip};

use crate::inference::ModelInfo;
use crate::pixels::PixelBuffer;

/// RGBA input through a 3-in/3-out model.
pub fn applies(image: &PixelBuffer, model: &ModelInfo) -> bool {
    image.has_alpha() && model.in_nc == 3 && model.out_nc == 3
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlphaPasses {
    /// `rgb * a`
    pub over_black: PixelBuffer,
    /// `(rgb - 1) * a + 1`
    pub over_white: PixelBuffer,
}

pub fn premultiply(image: &PixelBuffer) -> Result<AlphaPasses> {
    if !image.has_alpha() {
        bail!("premultiplied passes need an RGBA image, got {} channels", image.channels());
    }
    let data = image.data();
    let rgb = data.slice(s![.., .., ..3]);
    let alpha = data.slice(s![.., .., 3..4]);

    let over_black = &rgb * &alpha;
    let over_white = (&rgb - 1.0) * &alpha + 1.0;

    Ok(AlphaPasses {
        over_black: PixelBuffer::new(over_black)?,
        over_white: PixelBuffer::new(over_white)?,
    })
}

/// Rebuilds RGBA from the two upscaled passes:
/// `alpha = 1 - mean_c(white - black)`, color taken from the black pass.
pub fn reassemble(over_black: &PixelBuffer, over_white: &PixelBuffer) -> Result<PixelBuffer> {
    let (black, white) = (over_black.data(), over_white.data());
    if black.dim() != white.dim() {
        bail!(
            "alpha passes disagree in shape: {:?} vs {:?}",
            black.dim(),
            white.dim()
        );
    }

    let channels = black.dim().2 as f32;
    let mut alpha = (white - black).sum_axis(Axis(2)).insert_axis(Axis(2));
    alpha.mapv_inplace(|gap| 1.0 - gap / channels);

    let mut rgba = concatenate(Axis(2), &[black.view(), alpha.view()])?;
    Zip::from(&mut rgba).for_each(|v| *v = v.clamp(0.0, 1.0));
    PixelBuffer::new(rgba)
}
