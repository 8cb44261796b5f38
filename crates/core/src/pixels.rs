//! Normalized float image buffers and channel adaptation.

use anyhow::{bail, Result};
use ndarray::{concatenate, s, Array3, Axis};

/// `height x width x channels` image with samples in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    data: Array3<f32>,
}

impl PixelBuffer {
    pub fn new(data: Array3<f32>) -> Result<Self> {
        let (height, width, channels) = data.dim();
        if height == 0 || width == 0 {
            bail!("image buffer is empty ({width}x{height})");
        }
        if !(1..=4).contains(&channels) {
            bail!("unsupported channel count {channels}");
        }
        Ok(Self { data })
    }

    /// Builds a buffer from interleaved samples, dividing each by `max_value`.
    pub fn from_interleaved(
        width: usize,
        height: usize,
        channels: usize,
        samples: Vec<f32>,
        max_value: f32,
    ) -> Result<Self> {
        let expected = width * height * channels;
        if samples.len() != expected {
            bail!(
                "expected {expected} samples for {width}x{height}x{channels}, got {}",
                samples.len()
            );
        }
        let mut data = Array3::from_shape_vec((height, width, channels), samples)?;
        if max_value != 1.0 {
            data.mapv_inplace(|v| v / max_value);
        }
        Self::new(data)
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn channels(&self) -> usize {
        self.data.dim().2
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn has_alpha(&self) -> bool {
        self.channels() == 4
    }

    /// Interleaved 8-bit samples, `round(v * 255)` after clamping.
    pub fn to_u8_samples(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect()
    }

    fn first_channels(&self, count: usize) -> Self {
        Self {
            data: self.data.slice(s![.., .., ..count]).to_owned(),
        }
    }

    fn replicate_gray(&self, count: usize) -> Result<Self> {
        let plane = self.data.slice(s![.., .., 0..1]);
        let planes = vec![plane; count];
        Ok(Self {
            data: concatenate(Axis(2), &planes)?,
        })
    }

    fn with_opaque_alpha(&self) -> Result<Self> {
        let (height, width, _) = self.data.dim();
        let alpha = Array3::<f32>::ones((height, width, 1));
        Ok(Self {
            data: concatenate(Axis(2), &[self.data.view(), alpha.view()])?,
        })
    }
}

/// Reshapes the channel layout to what a model with `in_nc` inputs expects.
///
/// Gray is replicated up to `min(in_nc, 3)` planes, surplus planes are cut,
/// and RGB fed to an RGBA model gains an opaque alpha plane.
pub fn adapt_channels(image: PixelBuffer, in_nc: usize) -> Result<PixelBuffer> {
    let mut adapted = image;
    if adapted.channels() == 1 && in_nc > 1 {
        adapted = adapted.replicate_gray(in_nc.min(3))?;
    }

    if adapted.channels() > in_nc {
        adapted = adapted.first_channels(in_nc);
    } else if adapted.channels() == 3 && in_nc == 4 {
        adapted = adapted.with_opaque_alpha()?;
    }

    if adapted.channels() != in_nc {
        bail!(
            "cannot adapt a {}-channel image to a model expecting {in_nc} channels",
            adapted.channels()
        );
    }
    Ok(adapted)
}
