//! RRDBNet (ESRGAN) in the `model.N` sequential layout, plus the renaming
//! that maps Real-ESRGAN's named layers onto it.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::Conv2d;

use super::blocks::{conv, count_rrdb_blocks, lrelu, upsample2x, Rrdb};
use crate::checkpoint::StateDict;
use crate::inference::ModelInfo;

pub const LEGACY_SIGNATURE: &str = "model.1.sub.0.RDB1.conv1.0.weight";
pub const REAL_ESRGAN_SIGNATURE: [&str; 2] = ["conv_first.weight", "body.0.rdb1.conv1.weight"];

const TRUNK_PREFIX: &str = "model.1.sub.";

#[derive(Debug, Clone)]
pub struct RrdbNet {
    first: Conv2d,
    trunk: Vec<Rrdb>,
    trunk_conv: Conv2d,
    upconvs: Vec<Conv2d>,
    hr_conv: Conv2d,
    last: Conv2d,
    unshuffle: usize,
    info: ModelInfo,
}

impl RrdbNet {
    /// Builds from `model.N` keys. `unshuffle > 1` means the first conv sees
    /// pixel-unshuffled input, which shrinks the effective scale by that factor.
    pub fn load(weights: &StateDict, name: &str, unshuffle: usize) -> Result<Self> {
        let nb = count_rrdb_blocks(weights, TRUNK_PREFIX);
        if nb == 0 {
            bail!("RRDB checkpoint has no trunk blocks");
        }

        let last_index = weights
            .indices("model.", ".weight")
            .last()
            .copied()
            .context("RRDB checkpoint has no top-level convolutions")?;
        if last_index < 4 || (last_index - 4) % 3 != 0 {
            bail!("unexpected RRDB layout: last convolution at model.{last_index}");
        }
        let n_up = (last_index - 4) / 3;

        let first_in = weights.dim("model.0.weight", 1)?;
        let factor = unshuffle * unshuffle;
        if first_in % factor != 0 {
            bail!("first convolution takes {first_in} channels, not divisible by {factor}");
        }
        let upscale = 1usize << n_up;
        if upscale % unshuffle != 0 {
            bail!("x{upscale} upsampler cannot undo a {unshuffle}x pixel unshuffle");
        }

        let info = ModelInfo {
            name: name.to_string(),
            in_nc: first_in / factor,
            out_nc: weights.dim(&format!("model.{last_index}.weight"), 0)?,
            scale: Some(upscale / unshuffle),
            pad_align: unshuffle,
            num_feat: Some(weights.dim("model.0.weight", 0)?),
            num_blocks: Some(nb),
        };

        Ok(Self {
            first: conv(weights, "model.0")?,
            trunk: (0..nb)
                .map(|i| Rrdb::load(weights, &format!("{TRUNK_PREFIX}{i}")))
                .collect::<Result<_>>()?,
            trunk_conv: conv(weights, &format!("{TRUNK_PREFIX}{nb}"))?,
            upconvs: (1..=n_up)
                .map(|k| conv(weights, &format!("model.{}", 3 * k)))
                .collect::<Result<_>>()?,
            hr_conv: conv(weights, &format!("model.{}", 3 * n_up + 2))?,
            last: conv(weights, &format!("model.{last_index}"))?,
            unshuffle,
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl Module for RrdbNet {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = if self.unshuffle > 1 {
            candle_nn::ops::pixel_unshuffle(x, self.unshuffle)?
        } else {
            x.clone()
        };

        let fea = self.first.forward(&x)?;
        let mut trunk = fea.clone();
        for block in &self.trunk {
            trunk = block.forward(&trunk)?;
        }
        let mut out = fea.add(&self.trunk_conv.forward(&trunk)?)?;

        for upconv in &self.upconvs {
            out = lrelu(&upconv.forward(&upsample2x(&out)?)?)?;
        }
        let out = lrelu(&self.hr_conv.forward(&out)?)?;
        self.last.forward(&out)
    }
}

/// Pixel-unshuffle factor implied by the first convolution's input width:
/// Real-ESRGAN x2 models take 12 channels, x1 models 48.
pub fn unshuffle_factor(first_in: usize) -> usize {
    match first_in {
        12 => 2,
        48 => 4,
        _ => 1,
    }
}

/// Renames Real-ESRGAN keys (`conv_first`, `body.N.rdbJ.convK`, `conv_body`,
/// `conv_upK`, `conv_hr`, `conv_last`) to the `model.N` layout. Unknown keys
/// are dropped.
pub fn real_esrgan_to_legacy(weights: StateDict) -> Result<StateDict> {
    let nb = weights
        .indices("body.", ".rdb1.conv1.weight")
        .last()
        .map(|last| last + 1)
        .context("Real-ESRGAN checkpoint has no body blocks")?;
    let n_up = weights.indices("conv_up", ".weight").len();

    Ok(weights.rename_keys(|key| {
        let (layer, param) = key.rsplit_once('.')?;
        let target = match layer {
            "conv_first" => "model.0".to_string(),
            "conv_body" => format!("{TRUNK_PREFIX}{nb}"),
            "conv_hr" => format!("model.{}", 3 * n_up + 2),
            "conv_last" => format!("model.{}", 3 * n_up + 4),
            _ => {
                if let Some(k) = layer.strip_prefix("conv_up") {
                    format!("model.{}", 3 * k.parse::<usize>().ok()?)
                } else {
                    let parts: Vec<&str> = layer.split('.').collect();
                    match parts.as_slice() {
                        ["body", block, rdb, conv] => {
                            let rdb = rdb.strip_prefix("rdb")?;
                            format!("{TRUNK_PREFIX}{block}.RDB{rdb}.{conv}.0")
                        }
                        _ => return None,
                    }
                }
            }
        };
        Some(format!("{target}.{param}"))
    }))
}
