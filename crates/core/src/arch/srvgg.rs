//! SRVGGNetCompact: a plain conv stack ending in a pixel shuffle, added to a
//! nearest-upsampled copy of the input.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::Conv2d;

use super::blocks::conv;
use crate::checkpoint::StateDict;
use crate::inference::ModelInfo;

pub const SIGNATURE: &str = "body.0.weight";

#[derive(Debug, Clone)]
enum Activation {
    Relu,
    /// Per-channel slopes shaped `(1, C, 1, 1)`.
    Prelu(Tensor),
}

impl Activation {
    fn load(weights: &StateDict, index: usize) -> Result<Self> {
        let key = format!("body.{index}.weight");
        if !weights.contains(&key) {
            return Ok(Self::Relu);
        }
        let slopes = weights.get(&key)?;
        let count = slopes.elem_count();
        Ok(Self::Prelu(slopes.reshape((1, count, 1, 1))?))
    }

    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Prelu(slopes) => {
                let positive = x.relu()?;
                let negative = x.sub(&positive)?;
                positive.add(&negative.broadcast_mul(slopes)?)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SrvggCompact {
    body: Vec<(Conv2d, Activation)>,
    last: Conv2d,
    scale: usize,
    info: ModelInfo,
}

impl SrvggCompact {
    /// `body.{2i}` are convolutions, `body.{2i+1}` their activations; the
    /// highest-numbered entry is the final convolution.
    pub fn load(weights: &StateDict) -> Result<Self> {
        let conv_indices: Vec<usize> = weights
            .indices("body.", ".weight")
            .into_iter()
            .filter(|i| {
                weights
                    .dims(&format!("body.{i}.weight"))
                    .is_ok_and(|dims| dims.len() == 4)
            })
            .collect();
        let last_index = *conv_indices
            .last()
            .context("compact checkpoint has no body convolutions")?;
        if last_index < 2 || last_index % 2 != 0 {
            bail!("unexpected compact layout: last convolution at body.{last_index}");
        }
        let num_conv = (last_index - 2) / 2;

        let in_nc = weights.dim("body.0.weight", 1)?;
        let num_feat = weights.dim("body.0.weight", 0)?;
        let out_nc = in_nc;
        let shuffle_channels = weights.dim(&format!("body.{last_index}.weight"), 0)?;
        let scale = integer_sqrt(shuffle_channels / out_nc)
            .filter(|s| s * s * out_nc == shuffle_channels)
            .with_context(|| {
                format!("last convolution has {shuffle_channels} outputs, not {out_nc} x scale^2")
            })?;

        let body = (0..=num_conv)
            .map(|i| {
                Ok((
                    conv(weights, &format!("body.{}", 2 * i))?,
                    Activation::load(weights, 2 * i + 1)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            body,
            last: conv(weights, &format!("body.{last_index}"))?,
            scale,
            info: ModelInfo {
                name: "SRVGG (Compact)".to_string(),
                in_nc,
                out_nc,
                scale: Some(scale),
                pad_align: 1,
                num_feat: Some(num_feat),
                num_blocks: Some(num_conv),
            },
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl Module for SrvggCompact {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = x.clone();
        for (conv, act) in &self.body {
            out = act.apply(&conv.forward(&out)?)?;
        }
        let out = candle_nn::ops::pixel_shuffle(&self.last.forward(&out)?, self.scale)?;

        let (_, _, h, w) = x.dims4()?;
        let base = x.upsample_nearest2d(h * self.scale, w * self.scale)?;
        out.add(&base)
    }
}

fn integer_sqrt(n: usize) -> Option<usize> {
    (1..=n).take_while(|s| s * s <= n).last()
}
