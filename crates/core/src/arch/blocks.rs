//! Layers shared by the RRDB-family networks.

use anyhow::{bail, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig};

use crate::checkpoint::StateDict;

pub const LRELU_SLOPE: f64 = 0.2;
const RESIDUAL_SCALE: f64 = 0.2;

/// Convolution from `{prefix}.weight` / `{prefix}.bias`, padded to keep the
/// spatial size. The CPU kernel reads raw storage, so both are made contiguous.
pub fn conv(weights: &StateDict, prefix: &str) -> Result<Conv2d> {
    let weight = weights.get(&format!("{prefix}.weight"))?.contiguous()?;
    let dims = weight.dims();
    if dims.len() != 4 || dims[2] != dims[3] || dims[2] % 2 == 0 {
        bail!("'{prefix}.weight' is not an odd square conv kernel: {dims:?}");
    }
    let padding = dims[2] / 2;
    let bias_key = format!("{prefix}.bias");
    let bias = if weights.contains(&bias_key) {
        Some(weights.get(&bias_key)?.contiguous()?)
    } else {
        None
    };
    Ok(Conv2d::new(
        weight,
        bias,
        Conv2dConfig {
            padding,
            ..Default::default()
        },
    ))
}

pub fn lrelu(x: &Tensor) -> candle_core::Result<Tensor> {
    x.maximum(&x.affine(LRELU_SLOPE, 0.0)?)
}

pub fn upsample2x(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    x.upsample_nearest2d(h * 2, w * 2)
}

/// Five densely connected convolutions with a scaled residual.
#[derive(Debug, Clone)]
pub struct ResidualDenseBlock {
    hidden: Vec<Conv2d>,
    last: Conv2d,
}

impl ResidualDenseBlock {
    /// Expects `{prefix}.conv{1..5}.0.{weight,bias}`.
    pub fn load(weights: &StateDict, prefix: &str) -> Result<Self> {
        let hidden = (1..=4)
            .map(|k| conv(weights, &format!("{prefix}.conv{k}.0")))
            .collect::<Result<Vec<_>>>()?;
        let last = conv(weights, &format!("{prefix}.conv5.0"))?;
        Ok(Self { hidden, last })
    }
}

impl Module for ResidualDenseBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut features = vec![x.clone()];
        for conv in &self.hidden {
            let out = lrelu(&conv.forward(&Tensor::cat(&features, 1)?)?)?;
            features.push(out);
        }
        let out = self.last.forward(&Tensor::cat(&features, 1)?)?;
        out.affine(RESIDUAL_SCALE, 0.0)?.add(x)
    }
}

/// Residual-in-residual dense block: three dense blocks and a scaled residual.
#[derive(Debug, Clone)]
pub struct Rrdb {
    blocks: [ResidualDenseBlock; 3],
}

impl Rrdb {
    /// Expects `{prefix}.RDB{1..3}.conv{1..5}.0.*`.
    pub fn load(weights: &StateDict, prefix: &str) -> Result<Self> {
        Ok(Self {
            blocks: [
                ResidualDenseBlock::load(weights, &format!("{prefix}.RDB1"))?,
                ResidualDenseBlock::load(weights, &format!("{prefix}.RDB2"))?,
                ResidualDenseBlock::load(weights, &format!("{prefix}.RDB3"))?,
            ],
        })
    }
}

impl Module for Rrdb {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = x.clone();
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        out.affine(RESIDUAL_SCALE, 0.0)?.add(x)
    }
}

/// Number of RRDB blocks under `{prefix}{i}.RDB1.conv1.0.weight`.
pub fn count_rrdb_blocks(weights: &StateDict, prefix: &str) -> usize {
    weights
        .indices(prefix, ".RDB1.conv1.0.weight")
        .last()
        .map_or(0, |last| last + 1)
}
