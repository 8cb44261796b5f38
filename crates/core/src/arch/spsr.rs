//! SPSR: an RRDB super-resolution branch guided by a gradient branch that
//! sees the input's gradient magnitude and taps the trunk every five blocks.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::Conv2d;

use super::blocks::{conv, count_rrdb_blocks, lrelu, upsample2x, Rrdb};
use crate::checkpoint::StateDict;
use crate::inference::ModelInfo;

pub const SIGNATURE: &str = "f_HR_conv1.0.weight";

const TRUNK_PREFIX: &str = "model.1.sub.";
/// Trunk block count after which a feature map is handed to the gradient branch.
const TAP_EVERY: usize = 5;
const TAPS: usize = 4;

const GRAD_KERNEL_V: [f32; 9] = [0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
const GRAD_KERNEL_H: [f32; 9] = [0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0];

#[derive(Debug, Clone)]
struct Upsampler {
    upconvs: Vec<Conv2d>,
    hr_conv0: Conv2d,
    hr_conv1: Conv2d,
}

impl Upsampler {
    /// nearest x2 + conv + lrelu per stage, conv + lrelu, then a plain conv.
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = x.clone();
        for upconv in &self.upconvs {
            out = lrelu(&upconv.forward(&upsample2x(&out)?)?)?;
        }
        let out = lrelu(&self.hr_conv0.forward(&out)?)?;
        self.hr_conv1.forward(&out)
    }
}

#[derive(Debug, Clone)]
pub struct SpsrNet {
    fea_conv: Conv2d,
    trunk: Vec<Rrdb>,
    trunk_conv: Conv2d,
    sr_up: Upsampler,
    b_fea_conv: Conv2d,
    b_stages: Vec<(Rrdb, Conv2d)>,
    b_lr_conv: Conv2d,
    b_up: Upsampler,
    f_block: Rrdb,
    f_concat: Conv2d,
    f_hr_conv0: Conv2d,
    f_hr_conv1: Conv2d,
    info: ModelInfo,
}

impl SpsrNet {
    pub fn load(weights: &StateDict) -> Result<Self> {
        let nb = count_rrdb_blocks(weights, TRUNK_PREFIX);
        if nb < TAP_EVERY * TAPS {
            bail!("SPSR needs at least {} trunk blocks, found {nb}", TAP_EVERY * TAPS);
        }

        let last_index = weights
            .indices("model.", ".weight")
            .last()
            .copied()
            .context("SPSR checkpoint has no top-level convolutions")?;
        if last_index < 2 || (last_index - 2) % 3 != 0 {
            bail!("unexpected SPSR layout: last convolution at model.{last_index}");
        }
        let n_up = (last_index - 2) / 3;

        let info = ModelInfo {
            name: "SPSR".to_string(),
            in_nc: weights.dim("model.0.weight", 1)?,
            out_nc: weights.dim("f_HR_conv1.0.bias", 0)?,
            scale: Some(1 << n_up),
            pad_align: 1,
            num_feat: Some(weights.dim("model.0.weight", 0)?),
            num_blocks: Some(nb),
        };

        let sr_up = Upsampler {
            upconvs: (1..=n_up)
                .map(|k| conv(weights, &format!("model.{}", 3 * k)))
                .collect::<Result<_>>()?,
            hr_conv0: conv(weights, &format!("model.{last_index}"))?,
            hr_conv1: conv(weights, "HR_conv1_new.0")?,
        };
        let b_up = Upsampler {
            upconvs: (1..=n_up)
                .map(|k| conv(weights, &format!("b_module.{}", 3 * k - 2)))
                .collect::<Result<_>>()?,
            hr_conv0: conv(weights, &format!("b_module.{}", 3 * n_up))?,
            hr_conv1: conv(weights, &format!("b_module.{}", 3 * n_up + 2))?,
        };
        let b_stages = (1..=TAPS)
            .map(|k| {
                Ok((
                    Rrdb::load(weights, &format!("b_block_{k}"))?,
                    conv(weights, &format!("b_concat_{k}.0"))?,
                ))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            fea_conv: conv(weights, "model.0")?,
            trunk: (0..nb)
                .map(|i| Rrdb::load(weights, &format!("{TRUNK_PREFIX}{i}")))
                .collect::<Result<_>>()?,
            trunk_conv: conv(weights, &format!("{TRUNK_PREFIX}{nb}"))?,
            sr_up,
            b_fea_conv: conv(weights, "b_fea_conv.0")?,
            b_stages,
            b_lr_conv: conv(weights, "b_LR_conv.0")?,
            b_up,
            f_block: Rrdb::load(weights, "f_block")?,
            f_concat: conv(weights, "f_concat.0")?,
            f_hr_conv0: conv(weights, "f_HR_conv0.0")?,
            f_hr_conv1: conv(weights, "f_HR_conv1.0")?,
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

/// Per-channel gradient magnitude `sqrt(v^2 + h^2 + 1e-6)` with central
/// differences, zero padded.
pub fn gradient_magnitude(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, channels, _, _) = x.dims4()?;
    let kernel = |taps: &[f32; 9]| {
        Tensor::from_vec(taps.repeat(channels), (channels, 1, 3, 3), x.device())
    };
    let v = x.conv2d(&kernel(&GRAD_KERNEL_V)?, 1, 1, 1, channels)?;
    let h = x.conv2d(&kernel(&GRAD_KERNEL_H)?, 1, 1, 1, channels)?;
    v.sqr()?.add(&h.sqr()?)?.affine(1.0, 1e-6)?.sqrt()
}

impl Module for SpsrNet {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let grad = gradient_magnitude(x)?;

        let fea = self.fea_conv.forward(x)?;
        let mut trunk = fea.clone();
        let mut taps = Vec::with_capacity(TAPS);
        for (index, block) in self.trunk.iter().enumerate() {
            trunk = block.forward(&trunk)?;
            if (index + 1) % TAP_EVERY == 0 && taps.len() < TAPS {
                taps.push(trunk.clone());
            }
        }
        let sr = fea.add(&self.trunk_conv.forward(&trunk)?)?;
        let sr = self.sr_up.forward(&sr)?;

        let b_fea = self.b_fea_conv.forward(&grad)?;
        let mut branch = b_fea.clone();
        for ((block, concat), tap) in self.b_stages.iter().zip(&taps) {
            branch = concat.forward(&block.forward(&Tensor::cat(&[&branch, tap], 1)?)?)?;
        }
        let branch = self.b_lr_conv.forward(&branch)?.add(&b_fea)?;
        let branch = self.b_up.forward(&branch)?;

        let fused = self.f_block.forward(&Tensor::cat(&[&branch, &sr], 1)?)?;
        let out = self.f_concat.forward(&fused)?;
        let out = lrelu(&self.f_hr_conv0.forward(&out)?)?;
        self.f_hr_conv1.forward(&out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device};

    use super::*;
    use crate::arch::blocks::tests::{insert_conv, insert_rrdb};

    pub(crate) fn spsr_tensors(
        in_nc: usize,
        out_nc: usize,
        nf: usize,
        nb: usize,
        n_up: usize,
    ) -> HashMap<String, Tensor> {
        let gc = 2;
        let mut t = HashMap::new();
        insert_conv(&mut t, "model.0", in_nc, nf, 3, 0.0);
        for i in 0..nb {
            insert_rrdb(&mut t, &format!("model.1.sub.{i}"), nf, gc);
        }
        insert_conv(&mut t, &format!("model.1.sub.{nb}"), nf, nf, 3, 0.0);
        for k in 1..=n_up {
            insert_conv(&mut t, &format!("model.{}", 3 * k), nf, nf, 3, 0.0);
            insert_conv(&mut t, &format!("b_module.{}", 3 * k - 2), nf, nf, 3, 0.0);
        }
        insert_conv(&mut t, &format!("model.{}", 3 * n_up + 2), nf, nf, 3, 0.0);
        insert_conv(&mut t, "HR_conv1_new.0", nf, nf, 3, 0.0);
        insert_conv(&mut t, "b_fea_conv.0", in_nc, nf, 3, 0.0);
        for k in 1..=4 {
            insert_rrdb(&mut t, &format!("b_block_{k}"), 2 * nf, gc);
            insert_conv(&mut t, &format!("b_concat_{k}.0"), 2 * nf, nf, 3, 0.0);
        }
        insert_conv(&mut t, "b_LR_conv.0", nf, nf, 3, 0.0);
        insert_conv(&mut t, &format!("b_module.{}", 3 * n_up), nf, nf, 3, 0.0);
        insert_conv(&mut t, &format!("b_module.{}", 3 * n_up + 2), nf, nf, 3, 0.0);
        insert_rrdb(&mut t, "f_block", 2 * nf, gc);
        insert_conv(&mut t, "f_concat.0", 2 * nf, nf, 3, 0.0);
        insert_conv(&mut t, "f_HR_conv0.0", nf, nf, 3, 0.0);
        insert_conv(&mut t, "f_HR_conv1.0", nf, out_nc, 3, 0.0);
        t
    }

    #[test]
    fn reads_shape_parameters_and_runs() {
        let weights = StateDict::new(spsr_tensors(3, 3, 4, 20, 2));
        let net = SpsrNet::load(&weights).expect("load");
        let info = net.info();
        assert_eq!((info.in_nc, info.out_nc, info.scale), (3, 3, Some(4)));
        assert_eq!(info.num_blocks, Some(20));

        let x = Tensor::zeros((1, 3, 3, 5), DType::F32, &Device::Cpu).expect("input");
        assert_eq!(net.forward(&x).expect("forward").dims(), &[1, 3, 12, 20]);
    }

    #[test]
    fn too_few_trunk_blocks_are_rejected() {
        let weights = StateDict::new(spsr_tensors(3, 3, 4, 19, 1));
        let error = SpsrNet::load(&weights).expect_err("too shallow");
        assert!(error.to_string().contains("at least 20"));
    }

    #[test]
    fn gradient_of_flat_image_is_epsilon_floor_inside() {
        let x = Tensor::ones((1, 2, 4, 4), DType::F32, &Device::Cpu).expect("input");
        let g = gradient_magnitude(&x).expect("gradient");
        assert_eq!(g.dims(), &[1, 2, 4, 4]);
        let centre: f32 = g
            .get(0)
            .and_then(|t| t.get(1))
            .and_then(|t| t.get(1))
            .and_then(|t| t.get(1))
            .and_then(|t| t.to_scalar())
            .expect("centre");
        assert!((centre - 1e-3).abs() < 1e-4);
    }

    #[test]
    fn gradient_picks_up_vertical_ramp() {
        let x = Tensor::arange(0f32, 4.0, &Device::Cpu)
            .and_then(|t| t.reshape((1, 1, 4, 1)))
            .and_then(|t| t.broadcast_as((1, 1, 4, 4)))
            .and_then(|t| t.contiguous())
            .expect("ramp");
        let g = gradient_magnitude(&x).expect("gradient");
        let value: f32 = g
            .get(0)
            .and_then(|t| t.get(0))
            .and_then(|t| t.get(1))
            .and_then(|t| t.get(1))
            .and_then(|t| t.to_scalar())
            .expect("value");
        assert!((value - 2.0).abs() < 1e-3);
    }
}
