//! Known checkpoint architectures and the key sniffing that tells them apart.

pub mod blocks;
pub mod rrdb;
pub mod spsr;
pub mod srvgg;

use std::fmt;

use anyhow::{Context, Result};
use candle_core::{Device, Module, Tensor};
use ndarray::Array4;
use serde::Serialize;
use tracing::info;

use crate::checkpoint::{Checkpoint, StateDict};
use crate::inference::{ModelInfo, SuperResModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    SrvggCompact,
    Spsr,
    /// ESRGAN `model.N` layout.
    Rrdb,
    /// Real-ESRGAN named layout, renamed to [`Architecture::Rrdb`] on load.
    RrdbRealEsrgan,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SrvggCompact => "srvgg_compact",
            Self::Spsr => "spsr",
            Self::Rrdb => "rrdb",
            Self::RrdbRealEsrgan => "rrdb_real_esrgan",
        };
        f.write_str(name)
    }
}

/// First matching signature wins. `None` sends the checkpoint to the generic
/// loader.
pub fn detect(checkpoint: &Checkpoint) -> Option<Architecture> {
    let root = &checkpoint.root;
    let params = checkpoint.params();

    if params.is_some_and(|p| p.contains(srvgg::SIGNATURE)) {
        return Some(Architecture::SrvggCompact);
    }
    if root.contains(spsr::SIGNATURE) {
        return Some(Architecture::Spsr);
    }
    if root.contains(rrdb::LEGACY_SIGNATURE) {
        return Some(Architecture::Rrdb);
    }
    let [first, body] = rrdb::REAL_ESRGAN_SIGNATURE;
    let real_esrgan = |dict: &StateDict| dict.contains(first) && dict.contains(body);
    if real_esrgan(root) || params.is_some_and(real_esrgan) {
        return Some(Architecture::RrdbRealEsrgan);
    }
    None
}

#[derive(Debug, Clone)]
enum Network {
    Srvgg(srvgg::SrvggCompact),
    Spsr(spsr::SpsrNet),
    Rrdb(rrdb::RrdbNet),
}

impl Network {
    fn info(&self) -> &ModelInfo {
        match self {
            Self::Srvgg(net) => net.info(),
            Self::Spsr(net) => net.info(),
            Self::Rrdb(net) => net.info(),
        }
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Srvgg(net) => net.forward(x),
            Self::Spsr(net) => net.forward(x),
            Self::Rrdb(net) => net.forward(x),
        }
    }
}

/// A checkpoint-built network running on a candle device.
#[derive(Debug, Clone)]
pub struct CheckpointModel {
    network: Network,
    architecture: Architecture,
    device: Device,
}

impl CheckpointModel {
    pub fn load(
        architecture: Architecture,
        checkpoint: Checkpoint,
        device: &Device,
    ) -> Result<Self> {
        let path = checkpoint.path.clone();
        let weights = checkpoint.into_weights();
        let network = match architecture {
            Architecture::SrvggCompact => Network::Srvgg(srvgg::SrvggCompact::load(&weights)?),
            Architecture::Spsr => Network::Spsr(spsr::SpsrNet::load(&weights)?),
            Architecture::Rrdb => Network::Rrdb(rrdb::RrdbNet::load(&weights, "ESRGAN", 1)?),
            Architecture::RrdbRealEsrgan => {
                let first_in = weights.dim(rrdb::REAL_ESRGAN_SIGNATURE[0], 1)?;
                let unshuffle = rrdb::unshuffle_factor(first_in);
                let weights = rrdb::real_esrgan_to_legacy(weights)?;
                Network::Rrdb(rrdb::RrdbNet::load(&weights, "RealESRGAN", unshuffle)?)
            }
        };
        let network_info = network.info();
        info!(
            path = %path.display(),
            architecture = %architecture,
            in_nc = network_info.in_nc,
            out_nc = network_info.out_nc,
            scale = network_info.scale,
            "Model built"
        );

        Ok(Self {
            network,
            architecture,
            device: device.clone(),
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
}

impl SuperResModel for CheckpointModel {
    fn info(&self) -> &ModelInfo {
        self.network.info()
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let shape = input.dim();
        let contiguous = input.as_standard_layout();
        let samples = contiguous
            .as_slice()
            .context("input batch is not contiguous")?;
        let x = Tensor::from_slice(samples, shape, &self.device)?;

        let y = self.network.forward(&x)?;
        let (n, c, h, w) = y.dims4()?;
        let values: Vec<f32> = y.to_device(&Device::Cpu)?.flatten_all()?.to_vec1()?;
        Ok(Array4::from_shape_vec((n, c, h, w), values)?)
    }
}
