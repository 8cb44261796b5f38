//! Generic models: any ONNX super-resolution graph run through ONNX Runtime.
//!
//! FP32 graphs get the batch as is; FP16 graphs (detected from the first
//! input's element type) get a half-precision copy and their output is
//! widened back to f32.

use std::path::Path;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::inference::{ModelInfo, SuperResModel};
use crate::inspect::inspect_onnx;

/// Spatial alignment ONNX graphs are padded to.
pub const ONNX_PAD_ALIGN: usize = 4;

pub fn onnx_model_info(in_nc: Option<usize>, out_nc: Option<usize>) -> ModelInfo {
    let in_nc = in_nc.unwrap_or(3);
    ModelInfo {
        name: "ONNX".to_string(),
        in_nc,
        out_nc: out_nc.unwrap_or(in_nc),
        scale: None,
        pad_align: ONNX_PAD_ALIGN,
        num_feat: None,
        num_blocks: None,
    }
}

pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    info: ModelInfo,
}

impl OnnxModel {
    pub fn load(
        model_path: &Path,
        backend: InferenceBackend,
        trt_cache_dir: &Path,
    ) -> Result<Self> {
        let (in_nc, out_nc) = match inspect_onnx(model_path) {
            Ok(inspection) => inspection.channels(),
            Err(error) => {
                warn!(%error, "Could not inspect ONNX graph; assuming RGB in and out");
                (None, None)
            }
        };
        let info = onnx_model_info(in_nc, out_nc);

        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir,
        })?;

        let input_name = session
            .inputs()
            .first()
            .context("ONNX graph has no inputs")?
            .name()
            .to_string();
        let output_name = session
            .outputs()
            .first()
            .context("ONNX graph has no outputs")?
            .name()
            .to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");
        info!(
            path = %model_path.display(),
            backend = %backend,
            in_nc = info.in_nc,
            out_nc = info.out_nc,
            "ONNX model loaded"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
            info,
        })
    }
}

impl SuperResModel for OnnxModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let output = if self.is_fp16 {
            run_fp16_inference(&mut self.session, input, &self.input_name, &self.output_name)?
        } else {
            let input_tensor = Tensor::from_array(input.clone())?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned()
        };
        output
            .into_dimensionality::<Ix4>()
            .context("ONNX output is not an NCHW tensor")
    }
}

fn run_fp16_inference(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input must be contiguous for f16 conversion")?;
    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), to_f16(f32_slice))?;

    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let standard = output_view.as_standard_layout();
    let fp16_slice = standard
        .as_slice()
        .context("ONNX output is not contiguous")?;
    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), to_f32(fp16_slice))?)
}

fn to_f16(samples: &[f32]) -> Vec<f16> {
    let mut out = vec![f16::ZERO; samples.len()];
    out.convert_from_f32_slice(samples);
    out
}

fn to_f32(samples: &[f16]) -> Vec<f32> {
    let mut out = vec![0.0f32; samples.len()];
    samples.convert_to_f32_slice(&mut out);
    out
}
