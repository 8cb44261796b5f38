//! Static model inspection: what a checkpoint contains and how it would be
//! run, without executing it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use prost::Message;
use serde::Serialize;

use crate::arch::{detect, Architecture, CheckpointModel};
use crate::checkpoint::{Checkpoint, CheckpointFormat};
use crate::inference::{ModelInfo, SuperResModel};

/// Generated ONNX protobuf types from `proto/onnx.proto3`.
mod onnx_proto {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    /// e.g. "float32", "float16".
    pub data_type: String,
    /// `-1` marks a symbolic dimension.
    pub shape: Vec<i64>,
}

impl TensorInfo {
    /// Channel axis of an NCHW image tensor, when it is fixed.
    pub fn channels(&self) -> Option<usize> {
        match self.shape.as_slice() {
            [_, c, _, _] if *c > 0 => usize::try_from(*c).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OnnxInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    /// Node count per operator type.
    pub op_types: BTreeMap<String, usize>,
    pub op_count: usize,
    /// Sum of initializer element counts.
    pub param_count: u64,
}

impl OnnxInspection {
    /// `(in_nc, out_nc)` from the first graph input and output, when fixed.
    pub fn channels(&self) -> (Option<usize>, Option<usize>) {
        (
            self.inputs.first().and_then(TensorInfo::channels),
            self.outputs.first().and_then(TensorInfo::channels),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub path: PathBuf,
    pub format: CheckpointFormat,
    pub wrapper_key: Option<String>,
    pub architecture: Option<Architecture>,
    pub model: Option<ModelInfo>,
    pub tensor_count: usize,
    pub param_count: u64,
    pub onnx: Option<OnnxInspection>,
}

/// Maps an ONNX `TensorProto.DataType` value to a readable name.
fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        4 => "uint16".into(),
        5 => "int16".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        9 => "bool".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &onnx_proto::ValueInfoProto) -> TensorInfo {
    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|val| match val {
            onnx_proto::type_proto::Value::TensorType(t) => {
                let dims = t
                    .shape
                    .as_ref()
                    .map(|s| {
                        s.dim
                            .iter()
                            .map(|d| match &d.value {
                                Some(
                                    onnx_proto::tensor_shape_proto::dimension::Value::DimValue(v),
                                ) => *v,
                                _ => -1,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (data_type_name(t.elem_type), dims)
            }
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

fn tensor_element_count(dims: &[i64]) -> u64 {
    if dims.is_empty() {
        return 0;
    }
    dims.iter()
        .map(|&d| if d > 0 { d as u64 } else { 1 })
        .product()
}

/// Reads ONNX metadata straight from the protobuf; no runtime or GPU needed.
pub fn inspect_onnx(path: &Path) -> Result<OnnxInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;
    inspect_onnx_bytes(&bytes)
}

pub fn inspect_onnx_bytes(bytes: &[u8]) -> Result<OnnxInspection> {
    let model = onnx_proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    // Initializers may also be listed as graph inputs; only real inputs count.
    let initializer_names: Vec<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let inputs = graph
        .input
        .iter()
        .filter(|vi| !initializer_names.contains(&vi.name.as_str()))
        .map(value_info_to_tensor)
        .collect();
    let outputs = graph.output.iter().map(value_info_to_tensor).collect();

    let mut op_types = BTreeMap::new();
    for node in &graph.node {
        *op_types.entry(node.op_type.clone()).or_insert(0) += 1;
    }

    Ok(OnnxInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        inputs,
        outputs,
        op_types,
        op_count: graph.node.len(),
        param_count: graph
            .initializer
            .iter()
            .map(|t| tensor_element_count(&t.dims))
            .sum(),
    })
}

/// Builds a report for any supported model file. Checkpoints are loaded on
/// the CPU; a recognised architecture is also instantiated so its shape
/// parameters are validated.
pub fn inspect_checkpoint(path: &Path) -> Result<CheckpointReport> {
    if CheckpointFormat::from_path(path) == CheckpointFormat::Onnx {
        let onnx = inspect_onnx(path)?;
        let (in_nc, out_nc) = onnx.channels();
        return Ok(CheckpointReport {
            path: path.to_path_buf(),
            format: CheckpointFormat::Onnx,
            wrapper_key: None,
            architecture: None,
            model: Some(crate::onnx::onnx_model_info(in_nc, out_nc)),
            tensor_count: onnx.inputs.len() + onnx.outputs.len(),
            param_count: onnx.param_count,
            onnx: Some(onnx),
        });
    }

    let checkpoint = Checkpoint::load(path, &Device::Cpu)?;
    let weights = checkpoint.weights();
    let tensor_count = weights.len();
    let param_count = weights.param_count() as u64;
    let wrapper_key = checkpoint.wrapper_key().map(str::to_string);
    let format = checkpoint.format;
    let architecture = detect(&checkpoint);
    let model = match architecture {
        Some(arch) => Some(CheckpointModel::load(arch, checkpoint, &Device::Cpu)?.info().clone()),
        None => None,
    };

    Ok(CheckpointReport {
        path: path.to_path_buf(),
        format,
        wrapper_key,
        architecture,
        model,
        tensor_count,
        param_count,
        onnx: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use onnx_proto::*;

    fn dim(value: i64) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(tensor_shape_proto::dimension::Value::DimValue(value)),
        }
    }

    fn symbolic(name: &str) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(tensor_shape_proto::dimension::Value::DimParam(name.into())),
        }
    }

    fn image_value(name: &str, elem_type: i32, channels: i64) -> ValueInfoProto {
        ValueInfoProto {
            name: name.into(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type,
                    shape: Some(TensorShapeProto {
                        dim: vec![dim(1), dim(channels), symbolic("h"), symbolic("w")],
                    }),
                })),
            }),
        }
    }

    /// Conv -> DepthToSpace graph with an `input` of `in_nc` and an `output`
    /// of `out_nc` channels.
    pub(crate) fn sr_graph_bytes(in_nc: i64, out_nc: i64) -> Vec<u8> {
        let node = |op: &str, name: &str, input: Vec<&str>, output: &str| NodeProto {
            input: input.into_iter().map(String::from).collect(),
            output: vec![output.into()],
            name: name.into(),
            op_type: op.into(),
            domain: String::new(),
        };
        let weight = TensorProto {
            dims: vec![out_nc * 4, in_nc, 3, 3],
            data_type: 1,
            name: "conv.weight".into(),
        };

        let graph = GraphProto {
            node: vec![
                node("Conv", "conv", vec!["input", "conv.weight"], "features"),
                node("DepthToSpace", "shuffle", vec!["features"], "output"),
            ],
            name: "sr".into(),
            initializer: vec![weight],
            input: vec![
                image_value("input", 1, in_nc),
                ValueInfoProto {
                    name: "conv.weight".into(),
                    r#type: None,
                },
            ],
            output: vec![image_value("output", 1, out_nc)],
        };

        ModelProto {
            ir_version: 8,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 17,
            }],
            producer_name: "pytorch".into(),
            producer_version: "2.1".into(),
            domain: String::new(),
            model_version: 1,
            doc_string: String::new(),
            graph: Some(graph),
        }
        .encode_to_vec()
    }

    #[test]
    fn inspects_sr_graph() {
        let info = inspect_onnx_bytes(&sr_graph_bytes(3, 3)).expect("inspect");

        assert_eq!((info.ir_version, info.opset_version), (8, 17));
        assert_eq!(info.producer_name, "pytorch");
        assert_eq!(info.inputs.len(), 1);
        assert_eq!(info.inputs[0].shape, vec![1, 3, -1, -1]);
        assert_eq!(info.outputs[0].name, "output");
        assert_eq!(info.op_count, 2);
        assert_eq!(info.op_types.get("DepthToSpace"), Some(&1));
        assert_eq!(info.param_count, 12 * 3 * 9);
        assert_eq!(info.channels(), (Some(3), Some(3)));
    }

    #[test]
    fn symbolic_channels_are_unknown() {
        let tensor = TensorInfo {
            name: "x".into(),
            data_type: "float32".into(),
            shape: vec![1, -1, -1, -1],
        };
        assert_eq!(tensor.channels(), None);
        let flat = TensorInfo {
            shape: vec![1, 3],
            ..tensor
        };
        assert_eq!(flat.channels(), None);
    }

    #[test]
    fn invalid_bytes_are_rejected() {
        assert!(inspect_onnx_bytes(b"not a valid protobuf").is_err());
    }

    #[test]
    fn data_type_names() {
        assert_eq!(data_type_name(1), "float32");
        assert_eq!(data_type_name(10), "float16");
        assert_eq!(data_type_name(16), "bfloat16");
        assert_eq!(data_type_name(999), "unknown(999)");
    }

    #[test]
    fn onnx_report_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x2.onnx");
        std::fs::write(&path, sr_graph_bytes(1, 1)).expect("write onnx");

        let report = inspect_checkpoint(&path).expect("report");
        assert_eq!(report.format, CheckpointFormat::Onnx);
        assert!(report.architecture.is_none());
        let model = report.model.expect("model info");
        assert_eq!((model.in_nc, model.out_nc, model.scale), (1, 1, None));
    }

    #[test]
    fn checkpoint_report_names_architecture() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("compact.safetensors");
        let tensors: std::collections::HashMap<String, candle_core::Tensor> =
            crate::arch::srvgg::tests::compact_tensors(3, 4, 1, 2)
                .into_iter()
                .map(|(key, tensor)| (format!("params.{key}"), tensor))
                .collect();
        candle_core::safetensors::save(&tensors, &path).expect("save");

        let report = inspect_checkpoint(&path).expect("report");
        assert_eq!(report.architecture, Some(Architecture::SrvggCompact));
        assert_eq!(report.wrapper_key.as_deref(), Some("params"));
        assert_eq!(report.tensor_count, tensors.len());
        let model = report.model.expect("model info");
        assert_eq!((model.in_nc, model.scale), (3, Some(2)));

        let json = serde_json::to_string(&model).expect("json");
        assert!(json.contains("\"in_nc\":3"));
    }
}
