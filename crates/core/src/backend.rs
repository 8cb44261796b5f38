//! ONNX Runtime session construction for graph checkpoints.
//!
//! [`InferenceBackend`] picks the execution provider chain; [`build_session`]
//! commits the graph with it. TensorRT engines are cached on disk and the first
//! build can take minutes, so it is logged with a periodic progress ticker.

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::device::DevicePreference;

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

/// Execution provider chain for ONNX graphs.
///
/// `Tensorrt` registers TensorRT first with CUDA behind it, so a missing
/// `libnvinfer` still ends up on the GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Case-insensitive parse; unknown values map to `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }

    /// An explicit CPU device request wins over the configured provider.
    pub fn for_device(self, device: DevicePreference) -> Self {
        match device {
            DevicePreference::Cpu => Self::Cpu,
            _ => self,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: &'a Path,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building ONNX session without GPU providers");
            commit(builder, config.model_path)
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA execution provider unavailable; running ONNX graph on CPU");
                return commit(builder, config.model_path);
            }
            debug!(backend = "cuda", "Building ONNX session with CUDA EP");
            let builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])?;
            commit(builder, config.model_path)
        }
        InferenceBackend::Tensorrt => commit_tensorrt(builder, config),
    }
}

fn commit(builder: SessionBuilder, model_path: &Path) -> Result<Session> {
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
}

fn commit_tensorrt(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    let cache_dir = config.trt_cache_dir;
    if let Err(error) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), %error, "Failed to create TensorRT cache directory");
    }

    let before = EngineCacheStats::scan(cache_dir);
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        cache_bytes = before.total_bytes,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let started = Instant::now();
    let ticker = ProgressTicker::start(cache_dir.display().to_string());
    let result = builder
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                .with_fp16(true)
                .with_device_id(0)
                .build(),
            CUDAExecutionProvider::default().build(),
        ])
        .map_err(anyhow::Error::from)
        .and_then(|builder| commit(builder, config.model_path));
    ticker.stop();

    let elapsed_secs = started.elapsed().as_secs_f64();
    let after = EngineCacheStats::scan(cache_dir);
    match result {
        Ok(session) => {
            info!(
                elapsed_secs,
                cache_files = after.file_count,
                cache_bytes = after.total_bytes,
                cache_updated = after != before,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(err) => {
            error!(elapsed_secs, error = %err, "TensorRT session initialization failed");
            Err(err)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct EngineCacheStats {
    file_count: u64,
    total_bytes: u64,
}

impl EngineCacheStats {
    fn scan(root: &Path) -> Self {
        let mut stats = Self::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(meta) = entry.metadata() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
        stats
    }
}

struct ProgressTicker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressTicker {
    fn start(cache_dir: String) -> Self {
        let (stop, stop_rx) = channel::<()>();
        let handle = thread::spawn(move || {
            let mut elapsed_secs = 0;
            loop {
                match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        elapsed_secs += TRT_PROGRESS_TICK.as_secs();
                        info!(elapsed_secs, %cache_dir, "TensorRT engine build still in progress");
                    }
                }
            }
        });
        Self { stop, handle }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("CPU"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("cuda"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy("TensorRT"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("vulkan"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cuda);
    }

    #[test]
    fn backend_display_matches_config_spelling() {
        for backend in [
            InferenceBackend::Cpu,
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
        ] {
            assert_eq!(InferenceBackend::from_str_lossy(&backend.to_string()), backend);
        }
    }

    #[test]
    fn cpu_device_forces_cpu_backend() {
        assert_eq!(
            InferenceBackend::Tensorrt.for_device(DevicePreference::Cpu),
            InferenceBackend::Cpu
        );
        assert_eq!(
            InferenceBackend::Tensorrt.for_device(DevicePreference::Auto),
            InferenceBackend::Tensorrt
        );
        assert_eq!(
            InferenceBackend::Cuda.for_device(DevicePreference::Metal),
            InferenceBackend::Cuda
        );
    }

    #[test]
    fn engine_cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("a.engine"), [0u8; 10]).expect("write");
        std::fs::write(dir.path().join("nested/b.profile"), [0u8; 5]).expect("write");

        let stats = EngineCacheStats::scan(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(
            EngineCacheStats::scan(&dir.path().join("missing")),
            EngineCacheStats::default()
        );
    }
}
