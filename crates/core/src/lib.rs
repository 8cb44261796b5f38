//! Single-image super-resolution: checkpoint sniffing, network construction,
//! alpha-aware inference and image I/O.

pub mod alpha;
pub mod arch;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod imageio;
pub mod inference;
pub mod inspect;
pub mod logging;
pub mod onnx;
pub mod pixels;
pub mod runtime;
pub mod upscale;

pub use upscale::{upscale, UpscaleOptions, UpscaleRequest, UpscaleSummary};
