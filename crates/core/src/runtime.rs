//! Locating the ONNX Runtime shared library and the GPU libraries it pulls in.
//!
//! `ort` is built with `load-dynamic`, so the runtime is found through
//! `ORT_DYLIB_PATH`. Bundled CUDA/cuDNN/TensorRT libraries next to the binary
//! are preloaded with global symbol visibility so the providers resolve them.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Library directories in probe order: next to the executable, the
/// executable's `../lib`, the working directory's `lib`, then system paths.
pub fn library_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(exe_dir) = env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        #[cfg(windows)]
        push(exe_dir.clone());
        push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

pub fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Call at the very start of `main`, before tracing and before any session.
pub fn setup_runtime_libs() {
    let dirs = library_search_dirs();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
        }
        #[cfg(windows)]
        prepend_to_path(&dirs);
    }

    for lib in gpu_libraries(&dirs) {
        // SAFETY: these are vendor runtime libraries whose initializers have
        // no preconditions beyond being loaded once per process.
        unsafe { load_global(&lib) };
    }
}

/// Call once tracing is up.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(path) if Path::new(&path).is_file() => info!(path = %path, "ONNX Runtime library"),
        Ok(path) => warn!(path = %path, "{ORT_DYLIB_ENV} points to a missing file"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set; ONNX Runtime will use default search paths"),
    }
}

/// Preload tier: CUDA runtime, then cuDNN, then TensorRT. ORT's own provider
/// libraries are excluded since they need `libonnxruntime` loaded first.
fn load_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if cfg!(windows) {
        name.to_ascii_lowercase().ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// Known GPU libraries across `dirs`, first directory winning per file name,
/// sorted so dependencies load before dependents.
fn gpu_libraries(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(tier) = load_tier(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                found.push((tier, name, path));
            }
        }
    }

    found.sort();
    found.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_global(path: &Path) {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => std::mem::forget(lib),
        Err(error) => debug!(path = %path.display(), %error, "GPU library preload failed"),
    }
}

#[cfg(windows)]
unsafe fn load_global(path: &Path) {
    match libloading::Library::new(path) {
        Ok(lib) => std::mem::forget(lib),
        Err(error) => debug!(path = %path.display(), %error, "GPU library preload failed"),
    }
}

#[cfg(windows)]
fn prepend_to_path(dirs: &[PathBuf]) {
    let mut merged: Vec<PathBuf> = dirs.iter().filter(|dir| dir.is_dir()).cloned().collect();
    if let Some(current) = env::var_os("PATH") {
        for dir in env::split_paths(&current) {
            if !dir.as_os_str().is_empty() && !merged.contains(&dir) {
                merged.push(dir);
            }
        }
    }
    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_dirs_include_cwd_lib() {
        let dirs = library_search_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
        let unique: HashSet<_> = dirs.iter().collect();
        assert_eq!(unique.len(), dirs.len());
    }

    #[test]
    fn finds_ort_dylib_in_first_matching_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty = temp.path().join("empty");
        let bundled = temp.path().join("bundled");
        std::fs::create_dir_all(&empty).expect("mkdir");
        std::fs::create_dir_all(&bundled).expect("mkdir");
        std::fs::write(bundled.join(ORT_LIB_NAME), b"stub").expect("write");

        assert_eq!(
            find_ort_dylib(&[empty.clone(), bundled.clone()]),
            Some(bundled.join(ORT_LIB_NAME))
        );
        assert_eq!(find_ort_dylib(&[empty]), None);
    }

    #[test]
    fn load_tiers_order_cuda_then_cudnn_then_tensorrt() {
        assert!(load_tier("libcudart.so.12") < load_tier("libcudnn.so.9"));
        assert!(load_tier("cublas64_12.dll") < load_tier("cudnn64_9.dll"));
        assert!(load_tier("libcudnn_ops.so.9") < load_tier("libnvinfer.so.10"));
        assert_eq!(load_tier("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_tier("libpng16.so.16"), None);
    }

    #[cfg(unix)]
    #[test]
    fn gpu_libraries_are_sorted_and_deduplicated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("mkdir");
        std::fs::create_dir_all(&second).expect("mkdir");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libz.so.1"] {
            std::fs::write(first.join(name), b"stub").expect("write");
        }
        std::fs::write(second.join("libcudnn.so.9"), b"stub").expect("write");
        std::fs::write(second.join("libcudart.so.12"), b"stub").expect("write");

        let libs = gpu_libraries(&[first.clone(), second.clone()]);
        assert_eq!(
            libs,
            vec![
                second.join("libcudart.so.12"),
                first.join("libcudnn.so.9"),
                first.join("libnvinfer.so.10"),
            ]
        );
    }
}
