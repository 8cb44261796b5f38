use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use tempfile::{tempdir, TempDir};
use upscale_core::arch::Architecture;
use upscale_core::device::DevicePreference;
use upscale_core::{upscale, UpscaleOptions, UpscaleRequest};

fn insert_conv(tensors: &mut HashMap<String, Tensor>, prefix: &str, in_ch: usize, out_ch: usize) {
    let weight = Tensor::zeros((out_ch, in_ch, 3, 3), candle_core::DType::F32, &Device::Cpu)
        .expect("weight");
    let bias = Tensor::zeros(out_ch, candle_core::DType::F32, &Device::Cpu).expect("bias");
    tensors.insert(format!("{prefix}.weight"), weight);
    tensors.insert(format!("{prefix}.bias"), bias);
}

/// Zero-weight compact network under a `params.` wrapper: behaves as exact
/// nearest-neighbour upscaling.
fn compact_checkpoint(dir: &Path, scale: usize) -> PathBuf {
    let nf = 4;
    let mut tensors = HashMap::new();
    insert_conv(&mut tensors, "params.body.0", 3, nf);
    tensors.insert(
        "params.body.1.weight".to_string(),
        Tensor::full(0.25f32, nf, &Device::Cpu).expect("prelu"),
    );
    insert_conv(&mut tensors, "params.body.2", nf, 3 * scale * scale);

    let path = dir.join(format!("compact_x{scale}.safetensors"));
    candle_core::safetensors::save(&tensors, &path).expect("save checkpoint");
    path
}

/// Zero-weight ESRGAN in the `model.N` layout: one trunk block, x4.
fn legacy_rrdb_checkpoint(dir: &Path) -> PathBuf {
    let (nf, gc) = (4, 2);
    let mut tensors = HashMap::new();
    insert_conv(&mut tensors, "model.0", 3, nf);
    for rdb in 1..=3 {
        for k in 1..=5 {
            let in_ch = nf + (k - 1) * gc;
            let out_ch = if k == 5 { nf } else { gc };
            insert_conv(&mut tensors, &format!("model.1.sub.0.RDB{rdb}.conv{k}.0"), in_ch, out_ch);
        }
    }
    insert_conv(&mut tensors, "model.1.sub.1", nf, nf);
    insert_conv(&mut tensors, "model.3", nf, nf);
    insert_conv(&mut tensors, "model.6", nf, nf);
    insert_conv(&mut tensors, "model.8", nf, nf);
    insert_conv(&mut tensors, "model.10", nf, 3);

    let path = dir.join("esrgan_x4.safetensors");
    candle_core::safetensors::save(&tensors, &path).expect("save checkpoint");
    path
}

fn cpu_options() -> UpscaleOptions {
    UpscaleOptions {
        device: DevicePreference::Cpu,
        ..UpscaleOptions::default()
    }
}

fn request(dir: &TempDir, input: &Path, model: &Path, downscale: Option<u32>) -> UpscaleRequest {
    UpscaleRequest {
        input: input.to_path_buf(),
        output: dir.path().join("out.png"),
        model: model.to_path_buf(),
        downscale,
    }
}

fn save(image: DynamicImage, path: &Path) {
    image.save(path).expect("save input image");
}

#[test]
fn rgb_output_is_input_times_scale() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    let source = RgbImage::from_fn(5, 3, |x, y| Rgb([(x * 40) as u8, (y * 80) as u8, 200]));
    save(DynamicImage::ImageRgb8(source.clone()), &input);
    let model = compact_checkpoint(dir.path(), 2);

    let req = request(&dir, &input, &model, None);
    let summary = upscale(&req, &cpu_options()).expect("upscale");
    assert_eq!(summary.architecture, Some(Architecture::SrvggCompact));
    assert_eq!(summary.output_size, (10, 6));
    assert!(!summary.alpha_passes);

    let output = image::open(&req.output).expect("open output").to_rgb8();
    assert_eq!(output.dimensions(), (10, 6));
    assert_eq!(output.get_pixel(9, 5), source.get_pixel(4, 2));
    assert_eq!(output.get_pixel(2, 0), source.get_pixel(1, 0));
}

#[test]
fn rgba_dual_pass_recovers_alpha() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    let source = RgbaImage::from_fn(4, 4, |x, y| Rgba([200, 100, 50, (x * 60 + y * 5) as u8]));
    save(DynamicImage::ImageRgba8(source.clone()), &input);
    let model = compact_checkpoint(dir.path(), 2);

    let req = request(&dir, &input, &model, None);
    let summary = upscale(&req, &cpu_options()).expect("upscale");
    assert!(summary.alpha_passes);

    let output = image::open(&req.output).expect("open output");
    assert!(output.color().has_alpha());
    let output = output.to_rgba8();
    assert_eq!(output.dimensions(), (8, 8));
    for (x, y, pixel) in output.enumerate_pixels() {
        let src = source.get_pixel(x / 2, y / 2);
        let alpha = f32::from(src[3]) / 255.0;
        assert!(pixel[3].abs_diff(src[3]) <= 1, "alpha at ({x},{y})");
        let premultiplied = (f32::from(src[0]) * alpha).round() as u8;
        assert!(pixel[0].abs_diff(premultiplied) <= 1, "red at ({x},{y})");
    }
}

#[test]
fn downscale_sets_longer_side_before_upscaling() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("wide.png");
    save(DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, Rgb([9, 9, 9]))), &input);
    let model = compact_checkpoint(dir.path(), 2);

    let summary =
        upscale(&request(&dir, &input, &model, Some(10)), &cpu_options()).expect("upscale");
    assert_eq!(summary.input_size, (10, 5));
    assert_eq!(summary.output_size, (20, 10));
}

#[test]
fn gray_input_is_replicated_for_rgb_models() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("gray.png");
    save(DynamicImage::ImageLuma8(GrayImage::from_pixel(3, 2, Luma([120]))), &input);
    let model = compact_checkpoint(dir.path(), 3);

    let req = request(&dir, &input, &model, None);
    upscale(&req, &cpu_options()).expect("upscale");
    let output = image::open(&req.output).expect("open output").to_rgb8();
    assert_eq!(output.dimensions(), (9, 6));
    assert_eq!(output.get_pixel(8, 5), &Rgb([120, 120, 120]));
}

#[test]
fn legacy_rrdb_checkpoint_scales_by_four() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    save(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(3, 5, Rgb([1, 2, 3]))), &input);
    let model = legacy_rrdb_checkpoint(dir.path());

    let summary = upscale(&request(&dir, &input, &model, None), &cpu_options()).expect("upscale");
    assert_eq!(summary.architecture, Some(Architecture::Rrdb));
    assert_eq!(summary.model.scale, Some(4));
    assert_eq!(summary.output_size, (12, 20));
}

#[test]
fn unrecognised_checkpoint_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    save(DynamicImage::ImageRgb8(RgbImage::new(2, 2)), &input);
    let mut tensors = HashMap::new();
    insert_conv(&mut tensors, "encoder.0", 3, 3);
    let model = dir.path().join("mystery.safetensors");
    candle_core::safetensors::save(&tensors, &model).expect("save");

    let error = upscale(&request(&dir, &input, &model, None), &cpu_options()).expect_err("unknown");
    assert!(error.to_string().contains("unsupported checkpoint"));
}

#[test]
fn missing_input_names_the_file() {
    let dir = tempdir().expect("tempdir");
    let model = compact_checkpoint(dir.path(), 2);
    let missing = dir.path().join("absent.png");

    let error =
        upscale(&request(&dir, &missing, &model, None), &cpu_options()).expect_err("missing");
    assert!(format!("{error:#}").contains("absent.png"));
}

#[test]
#[ignore = "needs ONNX Runtime and a real model in UPSCALE_TEST_ONNX_MODEL"]
fn onnx_model_upscales_through_generic_loader() {
    let Ok(model) = std::env::var("UPSCALE_TEST_ONNX_MODEL") else {
        return;
    };
    upscale_core::runtime::setup_runtime_libs();
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    save(DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([90, 60, 30]))), &input);

    let summary = upscale(&request(&dir, &input, Path::new(&model), Some(32)), &cpu_options())
        .expect("upscale");
    assert!(summary.architecture.is_none());
    assert_eq!(summary.input_size, (32, 24));
    let scale = summary.output_size.0 / 32;
    assert_eq!(summary.output_size, (32 * scale, 24 * scale));
}
