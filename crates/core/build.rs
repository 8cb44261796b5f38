fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/onnx.proto3");
    prost_build::compile_protos(&["proto/onnx.proto3"], &["proto/"])?;
    Ok(())
}
