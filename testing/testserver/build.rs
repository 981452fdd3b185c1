use prost::Message;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    // Compile with protox so no protoc binary is needed; the well-known
    // type imports come from protox's embedded sources.
    let fds = protox::compile(["proto/grpctest.proto"], ["proto"])?;
    std::fs::write(out_dir.join("grpctest_descriptor.bin"), fds.encode_to_vec())?;

    tonic_prost_build::configure()
        .skip_protoc_run()
        .compile_fds(fds)?;

    println!("cargo:rerun-if-changed=proto/grpctest.proto");
    Ok(())
}
