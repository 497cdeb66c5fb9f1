fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| format!("{e:?}"))?;
        std::env::set_var("PROTOC", protoc);
    }
    println!("cargo:rerun-if-changed=proto/synthfleet.proto");
    tonic_build::compile_protos("proto/synthfleet.proto")?;
    Ok(())
}
