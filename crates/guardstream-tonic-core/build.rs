/// Compiles `proto/guardstream.proto` into tonic client and server bindings.
///
/// Besides the generated modules, a serialized `FileDescriptorSet` is written
/// to `OUT_DIR/guardstream_descriptor.bin`. The server registers it with
/// `tonic-reflection` so tools like `grpcurl` can discover the service
/// without a local copy of the proto.
///
/// Generated code is accessible through:
///
/// ```rust,ignore
/// pub mod guardstream {
///     tonic::include_proto!("guardstream");
/// }
/// ```
///
/// # Panics
///
/// Panics if `OUT_DIR` is unset or code generation fails.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR"));
    let descriptor_path = out_dir.join("guardstream_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/guardstream.proto");
    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/guardstream.proto"], &["proto"])
        .expect("failed to compile proto/guardstream.proto");
}
