// Build script for localgate-core
// Generates the worker gRPC client and server stubs

fn main() {
    // Use vendored protoc from protoc-bin-vendored
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc not available"),
    );

    compile_protos();

    // Rebuild when protobuf files change
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../proto/");
}

/// Compile the worker backend protocol
fn compile_protos() {
    tonic_prost_build::configure()
        .build_server(true) // echo-worker and tests serve the contract in-process
        .build_client(true)
        .compile_protos(&["../../proto/backend.proto"], &["../../proto/"])
        .unwrap_or_else(|e| panic!("Failed to compile protos: {}", e));
}
