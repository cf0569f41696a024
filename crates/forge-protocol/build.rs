// Build script for compiling the protobuf envelope
// Runs automatically during `cargo build`

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true) // Engine hosts both services
        .build_client(true) // Client code used by tests and the sandbox SDK
        .compile_protos(
            &["../../forge.proto"], // Proto file path
            &["../../"],            // Include directory
        )?;

    println!("cargo:rerun-if-changed=../../forge.proto");

    Ok(())
}
