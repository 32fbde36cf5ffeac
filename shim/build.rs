use ttrpc_codegen::Codegen;

fn main() {
    println!("cargo:rerun-if-changed=proto/shim.proto");

    Codegen::new()
        .out_dir("src/protocols")
        .inputs(&["proto/shim.proto"])
        .include("proto")
        .rust_protobuf()
        .run()
        .expect("Failed to generate ttrpc server code");
}
