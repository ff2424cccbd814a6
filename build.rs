//! Build script to create the sandbox's V8 startup snapshot.
//!
//! The web extensions and the bundle bootstrap are evaluated here, so
//! starting a sandbox only deserializes the snapshot.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

// Ops must be identical between the snapshot and the runtime
#[path = "src/ops.rs"]
mod ops;

fn main() {
    println!("cargo:rerun-if-changed=src/bootstrap.js");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/ops.rs");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR not set"));
    let snapshot_path = out_dir.join("FAB_SNAPSHOT.bin");

    let blob_store = Arc::new(deno_web::BlobStore::default());

    let snapshot = deno_core::snapshot::create_snapshot(
        deno_core::snapshot::CreateSnapshotOptions {
            cargo_manifest_dir: env!("CARGO_MANIFEST_DIR"),
            startup_snapshot: None,
            skip_op_registration: false,
            extensions: vec![
                // Dependencies first
                deno_webidl::deno_webidl::init_ops_and_esm(),
                deno_console::deno_console::init_ops_and_esm(),
                deno_url::deno_url::init_ops_and_esm(),
                deno_web::deno_web::init_ops_and_esm::<deno_permissions::PermissionsContainer>(
                    blob_store,
                    None,
                ),
                ops::fab_sandbox::init_ops_and_esm(),
            ],
            with_runtime_cb: None,
            extension_transpiler: None,
        },
        None,
    )
    .expect("Failed to create snapshot");

    std::fs::write(&snapshot_path, snapshot.output).expect("Failed to write snapshot");

    println!(
        "cargo:warning=Sandbox snapshot created at {:?}",
        snapshot_path
    );
}
