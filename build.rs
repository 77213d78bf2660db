//! Emits the build facts `autoconfig -v` logs at startup.

fn main() {
    use vergen::{BuildBuilder, CargoBuilder, Emitter};

    println!("cargo:rerun-if-changed=build.rs");

    let mut emitter = Emitter::default();
    if let Ok(build) = BuildBuilder::default().build_timestamp(true).build() {
        let _ = emitter.add_instructions(&build);
    }
    if let Ok(cargo) = CargoBuilder::default().target_triple(true).build() {
        let _ = emitter.add_instructions(&cargo);
    }

    // Missing values fall back to "unknown" in main.
    if let Err(e) = emitter.emit() {
        eprintln!("vergen emit skipped: {e}");
    }
}
