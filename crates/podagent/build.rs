fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(false) // We only need the client
        .compile_protos(&["proto/runtime.proto"], &["proto"])?;

    // Builds from a source archive have no git history; the version string
    // then reports the commit as unknown.
    if let Err(err) = emit_commit_metadata() {
        println!("cargo:warning=git build metadata unavailable: {err}");
    }
    Ok(())
}

fn emit_commit_metadata() -> Result<(), Box<dyn std::error::Error>> {
    let git = vergen_git2::Git2Builder::default()
        .sha(true)
        .dirty(true)
        .build()?;

    // fail_on_error keeps vergen from emitting placeholder values; a failed
    // emit leaves the env vars unset and version.rs falls back cleanly.
    vergen_git2::Emitter::default()
        .fail_on_error()
        .add_instructions(&git)?
        .emit()?;
    Ok(())
}
