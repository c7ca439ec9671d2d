use std::env;

/// Release tag injected by CI; local builds fall back to the crate version.
const RELEASE_VERSION_VAR: &str = "METAL_ORCHESTRATOR_VERSION";

fn main() {
    if let Err(err) = emit_commit_variables() {
        println!("cargo:warning=vergen: {err}");
    }

    let version = env::var(RELEASE_VERSION_VAR)
        .ok()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    println!("cargo:rustc-env=RELEASE_VERSION={version}");
    println!("cargo:rerun-if-env-changed={RELEASE_VERSION_VAR}");
}

/// Only the commit and dirty flag end up in the version string.
fn emit_commit_variables() -> anyhow::Result<()> {
    let git2 = vergen_git2::Git2Builder::default()
        .sha(false)
        .dirty(false)
        .build()?;

    // unset variables render as "unknown" rather than placeholder text
    vergen_git2::Emitter::default()
        .fail_on_error()
        .add_instructions(&git2)?
        .emit()
}
