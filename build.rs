//! Build script for kubelite.
//!
//! Records the compiler version and target triple so `kubelite --version`
//! can report them. Git metadata and the Kubernetes version are injected by
//! the release pipeline through `KUBELITE_*` environment variables and are
//! read with `option_env!` in `core::version`.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for var in [
        "KUBELITE_GIT_VERSION",
        "KUBELITE_GIT_COMMIT",
        "KUBELITE_GIT_TREE_STATE",
        "KUBELITE_BUILD_DATE",
        "KUBELITE_K8S_VERSION",
    ] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|version| version.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=KUBELITE_RUSTC_VERSION={rustc_version}");

    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=KUBELITE_BUILD_TARGET={target}");
}
