//! Build and version information.
//!
//! Version strings are fixed at compile time. Release builds inject them
//! through `KUBELITE_*` environment variables; development builds fall back
//! to the crate version and `"unknown"`. The values are exposed through a
//! single read-only accessor, [`get`].

use std::fmt;
use std::sync::OnceLock;

const UNKNOWN: &str = "unknown";

/// Build information for the running binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// Semantic version (`v0.1.0` style).
    pub git_version: String,
    /// Git commit hash.
    pub git_commit: String,
    /// `clean` or `dirty`.
    pub git_tree_state: String,
    /// Build timestamp.
    pub build_date: String,
    /// Kubernetes release this binary tracks.
    pub k8s_version: String,
    /// Compiler version string reported by rustc.
    pub rustc_version: String,
    /// Compiler name.
    pub compiler: String,
    /// `os/arch` of the running binary.
    pub platform: String,
}

impl BuildInfo {
    fn from_build_env() -> Self {
        Self {
            git_version: option_env!("KUBELITE_GIT_VERSION")
                .map(String::from)
                .unwrap_or_else(|| format!("v{}-dev", env!("CARGO_PKG_VERSION"))),
            git_commit: option_env!("KUBELITE_GIT_COMMIT")
                .unwrap_or(UNKNOWN)
                .to_string(),
            git_tree_state: option_env!("KUBELITE_GIT_TREE_STATE")
                .unwrap_or(UNKNOWN)
                .to_string(),
            build_date: option_env!("KUBELITE_BUILD_DATE")
                .unwrap_or(UNKNOWN)
                .to_string(),
            k8s_version: option_env!("KUBELITE_K8S_VERSION")
                .unwrap_or(UNKNOWN)
                .to_string(),
            rustc_version: option_env!("KUBELITE_RUSTC_VERSION")
                .unwrap_or(UNKNOWN)
                .to_string(),
            compiler: "rustc".to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version:      {}", self.git_version)?;
        writeln!(f, "Git Commit:   {}", self.git_commit)?;
        writeln!(f, "Git State:    {}", self.git_tree_state)?;
        writeln!(f, "Build Date:   {}", self.build_date)?;
        writeln!(f, "K8s Version:  {}", self.k8s_version)?;
        writeln!(f, "Rust Version: {}", self.rustc_version)?;
        writeln!(f, "Compiler:     {}", self.compiler)?;
        write!(f, "Platform:     {}", self.platform)
    }
}

static BUILD_INFO: OnceLock<BuildInfo> = OnceLock::new();

/// Get the build information of this binary.
pub fn get() -> &'static BuildInfo {
    BUILD_INFO.get_or_init(BuildInfo::from_build_env)
}
