//! Version information for funclet.

/// Funclet version from Cargo.toml
pub const FUNCLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build details reported at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub funclet: &'static str,
    /// Wire variants this build can speak.
    pub wire_formats: &'static [&'static str],
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            funclet: FUNCLET_VERSION,
            wire_formats: &["json", "binary"],
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "funclet {} (wire formats: {})",
            self.funclet,
            self.wire_formats.join(", ")
        )
    }
}
