//! Filesystem locations used by parley.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `PARLEY_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/parley/` by default. Override with
/// the `PARLEY_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("PARLEY_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("parley"))
        .unwrap_or_else(|| PathBuf::from("/tmp/parley-config"))
}

/// Default configuration file: `<config_dir>/config.toml`.
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
