//! Configuration loading for vigil.
//!
//! Resolves a `vigil.toml` (explicit path, `$VIGIL_CONFIG_PATH`, then the
//! default locations), layers environment overrides on top, and runs the
//! guard rails that must pass before a pipeline is started. Both `vigilctl`
//! and embedders go through [`ConfigLoader`] so defaults and validation live
//! in one place.

pub mod loader;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use sources::EnvConfig;
pub use validation::{
    BUILTIN_VALIDATORS, ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails,
};
pub use vigil_core::config::VigilConfig;
