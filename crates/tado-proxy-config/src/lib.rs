//! Configuration for tado-proxy.
//!
//! TOML files are layered (user config, then `./tado-proxy.toml`, then an
//! explicit path) and merged section by section. Every section is optional;
//! accessors such as [`TadoProxyConfig::server`] fill in defaults.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadOptions, LoadedConfig, load_config, load_config_file,
    load_config_with_options, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
