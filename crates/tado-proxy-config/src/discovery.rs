//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/tado-proxy/config.toml` (user config)
//! 2. `./tado-proxy.toml` (working directory)
//! 3. An explicit `--config` file
//! 4. CLI flags and environment variables (handled by the binary)

use std::path::{Path, PathBuf};

use crate::types::APP_NAME;
use crate::{ConfigError, Result, TadoProxyConfig};

/// Config filename in the working directory.
const LOCAL_CONFIG_FILE: &str = "tado-proxy.toml";

/// Config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the user config directory.
const CONFIG_DIR_ENV: &str = "TADO_PROXY_CONFIG_DIR";

/// Where a config layer was looked for.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and merged.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: TadoProxyConfig,
    /// Sources that were checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Problems with optional layers, reported instead of failing.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Options for [`load_config_with_options`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions<'a> {
    /// Overrides `TADO_PROXY_CONFIG_DIR` and the platform default.
    pub config_dir: Option<&'a Path>,
    /// Directory searched for `tado-proxy.toml`. Defaults to the working directory.
    pub local_dir: Option<&'a Path>,
    /// A file that must exist and parse.
    pub explicit: Option<&'a Path>,
}

/// Discover and merge all config layers with default options.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(LoadOptions {
        explicit,
        ..Default::default()
    })
}

/// Discover and merge config layers.
///
/// Unreadable or malformed user and local files become warnings. An
/// explicit file that cannot be loaded is an error, as is a merged
/// config that fails validation.
pub fn load_config_with_options(options: LoadOptions<'_>) -> Result<LoadedConfig> {
    let mut config = TadoProxyConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match options.config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => xdg_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let local_path = options
        .local_dir
        .map(|d| d.join(LOCAL_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE));
    sources.push(load_layer(&mut config, &local_path, &mut warnings));

    if let Some(path) = options.explicit {
        config.merge(load_config_file(path)?);
        sources.push(ConfigSource {
            path: path.to_path_buf(),
            loaded: true,
        });
    }

    config.validate()?;

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load one config file (no discovery).
pub fn load_config_file(path: &Path) -> Result<TadoProxyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    TadoProxyConfig::from_toml(&contents)
}

pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory.
///
/// Checks `TADO_PROXY_CONFIG_DIR` first, then the platform default.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn load_layer(config: &mut TadoProxyConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    let mut source = ConfigSource {
        path: path.to_path_buf(),
        loaded: false,
    };
    if !path.is_file() {
        return source;
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            source.loaded = true;
        }
        Err(e) => warnings.push(format!("Failed to load {}: {}", path.display(), e)),
    }
    source
}
