//! Config file discovery and loading
//!
//! Without `--config`, `wlosd.toml` is looked up in, in order:
//! `~/.wlosd/`, `$XDG_CONFIG_HOME/wlosd/`, `~/.config/wlosd/`, `/etc/xdg/wlosd/`.
//! No file at all means built-in defaults.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use wlosd_types::OsdConfig;

pub const CONFIG_FILE_NAME: &str = "wlosd.toml";

/// Errors while loading the config file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Directories searched for the config file, most specific first
pub fn search_dirs() -> Vec<PathBuf> {
    let home = dirs::home_dir();
    let candidates = [
        home.as_ref().map(|home| home.join(".wlosd")),
        std::env::var_os("XDG_CONFIG_HOME")
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join("wlosd")),
        home.as_ref().map(|home| home.join(".config").join("wlosd")),
        Some(PathBuf::from("/etc/xdg/wlosd")),
    ];

    let mut dirs = Vec::new();
    for dir in candidates.into_iter().flatten() {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// First existing config file in the search directories
pub fn find_config_file() -> Option<PathBuf> {
    search_dirs()
        .into_iter()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|path| path.is_file())
}

/// Load the config from `path`, or from the first file found in the search
/// directories. An explicit path must exist.
pub fn load(path: Option<&Path>) -> Result<OsdConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Some(path) => path,
            None => {
                debug!("No config file found, using defaults");
                return Ok(OsdConfig::default());
            }
        },
    };

    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = parse(&text, &path)?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

pub fn parse(text: &str, path: &Path) -> Result<OsdConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
