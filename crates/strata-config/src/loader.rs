use std::ffi::OsString;
use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";

/// Locates, parses and validates the strata config file.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `<config_dir>/strata/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("strata").join("config.toml"))
    }

    /// Pick the config file: explicit flag, then `STRATA_CONFIG`, then the default path.
    pub fn resolve_path(flag: Option<&Path>) -> Result<PathBuf> {
        Self::resolve_path_from(
            flag,
            std::env::var_os(CONFIG_ENV_VAR),
            Self::default_path(),
        )
    }

    fn resolve_path_from(
        flag: Option<&Path>,
        env: Option<OsString>,
        default: Option<PathBuf>,
    ) -> Result<PathBuf> {
        if let Some(path) = flag {
            return Ok(path.to_path_buf());
        }
        if let Some(value) = env.filter(|v| !v.is_empty()) {
            debug!("using config from {CONFIG_ENV_VAR}");
            return Ok(PathBuf::from(value));
        }
        default.ok_or_else(|| {
            Error::Config(format!(
                "no config file given; pass --config or set {CONFIG_ENV_VAR}"
            ))
        })
    }

    /// Parse a config file by extension without validating it.
    pub fn parse(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("JSON parse error: {e}"))),
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}"))),
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }

    /// Parse, validate and resolve paths relative to the config file's directory.
    ///
    /// The migration folder must already exist.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let mut config = Self::parse(path)?;
        config.validate()?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.resolve_paths(base);

        if !config.migration.folder.is_dir() {
            return Err(Error::Config(format!(
                "migration folder {} is not found on disk",
                config.migration.folder.display()
            )));
        }

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Serialize `config` to `path`, choosing the format by extension.
    pub fn write(path: &Path, config: &AppConfig) -> Result<()> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let text = match ext {
            "json" => serde_json::to_string_pretty(config)
                .map_err(|e| Error::Config(format!("JSON encode error: {e}")))?,
            "yml" | "yaml" => serde_yaml::to_string(config)
                .map_err(|e| Error::Config(format!("YAML encode error: {e}")))?,
            "toml" => toml::to_string_pretty(config)
                .map_err(|e| Error::Config(format!("TOML encode error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
