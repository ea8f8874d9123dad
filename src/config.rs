use crate::{decode::DecodeOptions, error::PromptError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Global static variable to hold the config provider.
pub static CONFIG_PROVIDER: OnceCell<Mutex<Arc<dyn ConfigProvider>>> = OnceCell::new();

/// Overrides [`PromptConfig::prompts_dir`] when set.
pub const PROMPT_DIR_ENV: &str = "TOML_PROMPT_DIR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Base directory relative prompt file paths are resolved against.
    pub prompts_dir: Option<PathBuf>,
    /// Seed used when none is given on the command line.
    pub seed: Option<u64>,
    /// Selector read when none is given on the command line.
    pub selector_file: Option<PathBuf>,
    pub decode: DecodeOptions,
}

impl PromptConfig {
    /// Apply `TOML_PROMPT_DIR`, if set.
    pub fn with_env(mut self) -> Self {
        if let Some(dir) = env::var_os(PROMPT_DIR_ENV).filter(|d| !d.is_empty()) {
            tracing::debug!("{} overrides prompts_dir: {:?}", PROMPT_DIR_ENV, dir);
            self.prompts_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// `path` as is when absolute or when no prompts dir is configured, else joined onto it.
    pub fn resolve_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        match &self.prompts_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<PromptConfig, PromptError>;
    fn set_config(&self, config: &PromptConfig) -> Result<(), PromptError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<PromptConfig, PromptError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(PromptConfig::default());
        }
        let content = read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| PromptError::Config(format!("{:?}: {}", self.path, e)))
    }

    fn set_config(&self, config: &PromptConfig) -> Result<(), PromptError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

/// Install `provider` as the process-wide provider. Later calls are ignored.
pub fn install_provider(provider: Arc<dyn ConfigProvider>) {
    if CONFIG_PROVIDER.set(Mutex::new(provider)).is_err() {
        tracing::debug!("Config provider already installed");
    }
}

/// Config from the installed provider, or defaults when none is installed. Env overrides applied.
pub fn current_config() -> Result<PromptConfig, PromptError> {
    let config = match CONFIG_PROVIDER.get() {
        Some(provider) => {
            let provider = provider
                .lock()
                .map_err(|e| PromptError::Config(format!("config provider lock poisoned: {e}")))?
                .clone();
            provider.get_config()?
        }
        None => PromptConfig::default(),
    };
    Ok(config.with_env())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_log::test;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("absent.toml"));
        let config = provider.get_config().unwrap();
        assert_eq!(config, PromptConfig::default());
        assert!(config.decode.strip_comments);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempdir().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("config.toml"));
        let config = PromptConfig {
            prompts_dir: Some(PathBuf::from("/srv/prompts")),
            seed: Some(12),
            selector_file: None,
            decode: DecodeOptions {
                strip_comments: false,
                inline_choices: true,
            },
        };
        provider.set_config(&config).unwrap();
        assert_eq!(provider.get_config().unwrap(), config);
    }

    #[test]
    fn test_partial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "seed = 5\n").unwrap();
        let config = TomlConfigProvider::new(path).get_config().unwrap();
        assert_eq!(config.seed, Some(5));
        assert_eq!(config.prompts_dir, None);
        assert!(config.decode.inline_choices);
    }

    #[test]
    fn test_bad_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "seed = \"five\"\n").unwrap();
        let result = TomlConfigProvider::new(path).get_config();
        assert!(matches!(result, Err(PromptError::Config(_))));
    }

    #[test]
    fn test_resolve_path() {
        let config = PromptConfig {
            prompts_dir: Some(PathBuf::from("prompts")),
            ..PromptConfig::default()
        };
        assert_eq!(config.resolve_path("a/b.toml"), PathBuf::from("prompts/a/b.toml"));
        assert_eq!(config.resolve_path("/abs.toml"), PathBuf::from("/abs.toml"));
        assert_eq!(PromptConfig::default().resolve_path("x.toml"), PathBuf::from("x.toml"));
    }
}
