//! Configuration for evaluation runs

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{LmFlowError, Result};

/// Default configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "lmflow.toml";

/// Environment variable naming an alternative configuration file
pub const CONFIG_PATH_ENV: &str = "LMFLOW_CONFIG_PATH";

/// Serialization format of the run log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Yaml => "yaml",
            OutputFormat::Json => "json",
        }
    }
}

/// Main configuration for an evaluation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Root folder of fixture files
    pub input_folder: PathBuf,

    /// Folder receiving run logs
    pub output_folder: PathBuf,

    /// Maximum number of fixtures evaluated at once
    pub concurrency: usize,

    /// Maximum number of fixture files read at once (defaults to `concurrency`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_concurrency: Option<usize>,

    /// Model-definition file
    pub models_file: PathBuf,

    /// Tag expression selecting fixtures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Report the run-log path without writing it
    pub dry_run: bool,

    pub format: OutputFormat,

    /// Run-log file name (defaults to the run id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    /// Fail the run on the first failing fixture instead of logging failures
    pub fail_fast: bool,

    /// Per-stage model overrides, stage name to model name
    pub stage_models: HashMap<String, String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            input_folder: PathBuf::from("./data/cases"),
            output_folder: PathBuf::from("./data/runs"),
            concurrency: 4,
            load_concurrency: None,
            models_file: PathBuf::from("./data/models.yaml"),
            filter: None,
            dry_run: false,
            format: OutputFormat::Yaml,
            log_file: None,
            fail_fast: true,
            stage_models: HashMap::new(),
        }
    }
}

impl EvalConfig {
    /// Layered configuration sources.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `lmflow.toml`, then `config_path` or the file named by `LMFLOW_CONFIG_PATH`
    /// 3. `LMFLOW_*` environment variables
    ///
    /// Callers may merge further providers (e.g. command-line flags) before
    /// extracting with [`EvalConfig::from_figment`].
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EvalConfig::default()))
            .merge(Toml::file(CONFIG_FILE));

        match config_path {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        figment.merge(Env::prefixed("LMFLOW_").ignore(&["CONFIG_PATH"]))
    }

    /// Load configuration from file and environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment(None))
    }

    /// Load configuration from a specific file path, without environment
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(EvalConfig::default()))
                .merge(Toml::file(path.as_ref())),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: EvalConfig = figment.extract().map_err(|e| {
            LmFlowError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Fixture-loading pool size
    pub fn load_concurrency(&self) -> usize {
        self.load_concurrency.unwrap_or(self.concurrency)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a concurrency bound is zero.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(LmFlowError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.load_concurrency == Some(0) {
            return Err(LmFlowError::Configuration(
                "load_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
