//! Model registry
//!
//! Resolves the model a stage asks for into a shared provider. Built once per
//! run, then only read, so a single registry can be shared by every
//! concurrently evaluating fixture.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LmFlowError, Result};
use crate::llm::mock::{Exemplar, MockProvider};
use crate::llm::providers::OpenAIProvider;
use crate::llm::LLMProvider;

/// One entry of a model-definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelDefinition {
    /// Deterministic exemplar-backed model
    Mock {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
        #[serde(default)]
        exemplars: Vec<Exemplar>,
    },

    /// A model registered in code under `name`
    Function { name: String },

    /// OpenAI-compatible chat-completions endpoint
    #[serde(rename = "openai")]
    OpenAI {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
    },
}

impl ModelDefinition {
    pub fn name(&self) -> &str {
        match self {
            ModelDefinition::Mock { name, .. }
            | ModelDefinition::Function { name }
            | ModelDefinition::OpenAI { name, .. } => name,
        }
    }

    /// Build the provider this definition describes
    ///
    /// `function` entries are looked up in `functions`, the models registered
    /// in code.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be created (e.g., missing API
    /// key, or a `function` entry naming no registered model)
    pub fn create(&self, functions: &FunctionModels) -> Result<Arc<dyn LLMProvider>> {
        match self {
            ModelDefinition::Function { name } => functions.get(name).cloned().ok_or_else(|| {
                LmFlowError::Configuration(format!(
                    "Model definition file references unknown function model '{}'",
                    name
                ))
            }),
            ModelDefinition::Mock {
                name,
                default,
                exemplars,
            } => {
                let mut provider = MockProvider::new(name).with_exemplars(exemplars.iter().cloned());
                if let Some(default) = default {
                    provider = provider.with_default(default);
                }
                Ok(Arc::new(provider))
            }
            ModelDefinition::OpenAI {
                name,
                model,
                base_url,
                api_key_env,
            } => {
                let mut provider =
                    OpenAIProvider::from_env(name, model.clone(), api_key_env.as_deref())?;
                if let Some(url) = base_url {
                    provider = provider.with_base_url(url);
                }
                Ok(Arc::new(provider))
            }
        }
    }
}

/// Models registered in code, by name
pub type FunctionModels = HashMap<String, Arc<dyn LLMProvider>>;

/// Registry of named models with optional per-stage overrides
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn LLMProvider>>,
    stage_overrides: HashMap<String, String>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.models.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry")
            .field("models", &names)
            .field("stage_overrides", &self.stage_overrides)
            .finish()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`, replacing any previous entry
    pub fn with_model(mut self, name: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.models.insert(name.into(), provider);
        self
    }

    /// Route every call from `stage` to `model`, whatever the stage asks for
    pub fn with_stage_override(mut self, stage: impl Into<String>, model: impl Into<String>) -> Self {
        self.stage_overrides.insert(stage.into(), model.into());
        self
    }

    pub fn with_stage_overrides(mut self, overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        self.stage_overrides.extend(overrides);
        self
    }

    /// Build a registry from parsed definitions.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names or when a provider cannot be created.
    pub fn from_definitions(definitions: &[ModelDefinition]) -> Result<Self> {
        Self::from_definitions_with(definitions, &FunctionModels::new())
    }

    /// Build a registry from parsed definitions plus the models registered
    /// in code.
    ///
    /// Every in-code model is registered. A `function` definition resolves to
    /// the in-code model of that name; any other definition must not reuse
    /// an in-code name.
    pub fn from_definitions_with(
        definitions: &[ModelDefinition],
        functions: &FunctionModels,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            let name = definition.name();
            if registry.models.contains_key(name) {
                return Err(LmFlowError::Configuration(format!(
                    "Model '{}' is defined more than once",
                    name
                )));
            }
            if functions.contains_key(name) && !matches!(definition, ModelDefinition::Function { .. }) {
                return Err(LmFlowError::Configuration(format!(
                    "Model '{}' is registered in code and defined in the model file",
                    name
                )));
            }
            registry = registry.with_model(name, definition.create(functions)?);
        }

        for (name, provider) in functions {
            if !registry.contains(name) {
                registry = registry.with_model(name.clone(), provider.clone());
            }
        }
        Ok(registry)
    }

    /// Load a YAML or JSON model-definition file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(path, &FunctionModels::new()).await
    }

    /// Load a model-definition file, resolving `function` entries against
    /// the models registered in code
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, is neither `.yaml`/`.yml` nor
    /// `.json`, or does not parse.
    pub async fn load_with(path: impl AsRef<Path>, functions: &FunctionModels) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let is_json = match extension.as_deref() {
            Some("yaml" | "yml") => false,
            Some("json") => true,
            _ => {
                return Err(LmFlowError::Configuration(format!(
                    "Model file {} must be YAML or JSON",
                    path.display()
                )));
            }
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LmFlowError::io(path, e))?;

        let definitions: Vec<ModelDefinition> = if is_json {
            serde_json::from_str(&text).map_err(|e| LmFlowError::Parse {
                file: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|e| LmFlowError::Parse {
                file: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        let registry = Self::from_definitions_with(&definitions, functions)?;
        tracing::info!(
            path = %path.display(),
            models = definitions.len(),
            in_code = functions.len(),
            "Loaded model definitions"
        );
        Ok(registry)
    }

    /// Resolve the provider for a stage.
    ///
    /// A stage override takes precedence over the model the stage names.
    pub fn get_model(&self, stage: &str, model: &str) -> Result<Arc<dyn LLMProvider>> {
        let resolved = self
            .stage_overrides
            .get(stage)
            .map(String::as_str)
            .unwrap_or(model);

        self.models
            .get(resolved)
            .cloned()
            .ok_or_else(|| LmFlowError::ModelNotFound {
                stage: stage.to_string(),
                model: resolved.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolved specifications of every registered model, ordered by name
    pub fn specs(&self) -> Vec<serde_json::Value> {
        let ordered: BTreeMap<_, _> = self.models.iter().collect();
        ordered.values().map(|provider| provider.spec()).collect()
    }
}
