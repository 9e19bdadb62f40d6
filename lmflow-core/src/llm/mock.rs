//! Deterministic mock model
//!
//! Answers prompts from a fixed list of exemplars, so pipelines can be
//! evaluated offline and reproducibly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LmFlowError, Result};
use crate::llm::{LLMProvider, LLMRequest, LLMResponse, MessageRole, ModelInfo};

/// A canned prompt → completion pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    pub prompt: String,
    pub completion: String,
}

impl Exemplar {
    pub fn new(prompt: impl Into<String>, completion: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            completion: completion.into(),
        }
    }
}

/// Mock model answering from exemplars.
///
/// Matching is done against the last user message: an exemplar whose prompt
/// equals it wins, otherwise the first exemplar whose prompt it contains.
/// With no match the default completion is returned, or an error if there is
/// none.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    default: Option<String>,
    exemplars: Vec<Exemplar>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            exemplars: Vec::new(),
        }
    }

    /// Completion returned when no exemplar matches
    pub fn with_default(mut self, completion: impl Into<String>) -> Self {
        self.default = Some(completion.into());
        self
    }

    pub fn with_exemplar(
        mut self,
        prompt: impl Into<String>,
        completion: impl Into<String>,
    ) -> Self {
        self.exemplars.push(Exemplar::new(prompt, completion));
        self
    }

    pub fn with_exemplars(mut self, exemplars: impl IntoIterator<Item = Exemplar>) -> Self {
        self.exemplars.extend(exemplars);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, text: &str) -> Option<&str> {
        self.exemplars
            .iter()
            .find(|e| e.prompt == text)
            .or_else(|| self.exemplars.iter().find(|e| text.contains(&e.prompt)))
            .map(|e| e.completion.as_str())
            .or(self.default.as_deref())
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let content = self.lookup(text).ok_or_else(|| {
            LmFlowError::Other(format!(
                "Mock model '{}' has no completion for prompt {:?}",
                self.name, text
            ))
        })?;

        Ok(LLMResponse {
            content: content.to_string(),
            usage: None,
        })
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "mock".to_string(),
            model_name: self.name.clone(),
        }
    }

    fn spec(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "mock",
            "name": self.name,
            "default": self.default,
            "exemplars": self.exemplars,
        })
    }
}
