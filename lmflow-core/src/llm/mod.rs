use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    fn marker(self) -> &'static str {
        match self {
            MessageRole::System => "[system]",
            MessageRole::User => "[user]",
            MessageRole::Assistant => "[assistant]",
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A rendered prompt: the ordered messages sent to a model.
///
/// Serializes as a plain list of `{role, content}` objects so it reads
/// naturally inside a run log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new().with_user(content)
    }

    pub fn with_system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(MessageRole::System, content));
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(MessageRole::User, content));
        self
    }

    pub fn with_assistant(mut self, content: impl Into<String>) -> Self {
        self.messages
            .push(Message::new(MessageRole::Assistant, content));
        self
    }

    /// Parse a role-marked prompt template.
    ///
    /// Lines starting with `[system]`, `[user]` or `[assistant]` open a new
    /// message; following lines are appended to it. Text before the first
    /// marker becomes a user message.
    ///
    /// ```
    /// use lmflow_core::llm::{Conversation, MessageRole};
    ///
    /// let prompt = Conversation::parse("[system] Count words.\n[user] hello, world");
    /// assert_eq!(prompt.messages().len(), 2);
    /// assert_eq!(prompt.messages()[1].role, MessageRole::User);
    /// ```
    pub fn parse(text: &str) -> Self {
        const ROLES: [MessageRole; 3] =
            [MessageRole::System, MessageRole::User, MessageRole::Assistant];

        let mut messages: Vec<Message> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim_start();
            let opened = ROLES.iter().find_map(|role| {
                trimmed
                    .strip_prefix(role.marker())
                    .map(|rest| Message::new(*role, rest.trim_start()))
            });

            if let Some(message) = opened {
                messages.push(message);
                continue;
            }

            match messages.last_mut() {
                Some(current) => {
                    current.content.push('\n');
                    current.content.push_str(line);
                }
                None if trimmed.is_empty() => {}
                None => messages.push(Message::new(MessageRole::User, line)),
            }
        }

        for message in &mut messages {
            message.content = message.content.trim().to_string();
        }

        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Content of the last user message, if any
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

/// Request to an LLM provider
#[derive(Debug, Clone)]
pub struct LLMRequest {
    /// Messages in the conversation
    pub messages: Vec<Message>,

    /// Temperature for generation (0.0-2.0)
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    pub max_tokens: Option<usize>,

    /// Stop sequences
    pub stop_sequences: Vec<String>,
}

impl LLMRequest {
    /// Create a request carrying every message of a conversation
    pub fn from_conversation(conversation: &Conversation) -> Self {
        Self {
            messages: conversation.messages().to_vec(),
            temperature: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
        }
    }
}

/// Response from an LLM provider
#[derive(Debug, Clone)]
pub struct LLMResponse {
    /// Generated content
    pub content: String,

    /// Token usage information
    pub usage: Option<TokenUsage>,
}

/// Token usage information
#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Trait for model implementations.
///
/// The evaluation engine only needs [`LLMProvider::complete`]; providers talk
/// to their backend in [`LLMProvider::generate_request`]. Implementations are
/// shared between concurrently evaluating fixtures and must not rely on
/// per-call mutable state.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion from a structured request.
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse>;

    /// Complete a rendered prompt, returning the raw completion text.
    async fn complete(&self, prompt: &Conversation) -> Result<String> {
        let response = self
            .generate_request(&LLMRequest::from_conversation(prompt))
            .await?;
        Ok(response.content)
    }

    /// Get model information
    fn model_info(&self) -> ModelInfo;

    /// Resolved specification recorded in the run log.
    fn spec(&self) -> serde_json::Value {
        let info = self.model_info();
        serde_json::json!({
            "provider": info.provider,
            "model": info.model_name,
        })
    }
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

pub mod mock;
pub mod providers;
pub mod registry;

pub use mock::{Exemplar, MockProvider};
pub use providers::OpenAIProvider;
pub use registry::{FunctionModels, ModelDefinition, ModelRegistry};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role_markers() {
        let prompt = Conversation::parse(
            "[system] You are an assistant that counts words.\n[user] hello, world\n",
        );

        assert_eq!(
            prompt.messages(),
            &[
                Message::new(MessageRole::System, "You are an assistant that counts words."),
                Message::new(MessageRole::User, "hello, world"),
            ]
        );
        assert_eq!(prompt.last_user(), Some("hello, world"));
    }

    #[test]
    fn test_parse_multiline_and_unmarked() {
        let prompt = Conversation::parse("plain text\n[assistant] first\nsecond line");

        assert_eq!(prompt.messages().len(), 2);
        assert_eq!(prompt.messages()[0].role, MessageRole::User);
        assert_eq!(prompt.messages()[1].content, "first\nsecond line");
        assert_eq!(prompt.last_user(), Some("plain text"));
    }

    #[test]
    fn test_conversation_serializes_as_list() {
        let prompt = Conversation::user("hi").with_system("be brief");
        let value = serde_json::to_value(&prompt).unwrap();

        assert_eq!(
            value,
            serde_json::json!([
                {"role": "user", "content": "hi"},
                {"role": "system", "content": "be brief"},
            ])
        );
    }

    #[test]
    fn test_few_shot_prompt_ends_with_user_turn() {
        let prompt = Conversation::new()
            .with_system("Count the words.")
            .with_user("one two")
            .with_assistant("2")
            .with_user("one two three");

        let roles: Vec<_> = prompt.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
            ]
        );
        assert_eq!(prompt.last_user(), Some("one two three"));
        assert_eq!(
            prompt,
            Conversation::parse(
                "[system] Count the words.\n[user] one two\n[assistant] 2\n[user] one two three"
            )
        );
    }

    #[tokio::test]
    async fn test_complete_uses_generate_request() {
        struct Echo;

        #[async_trait]
        impl LLMProvider for Echo {
            async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
                Ok(LLMResponse {
                    content: format!("{} messages", request.messages.len()),
                    usage: None,
                })
            }

            fn model_info(&self) -> ModelInfo {
                ModelInfo {
                    provider: "echo".to_string(),
                    model_name: "echo".to_string(),
                }
            }
        }

        let completion = Echo
            .complete(&Conversation::user("a").with_user("b"))
            .await
            .unwrap();
        assert_eq!(completion, "2 messages");
        assert_eq!(Echo.spec()["provider"], "echo");
    }
}
