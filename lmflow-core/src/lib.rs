//! # lmflow - Evaluation of chained model pipelines
//!
//! lmflow evaluates ensembles of chained model-invocation stages against
//! authored fixtures and records a judgeable trace per fixture:
//! - A pipeline algebra of atomic, sequence and mux stages
//! - Fixture schemas derived from the pipeline shape
//! - A recursive evaluator keeping pipeline, fixture and trace in lockstep
//! - A harness running fixtures under a concurrency bound and writing run logs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lmflow_core::prelude::*;
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let count: Pipeline<String, u32> = Pipeline::atomic(
//!         "wordcount",
//!         "stage1model",
//!         |input: String, _: &Value| Conversation::user(input),
//!         |completion: String| async move { Ok(completion.trim().parse::<u32>()?) },
//!     )
//!     .judged_by_equality();
//!
//!     let config = EvalConfig::load()?;
//!     let harness = EvalHarness::from_config(&config).await?;
//!     let outcome = harness.run(count.node()).await?;
//!
//!     println!("run log: {}", outcome.path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **pipeline**: the immutable stage tree and the fixture schemas it derives
//! - **eval**: fixture loading, tag filters, evaluation, run logs
//! - **llm**: conversations, the provider trait, mock and OpenAI-compatible
//!   providers, and the model registry
//! - **config**: layered run configuration

pub mod config;
pub mod error;
pub mod eval;
pub mod llm;
pub mod pipeline;

pub use error::{LmFlowError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EvalConfig, OutputFormat};
    pub use crate::error::{LmFlowError, Result};
    pub use crate::eval::{
        CaseLog, EvalHarness, EvalRunConfig, Evaluator, ExpectedNode, Fixture, FixtureLoader,
        RunLog, RunOutcome, TagFilter, TraceNode,
    };
    pub use crate::llm::{
        Conversation, Exemplar, LLMProvider, LLMRequest, LLMResponse, Message, MessageRole,
        FunctionModels, MockProvider, ModelDefinition, ModelRegistry, OpenAIProvider,
    };
    pub use crate::pipeline::{FixtureDocumentSchema, MuxTask, Pipeline, PipelineNode};
}
