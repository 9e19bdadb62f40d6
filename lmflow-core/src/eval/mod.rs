//! Offline evaluation of pipelines against authored fixtures
//!
//! This module provides:
//! - Fixture loading: read, hash, identify and validate fixture files
//!   against the shape of the pipeline
//! - Tag filters selecting the fixtures of a run
//! - The evaluator, walking a pipeline and a fixture in lockstep to build a
//!   trace
//! - The harness, running every selected fixture under a concurrency bound
//!   and persisting the run log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lmflow_core::eval::{EvalHarness, EvalRunConfig};
//! use lmflow_core::llm::{Conversation, ModelRegistry};
//! use lmflow_core::pipeline::Pipeline;
//! use serde_json::Value;
//!
//! # async fn example() -> lmflow_core::Result<()> {
//! let pipeline: Pipeline<String, String> = Pipeline::atomic(
//!     "echo",
//!     "mock",
//!     |input: String, _: &Value| Conversation::user(input),
//!     |completion: String| async move { Ok(completion) },
//! );
//!
//! let models = ModelRegistry::load("data/models.yaml").await?;
//! let harness = EvalHarness::new(EvalRunConfig::default(), Arc::new(models));
//!
//! let outcome = harness.run(pipeline.node()).await?;
//! println!("{} cases written to {}", outcome.log.cases.len(), outcome.path.display());
//! # Ok(())
//! # }
//! ```

mod engine;
mod filter;
mod fixture;
mod harness;
mod run_log;
mod trace;

pub use engine::{Evaluator, ROOT_PATH};
pub use filter::TagFilter;
pub use fixture::{
    CONTENT_HASH_FIELD, ContentHasher, ExpectedNode, FIXTURE_ID_FIELD, FileEnumerator, Fixture,
    FixtureLoader, Sha256Hasher, WalkDirEnumerator, fixture_id_for,
};
pub use harness::{EvalHarness, EvalRunConfig, RunOutcome};
pub use run_log::{CaseLog, FailureLog, RunIdentity, RunLog};
pub use trace::{MuxBranchTrace, TraceNode};
