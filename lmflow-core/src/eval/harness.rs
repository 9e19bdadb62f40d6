//! Evaluation harness for running fixtures
//!
//! The harness coordinates:
//! - Loading and selecting fixtures
//! - Evaluating each fixture against the pipeline under a concurrency bound
//! - Assembling and persisting the run log

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use super::engine::Evaluator;
use super::filter::TagFilter;
use super::fixture::{ContentHasher, FileEnumerator, Fixture, FixtureLoader, Sha256Hasher, WalkDirEnumerator};
use super::run_log::{CaseLog, FailureLog, RunIdentity, RunLog};
use super::trace::TraceNode;
use crate::config::{EvalConfig, OutputFormat};
use crate::error::{LmFlowError, Result};
use crate::llm::LLMProvider;
use crate::llm::registry::{FunctionModels, ModelRegistry};
use crate::pipeline::{FixtureDocumentSchema, PipelineNode};

/// Configuration for an evaluation run
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRunConfig {
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,

    /// Fixtures evaluated at once
    pub concurrency: usize,

    /// Files read at once
    pub load_concurrency: usize,

    /// Only report where the run log would go
    pub dry_run: bool,

    pub format: OutputFormat,

    /// Run-log file name; the run id when unset
    pub log_file: Option<String>,

    /// Whether one failing fixture fails the run
    pub fail_fast: bool,
}

impl Default for EvalRunConfig {
    fn default() -> Self {
        Self::from(&EvalConfig::default())
    }
}

impl From<&EvalConfig> for EvalRunConfig {
    fn from(config: &EvalConfig) -> Self {
        Self {
            input_folder: config.input_folder.clone(),
            output_folder: config.output_folder.clone(),
            concurrency: config.concurrency,
            load_concurrency: config.load_concurrency(),
            dry_run: config.dry_run,
            format: config.format,
            log_file: config.log_file.clone(),
            fail_fast: config.fail_fast,
        }
    }
}

/// Result of an evaluation run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub log: RunLog,

    /// Where the run log was, or under dry run would have been, written
    pub path: PathBuf,

    /// Whether the run log was written
    pub persisted: bool,
}

/// Evaluation harness
pub struct EvalHarness {
    config: EvalRunConfig,
    models: Arc<ModelRegistry>,
    enumerator: Arc<dyn FileEnumerator>,
    hasher: Arc<dyn ContentHasher>,
    filter: TagFilter,
}

impl std::fmt::Debug for EvalHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalHarness")
            .field("config", &self.config)
            .field("models", &self.models)
            .field("filter", &self.filter)
            .finish()
    }
}

impl EvalHarness {
    pub fn new(config: EvalRunConfig, models: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            models,
            enumerator: Arc::new(WalkDirEnumerator),
            hasher: Arc::new(Sha256Hasher),
            filter: TagFilter::Always,
        }
    }

    /// Build a harness from loaded configuration: reads the model-definition
    /// file, applies stage overrides and parses the tag filter.
    pub async fn from_config(config: &EvalConfig) -> Result<Self> {
        Self::from_config_with_models(config, FunctionModels::new()).await
    }

    /// Like [`EvalHarness::from_config`], with extra models registered in
    /// code. They join the file's models and back its `function` entries.
    pub async fn from_config_with_models(
        config: &EvalConfig,
        models: impl IntoIterator<Item = (String, Arc<dyn LLMProvider>)>,
    ) -> Result<Self> {
        config.validate()?;

        let functions: FunctionModels = models.into_iter().collect();
        let models = ModelRegistry::load_with(&config.models_file, &functions)
            .await?
            .with_stage_overrides(config.stage_models.clone());

        let filter = match &config.filter {
            Some(expression) => TagFilter::parse(expression)?,
            None => TagFilter::Always,
        };

        Ok(Self::new(EvalRunConfig::from(config), Arc::new(models)).with_filter(filter))
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn FileEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_filter(mut self, filter: TagFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &EvalRunConfig {
        &self.config
    }

    /// Load the fixtures selected for `pipeline`
    pub async fn load_fixtures(&self, pipeline: &PipelineNode) -> Result<Vec<Fixture>> {
        FixtureLoader::new(&self.config.input_folder, FixtureDocumentSchema::derive(pipeline))
            .with_enumerator(self.enumerator.clone())
            .with_hasher(self.hasher.clone())
            .with_filter(self.filter.clone())
            .with_concurrency(self.config.load_concurrency)
            .load()
            .await
    }

    /// Evaluate every selected fixture and persist the run log.
    ///
    /// Loading errors abort before any evaluation. Every admitted fixture
    /// runs to completion; with `fail_fast` the first failure in discovery
    /// order then fails the run and nothing is written.
    pub async fn run(&self, pipeline: &PipelineNode) -> Result<RunOutcome> {
        if self.config.concurrency == 0 {
            return Err(LmFlowError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let identity = RunIdentity::current();
        let fixtures = self.load_fixtures(pipeline).await?;
        tracing::info!(
            run_id = %identity.run_id,
            fixtures = fixtures.len(),
            concurrency = self.config.concurrency,
            "Starting evaluation run"
        );

        let traces = self.evaluate_all(pipeline, &fixtures).await;

        let mut cases = Vec::new();
        let mut failures = Vec::new();
        for (fixture, result) in fixtures.into_iter().zip(traces) {
            match result {
                Ok(trace) => cases.push(CaseLog {
                    fixture_id: fixture.fixture_id,
                    content_hash: fixture.content_hash,
                    trace,
                }),
                Err(err) if self.config.fail_fast => return Err(err),
                Err(err) => {
                    tracing::warn!(fixture_id = %fixture.fixture_id, error = %err, "Fixture failed");
                    failures.push(FailureLog {
                        fixture_id: fixture.fixture_id,
                        content_hash: fixture.content_hash,
                        error: err.to_string(),
                    });
                }
            }
        }

        let log = RunLog {
            identity,
            models: self.models.specs(),
            cases,
            failures,
        };

        let path = self.log_path(&log);
        if self.config.dry_run {
            tracing::info!(path = %path.display(), "Dry run: ready to save run log");
            return Ok(RunOutcome {
                log,
                path,
                persisted: false,
            });
        }

        self.persist(&log, &path).await?;
        tracing::info!(
            path = %path.display(),
            cases = log.cases.len(),
            failures = log.failures.len(),
            "Saved run log"
        );

        Ok(RunOutcome {
            log,
            path,
            persisted: true,
        })
    }

    async fn evaluate_all(&self, pipeline: &PipelineNode, fixtures: &[Fixture]) -> Vec<Result<TraceNode>> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let evaluator = Evaluator::new(&self.models);

        let runs = fixtures.iter().map(|fixture| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| LmFlowError::Other("Failed to acquire semaphore".to_string()))?;

                tracing::debug!(fixture_id = %fixture.fixture_id, "Evaluating fixture");
                evaluator
                    .run(pipeline, fixture.input.clone(), &fixture.context, &fixture.expected)
                    .await
                    .map_err(|e| e.in_fixture(&fixture.fixture_id))
            }
        });

        join_all(runs).await
    }

    /// `<output_folder>/<log_file or run id>.<extension>`
    ///
    /// A run-log extension already on `log_file` is replaced by the one of
    /// the configured format.
    pub fn log_path(&self, log: &RunLog) -> PathBuf {
        let stem = match &self.config.log_file {
            Some(name) => strip_log_extension(name).to_string(),
            None => log.run_id().to_string(),
        };
        self.config
            .output_folder
            .join(format!("{}.{}", stem, self.config.format.extension()))
    }

    async fn persist(&self, log: &RunLog, path: &Path) -> Result<()> {
        let content = match self.config.format {
            OutputFormat::Yaml => serde_yaml::to_string(log)?,
            OutputFormat::Json => serde_json::to_string_pretty(log)?,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LmFlowError::io(parent, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| LmFlowError::io(path, e))
    }

    /// Delete every file in the output folder.
    ///
    /// Without `force` nothing is deleted; the files that would be are
    /// returned either way.
    pub async fn clean(&self, force: bool) -> Result<Vec<PathBuf>> {
        let folder = &self.config.output_folder;
        let mut entries = match tokio::fs::read_dir(folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LmFlowError::io(folder, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LmFlowError::io(folder, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| LmFlowError::io(entry.path(), e))?
                .is_file();
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        for file in &files {
            if force {
                tokio::fs::remove_file(file)
                    .await
                    .map_err(|e| LmFlowError::io(file, e))?;
                tracing::info!(path = %file.display(), "Deleted");
            } else {
                tracing::info!(path = %file.display(), "Would delete");
            }
        }

        Ok(files)
    }
}

fn strip_log_extension(name: &str) -> &str {
    let known = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ["yaml", "yml", "json"].iter().any(|k| ext.eq_ignore_ascii_case(k)));
    match name.rsplit_once('.') {
        Some((stem, _)) if known && !stem.is_empty() => stem,
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_log_extensions_stripped() {
        assert_eq!(strip_log_extension("nightly"), "nightly");
        assert_eq!(strip_log_extension("nightly.json"), "nightly");
        assert_eq!(strip_log_extension("nightly.YAML"), "nightly");
        assert_eq!(strip_log_extension("nightly.yml"), "nightly");
        assert_eq!(strip_log_extension("v1.2"), "v1.2");
        assert_eq!(strip_log_extension(".json"), ".json");
    }
}
