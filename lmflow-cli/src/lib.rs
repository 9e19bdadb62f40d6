//! lmflow CLI - run pipeline evaluations from the command line
//!
//! A pipeline is Rust code, so each project builds its own binary around
//! [`run`]:
//!
//! ```rust,no_run
//! # fn build_pipeline() -> lmflow_core::pipeline::Pipeline<String, String> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = build_pipeline();
//!     lmflow_cli::run(pipeline.node()).await
//! }
//! ```
//!
//! Models implemented in Rust are passed to [`run_with_models`]; the
//! model-definition file refers to them with `{type: function, name: ...}`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use figment::providers::Serialized;
use lmflow_core::config::{EvalConfig, OutputFormat};
use lmflow_core::eval::{EvalHarness, EvalRunConfig};
use lmflow_core::llm::{LLMProvider, ModelRegistry};
use lmflow_core::pipeline::PipelineNode;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "lmflow")]
#[command(about = "Evaluate model pipelines against fixtures", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Evaluate the pipeline against every selected fixture
    Eval(EvalArgs),
    /// Delete run logs from the output folder
    Clean {
        /// Actually delete; otherwise only list
        #[arg(short = 'x', long)]
        force: bool,

        /// Output folder
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file
        #[arg(long, env = "LMFLOW_CONFIG_PATH")]
        config: Option<PathBuf>,
    },
    /// Version information
    Version,
}

#[derive(Debug, Default, Args)]
pub struct EvalArgs {
    /// Fixtures evaluated at once
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Report where the run log would go without writing it
    #[arg(short, long)]
    pub dry_run: bool,

    /// Tag expression selecting fixtures, e.g. "smoke & !slow"
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Fixture folder
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Write the run log as JSON instead of YAML
    #[arg(short, long)]
    pub json: bool,

    /// Run-log file name (defaults to the run id)
    #[arg(short, long)]
    pub log_file: Option<String>,

    /// Model-definition file
    #[arg(short, long)]
    pub models: Option<PathBuf>,

    /// Output folder
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file
    #[arg(long, env = "LMFLOW_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Record failing fixtures in the run log instead of stopping the run
    #[arg(long)]
    pub keep_going: bool,
}

/// Command-line values layered over file and environment configuration
#[derive(Debug, Default, PartialEq, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    input_folder: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_folder: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    models_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fail_fast: Option<bool>,
}

impl EvalArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            input_folder: self.input.clone(),
            output_folder: self.output.clone(),
            concurrency: self.concurrency,
            models_file: self.models.clone(),
            filter: self.filter.clone(),
            dry_run: self.dry_run.then_some(true),
            format: self.json.then_some(OutputFormat::Json),
            log_file: self.log_file.clone(),
            fail_fast: self.keep_going.then_some(false),
        }
    }

    /// Resolve the full configuration: defaults, files, environment, flags
    pub fn resolve(&self) -> Result<EvalConfig> {
        let figment = EvalConfig::figment(self.config.as_deref())
            .merge(Serialized::globals(self.overrides()));
        Ok(EvalConfig::from_figment(figment)?)
    }
}

/// Parse the process arguments and run the chosen command against `pipeline`
pub async fn run(pipeline: &PipelineNode) -> Result<()> {
    run_with_models(pipeline, Vec::new()).await
}

/// Like [`run`], with models registered in code next to the model file's
pub async fn run_with_models(
    pipeline: &PipelineNode,
    models: Vec<(String, Arc<dyn LLMProvider>)>,
) -> Result<()> {
    run_with(Cli::parse(), pipeline, models).await
}

pub async fn run_with(
    cli: Cli,
    pipeline: &PipelineNode,
    models: Vec<(String, Arc<dyn LLMProvider>)>,
) -> Result<()> {
    match cli.command {
        Commands::Eval(args) => eval(&args, pipeline, models).await,
        Commands::Clean {
            force,
            output,
            config,
        } => {
            let args = EvalArgs {
                output,
                config,
                ..EvalArgs::default()
            };
            clean(&args, force).await
        }
        Commands::Version => {
            println!("lmflow {}", env!("CARGO_PKG_VERSION"));
            println!("lmflow-core {}", lmflow_core::VERSION);
            Ok(())
        }
    }
}

async fn eval(
    args: &EvalArgs,
    pipeline: &PipelineNode,
    models: Vec<(String, Arc<dyn LLMProvider>)>,
) -> Result<()> {
    let config = args.resolve()?;
    tracing::debug!(?config, "Resolved configuration");

    let harness = EvalHarness::from_config_with_models(&config, models)
        .await
        .context("Failed to prepare evaluation")?;
    let outcome = harness.run(pipeline).await?;

    if outcome.persisted {
        println!(
            "Evaluated {} fixtures; run log saved to {}",
            outcome.log.cases.len(),
            outcome.path.display()
        );
    } else {
        println!(
            "Evaluated {} fixtures; dry run, run log would be saved to {}",
            outcome.log.cases.len(),
            outcome.path.display()
        );
    }

    if !outcome.log.is_success() {
        for failure in &outcome.log.failures {
            eprintln!("FAILED {}: {}", failure.fixture_id, failure.error);
        }
        bail!("{} fixtures failed", outcome.log.failures.len());
    }
    Ok(())
}

async fn clean(args: &EvalArgs, force: bool) -> Result<()> {
    let config = args.resolve()?;
    let harness = EvalHarness::new(EvalRunConfig::from(&config), Arc::new(ModelRegistry::new()));
    let files = harness.clean(force).await?;

    let verb = if force { "Deleted" } else { "Would delete" };
    for file in &files {
        println!("{} {}", verb, file.display());
    }
    if !force && !files.is_empty() {
        println!("Pass --force to delete {} files", files.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmflow_core::llm::{Conversation, Exemplar, MockProvider};
    use lmflow_core::pipeline::Pipeline;
    use serde_json::Value;

    #[test]
    fn test_eval_flags_parse() {
        let cli = Cli::try_parse_from([
            "lmflow", "eval", "-c", "8", "-d", "-f", "smoke & !slow", "-i", "cases", "-j", "-l",
            "nightly", "-m", "models.json", "-o", "runs", "--keep-going",
        ])
        .unwrap();

        let Commands::Eval(args) = cli.command else {
            panic!("expected eval command");
        };
        assert_eq!(
            args.overrides(),
            Overrides {
                input_folder: Some(PathBuf::from("cases")),
                output_folder: Some(PathBuf::from("runs")),
                concurrency: Some(8),
                models_file: Some(PathBuf::from("models.json")),
                filter: Some("smoke & !slow".to_string()),
                dry_run: Some(true),
                format: Some(OutputFormat::Json),
                log_file: Some("nightly".to_string()),
                fail_fast: Some(false),
            }
        );
    }

    #[test]
    fn test_unset_flags_do_not_override() {
        let cli = Cli::try_parse_from(["lmflow", "eval"]).unwrap();
        let Commands::Eval(args) = cli.command else {
            panic!("expected eval command");
        };
        assert_eq!(args.overrides(), Overrides::default());
    }

    #[test]
    fn test_clean_flags_parse() {
        let cli = Cli::try_parse_from(["lmflow", "clean", "-x", "-o", "runs"]).unwrap();
        match cli.command {
            Commands::Clean { force, output, .. } => {
                assert!(force);
                assert_eq!(output, Some(PathBuf::from("runs")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eval_command_writes_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("cases")).await.unwrap();
        tokio::fs::write(
            root.join("models.yaml"),
            "- type: mock\n  name: echo\n  exemplars:\n    - {prompt: hi, completion: HI}\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            root.join("cases").join("hi.yaml"),
            "input: hi\nexpected: {type: atomic, name: shout, expected: HI}\n",
        )
        .await
        .unwrap();

        let shout: Pipeline<String, String> = Pipeline::atomic(
            "shout",
            "echo",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion) },
        )
        .judged_by_equality();

        let arg = |name: &str| root.join(name).to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "lmflow".to_string(),
            "eval".to_string(),
            "-i".to_string(),
            arg("cases"),
            "-o".to_string(),
            arg("runs"),
            "-m".to_string(),
            arg("models.yaml"),
            "-l".to_string(),
            "out".to_string(),
        ])
        .unwrap();

        run_with(cli, shout.node(), Vec::new()).await.unwrap();
        assert!(root.join("runs").join("out.yaml").exists());

        let cli = Cli::try_parse_from(["lmflow".to_string(), "clean".to_string(), "-x".to_string(), "-o".to_string(), arg("runs")])
            .unwrap();
        run_with(cli, shout.node(), Vec::new()).await.unwrap();
        assert!(!root.join("runs").join("out.yaml").exists());
    }

    #[tokio::test]
    async fn test_eval_command_uses_in_code_models() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("cases")).await.unwrap();
        tokio::fs::write(
            root.join("models.yaml"),
            "- type: function\n  name: shouter\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            root.join("cases").join("hey.yaml"),
            "input: hey\nexpected: {type: atomic, name: shout, expected: HEY}\n",
        )
        .await
        .unwrap();

        let shout: Pipeline<String, String> = Pipeline::atomic(
            "shout",
            "shouter",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion) },
        )
        .judged_by_equality();
        let shouter: Arc<dyn LLMProvider> = Arc::new(
            MockProvider::new("shouter").with_exemplars([Exemplar::new("hey", "HEY")]),
        );

        let arg = |name: &str| root.join(name).to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "lmflow".to_string(),
            "eval".to_string(),
            "-i".to_string(),
            arg("cases"),
            "-o".to_string(),
            arg("runs"),
            "-m".to_string(),
            arg("models.yaml"),
            "-l".to_string(),
            "in-code.json".to_string(),
            "-j".to_string(),
        ])
        .unwrap();

        run_with(cli, shout.node(), vec![("shouter".to_string(), shouter)])
            .await
            .unwrap();
        assert!(root.join("runs").join("in-code.json").exists());
        assert!(!root.join("runs").join("in-code.json.json").exists());
    }
}
