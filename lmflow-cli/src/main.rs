//! lmflow - evaluate the bundled word-count greeter pipeline
//!
//! Projects evaluating their own pipelines build a binary like this one
//! around `lmflow_cli::run`.

use anyhow::Result;
use lmflow_core::llm::Conversation;
use lmflow_core::pipeline::Pipeline;
use serde_json::Value;

const DEFAULT_INSTRUCTIONS: &str = "You are an assistant that counts words. Reply with a number.";

/// Counts the words of the input, then greets that many times
fn greeter() -> Pipeline<String, String> {
    let wordcount: Pipeline<String, u32> = Pipeline::atomic(
        "wordcount",
        "stage1model",
        |input: String, context: &Value| {
            let instructions = context
                .get("instructions")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_INSTRUCTIONS);
            Conversation::parse(&format!("[system] {}\n[user] {}", instructions, input))
        },
        |completion: String| async move { Ok(completion.trim().parse::<u32>()?) },
    )
    .judged_by_equality();

    let greet: Pipeline<u32, String> = Pipeline::atomic(
        "greet",
        "stage2model",
        |count: u32, _: &Value| Conversation::user(count.to_string()),
        |completion: String| async move { Ok(completion.trim().to_string()) },
    )
    .judged_by_equality();

    Pipeline::sequence(wordcount, greet)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    lmflow_cli::run(greeter().node()).await
}
