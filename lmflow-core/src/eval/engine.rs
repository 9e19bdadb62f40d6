//! Recursive evaluation of a pipeline against one fixture

use futures::future::{BoxFuture, FutureExt, try_join_all};
use serde_json::Value;

use super::fixture::ExpectedNode;
use super::trace::{MuxBranchTrace, TraceNode};
use crate::error::{LmFlowError, Result};
use crate::llm::registry::ModelRegistry;
use crate::pipeline::{PipelineNode, StageError};

/// Path of the root node in error messages
pub const ROOT_PATH: &str = "root";

fn stage_error(err: StageError, stage: &str, path: &str, expected_type: &str) -> LmFlowError {
    match err {
        StageError::Decode(message) => LmFlowError::TypeOrNameMismatch {
            path: path.to_string(),
            expected: expected_type.to_string(),
            found: format!("a value that does not decode ({})", message),
        },
        StageError::Failed(err) => LmFlowError::Projection {
            stage: stage.to_string(),
            path: path.to_string(),
            message: format!("{:#}", err),
        },
    }
}

/// Walks a pipeline and its expected tree in lockstep
#[derive(Debug, Clone, Copy)]
pub struct Evaluator<'a> {
    models: &'a ModelRegistry,
}

impl<'a> Evaluator<'a> {
    pub fn new(models: &'a ModelRegistry) -> Self {
        Self { models }
    }

    /// Evaluate from the root of a fixture
    pub async fn run(
        &self,
        node: &PipelineNode,
        input: Value,
        context: &Value,
        expected: &ExpectedNode,
    ) -> Result<TraceNode> {
        self.evaluate(node, input, context, expected, ROOT_PATH.to_string()).await
    }

    /// Evaluate `node` on `input`, checking it against `expected`.
    ///
    /// Any failure aborts the whole evaluation; nothing is retried.
    pub fn evaluate<'b>(
        &'b self,
        node: &'b PipelineNode,
        input: Value,
        context: &'b Value,
        expected: &'b ExpectedNode,
        path: String,
    ) -> BoxFuture<'b, Result<TraceNode>> {
        async move {
            match (node, expected) {
                (PipelineNode::Atomic(stage), ExpectedNode::Atomic { name, expected }) => {
                    if name != &stage.name {
                        return Err(LmFlowError::TypeOrNameMismatch {
                            path,
                            expected: format!("atomic stage '{}'", stage.name),
                            found: format!("atomic stage '{}'", name),
                        });
                    }

                    let prompt = (stage.render)(input.clone(), context).map_err(|e| {
                        stage_error(e, &stage.name, &path, stage.input_schema.type_name())
                    })?;

                    let model = self.models.get_model(&stage.name, &stage.model)?;
                    tracing::debug!(stage = %stage.name, model = %stage.model, path = %path, "Invoking model");

                    let completion = model.complete(&prompt).await.map_err(|e| {
                        LmFlowError::ModelInvocation {
                            stage: stage.name.clone(),
                            model: stage.model.clone(),
                            message: e.to_string(),
                        }
                    })?;

                    let output = (stage.parse)(completion.clone())
                        .await
                        .map_err(|e| stage_error(e, &stage.name, &path, stage.output_schema.type_name()))?;

                    let (expected, judgment) = self
                        .judge(node, &output, expected.as_ref(), &stage.name, &path)
                        .await?;

                    Ok(TraceNode::Atomic {
                        name: stage.name.clone(),
                        model: stage.model.clone(),
                        input,
                        prompt,
                        completion,
                        output,
                        expected,
                        judgment,
                    })
                }

                (
                    PipelineNode::Sequence(stage),
                    ExpectedNode::Sequence {
                        left,
                        right,
                        expected,
                    },
                ) => {
                    let left_trace = self
                        .evaluate(&stage.left, input.clone(), context, left, format!("{path}.left"))
                        .await?;
                    let right_trace = self
                        .evaluate(
                            &stage.right,
                            left_trace.output().clone(),
                            context,
                            right,
                            format!("{path}.right"),
                        )
                        .await?;

                    let output = right_trace.output().clone();
                    let (expected, judgment) = self
                        .judge(node, &output, expected.as_ref(), "sequence", &path)
                        .await?;

                    Ok(TraceNode::Sequence {
                        input,
                        left: Box::new(left_trace),
                        right: Box::new(right_trace),
                        output,
                        expected,
                        judgment,
                    })
                }

                (PipelineNode::Mux(stage), ExpectedNode::Mux { children, expected }) => {
                    let tasks = (stage.dispatch)(input.clone())
                        .map_err(|e| stage_error(e, "mux", &path, stage.input_schema.type_name()))?;

                    for (position, task) in tasks.iter().enumerate() {
                        if task.index >= stage.children.len() {
                            return Err(LmFlowError::IndexOutOfRange {
                                path: format!("{path}.children[{position}]"),
                                message: format!(
                                    "dispatch index {} out of range for {} children",
                                    task.index,
                                    stage.children.len()
                                ),
                            });
                        }
                    }
                    if tasks.len() != children.len() {
                        return Err(LmFlowError::IndexOutOfRange {
                            path: format!("{path}.children"),
                            message: format!(
                                "dispatch produced {} tasks but the fixture lists {} children",
                                tasks.len(),
                                children.len()
                            ),
                        });
                    }

                    let branches = tasks.into_iter().zip(children).enumerate().map(
                        |(position, (task, child_expected))| {
                            let child = &stage.children[task.index];
                            let child_path = format!("{path}.children[{position}]");
                            async move {
                                let trace = self
                                    .evaluate(child, task.input, context, child_expected, child_path)
                                    .await?;
                                Ok::<_, LmFlowError>(MuxBranchTrace {
                                    child: task.index,
                                    trace,
                                })
                            }
                        },
                    );
                    let branches = try_join_all(branches).await?;

                    let outputs = branches.iter().map(|b| b.trace.output().clone()).collect();
                    let output = (stage.combine)(outputs)
                        .await
                        .map_err(|e| stage_error(e, "mux", &path, stage.output_schema.type_name()))?;

                    let (expected, judgment) = self
                        .judge(node, &output, expected.as_ref(), "mux", &path)
                        .await?;

                    Ok(TraceNode::Mux {
                        input,
                        children: branches,
                        output,
                        expected,
                        judgment,
                    })
                }

                (node, expected) => Err(LmFlowError::TypeOrNameMismatch {
                    path,
                    expected: format!("{} node", node.kind()),
                    found: format!("{} node", expected.kind()),
                }),
            }
        }
        .boxed()
    }

    /// Run the node's judge when the fixture has an expected value here.
    ///
    /// Returns `(expected, judgment)`, both set or both empty.
    async fn judge(
        &self,
        node: &PipelineNode,
        output: &Value,
        expected: Option<&Value>,
        stage: &str,
        path: &str,
    ) -> Result<(Option<Value>, Option<Value>)> {
        let (judge, expected) = match (node.judge(), expected) {
            (Some(judge), Some(expected)) => (judge, expected),
            _ => return Ok((None, None)),
        };

        let judgment = judge(output.clone(), expected.clone())
            .await
            .map_err(|e| stage_error(e, stage, &format!("{path}.expected"), node.output_schema().type_name()))?;
        Ok((Some(expected.clone()), Some(judgment)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::{Conversation, MockProvider};
    use crate::pipeline::{MuxTask, Pipeline};
    use serde_json::json;

    fn registry() -> ModelRegistry {
        ModelRegistry::new().with_model(
            "upper",
            Arc::new(
                MockProvider::new("upper")
                    .with_exemplar("a", "A")
                    .with_exemplar("b", "B")
                    .with_exemplar("c", "C"),
            ),
        )
    }

    fn upper(name: &str) -> Pipeline<String, String> {
        Pipeline::atomic(
            name,
            "upper",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion) },
        )
        .judged_by_equality()
    }

    fn leaf(name: &str, expected: Option<Value>) -> ExpectedNode {
        ExpectedNode::Atomic {
            name: name.to_string(),
            expected,
        }
    }

    #[tokio::test]
    async fn test_atomic_judged_only_with_expected() {
        let models = registry();
        let evaluator = Evaluator::new(&models);
        let pipeline = upper("up");

        let judged = evaluator
            .run(pipeline.node(), json!("a"), &Value::Null, &leaf("up", Some(json!("A"))))
            .await
            .unwrap();
        assert_eq!(judged.judgment(), Some(&json!(true)));
        assert_eq!(judged.expected(), Some(&json!("A")));

        let unjudged = evaluator
            .run(pipeline.node(), json!("a"), &Value::Null, &leaf("up", None))
            .await
            .unwrap();
        assert!(unjudged.judgment().is_none());
        assert!(unjudged.expected().is_none());
    }

    #[tokio::test]
    async fn test_stage_name_mismatch() {
        let models = registry();
        let err = Evaluator::new(&models)
            .run(upper("up").node(), json!("a"), &Value::Null, &leaf("down", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LmFlowError::TypeOrNameMismatch { ref path, .. } if path == "root"));
    }

    #[tokio::test]
    async fn test_kind_mismatch_reports_path() {
        let models = registry();
        let pipeline = Pipeline::sequence(upper("first"), upper("second"));
        let expected = ExpectedNode::Sequence {
            left: Box::new(leaf("first", None)),
            right: Box::new(ExpectedNode::Mux {
                children: vec![],
                expected: None,
            }),
            expected: None,
        };

        let err = Evaluator::new(&models)
            .run(pipeline.node(), json!("a"), &Value::Null, &expected)
            .await
            .unwrap_err();
        match err {
            LmFlowError::TypeOrNameMismatch { path, expected, found } => {
                assert_eq!(path, "root.right");
                assert_eq!(expected, "atomic node");
                assert_eq!(found, "mux node");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_mux_preserves_dispatch_order() {
        let models = registry();
        let mux: Pipeline<Vec<String>, String> = Pipeline::mux(
            vec![upper("zero").into_node(), upper("one").into_node()],
            |letters: Vec<String>| {
                letters
                    .into_iter()
                    .enumerate()
                    .map(|(i, letter)| MuxTask::new((i + 1) % 2, letter))
                    .collect()
            },
            |outputs: Vec<Value>| async move {
                Ok(outputs
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(""))
            },
        );
        let expected = ExpectedNode::Mux {
            children: vec![leaf("one", None), leaf("zero", None), leaf("one", Some(json!("C")))],
            expected: None,
        };

        let trace = Evaluator::new(&models)
            .run(mux.node(), json!(["a", "b", "c"]), &Value::Null, &expected)
            .await
            .unwrap();

        let TraceNode::Mux { children, output, .. } = &trace else {
            panic!("expected mux trace");
        };
        let sources: Vec<_> = children.iter().map(|b| b.child).collect();
        assert_eq!(sources, vec![1, 0, 1]);
        assert_eq!(output, &json!("ABC"));
        assert_eq!(children[2].trace.judgment(), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_wrong_input_type_is_mismatch() {
        let models = registry();
        let err = Evaluator::new(&models)
            .run(upper("up").node(), json!(7), &Value::Null, &leaf("up", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LmFlowError::TypeOrNameMismatch { .. }));
    }

    #[tokio::test]
    async fn test_model_and_projection_failures() {
        let models = registry();
        let unknown_prompt = Evaluator::new(&models)
            .run(upper("up").node(), json!("zzz"), &Value::Null, &leaf("up", None))
            .await
            .unwrap_err();
        assert!(matches!(unknown_prompt, LmFlowError::ModelInvocation { .. }));

        let failing: Pipeline<String, u32> = Pipeline::atomic(
            "count",
            "upper",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion.parse::<u32>()?) },
        );
        let err = Evaluator::new(&models)
            .run(failing.node(), json!("a"), &Value::Null, &leaf("count", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LmFlowError::Projection { ref stage, .. } if stage == "count"));

        let missing: Pipeline<String, String> = Pipeline::atomic(
            "lost",
            "nowhere",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion) },
        );
        let err = Evaluator::new(&models)
            .run(missing.node(), json!("a"), &Value::Null, &leaf("lost", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LmFlowError::ModelNotFound { .. }));
    }
}
