//! Pipeline algebra
//!
//! A pipeline is an immutable tree of stages:
//!
//! - **Atomic**: one model invocation. The input projection renders a prompt
//!   from the stage input and the fixture context, the model completes it and
//!   the output projection turns the raw completion into a typed output.
//! - **Sequence**: the left output becomes the right input.
//! - **Mux**: dispatch routes the input to any subset of the children (with
//!   repeats, in any order), combine merges their outputs.
//!
//! Any node may carry a judge comparing its output with an expected value.
//!
//! [`Pipeline<I, O>`] is the typed builder. It threads the middle type of a
//! sequence statically and erases into a [`PipelineNode`] over JSON values,
//! which is what the evaluator walks. Mux children are erased nodes, so their
//! inputs are checked when the mux runs.
//!
//! ```
//! use lmflow_core::llm::Conversation;
//! use lmflow_core::pipeline::Pipeline;
//! use serde_json::Value;
//!
//! let count: Pipeline<String, u32> = Pipeline::atomic(
//!     "wordcount",
//!     "stage1model",
//!     |input: String, _: &Value| Conversation::user(input),
//!     |completion: String| async move { Ok(completion.trim().parse::<u32>()?) },
//! );
//! let greet: Pipeline<u32, String> = Pipeline::atomic(
//!     "greet",
//!     "stage2model",
//!     |n: u32, _: &Value| Conversation::user(n.to_string()),
//!     |completion: String| async move { Ok(completion) },
//! );
//!
//! let pipeline = Pipeline::sequence(count, greet);
//! assert_eq!(pipeline.node().stage_names(), vec!["wordcount", "greet"]);
//! ```

pub mod schema;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Conversation;

pub use schema::{FixtureDocumentSchema, FixtureSchema, ValueSchema, Violation};

/// Failure inside a stage function
#[derive(Debug)]
pub(crate) enum StageError {
    /// The value handed to the stage does not decode into its declared type
    Decode(String),
    /// The user function itself failed
    Failed(anyhow::Error),
}

pub(crate) type StageResult<T> = std::result::Result<T, StageError>;

pub(crate) type InputFn = Arc<dyn Fn(Value, &Value) -> StageResult<Conversation> + Send + Sync>;
pub(crate) type OutputFn = Arc<dyn Fn(String) -> BoxFuture<'static, StageResult<Value>> + Send + Sync>;
pub(crate) type JudgeFn =
    Arc<dyn Fn(Value, Value) -> BoxFuture<'static, StageResult<Value>> + Send + Sync>;
pub(crate) type DispatchFn = Arc<dyn Fn(Value) -> StageResult<Vec<MuxTask>> + Send + Sync>;
pub(crate) type CombineFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, StageResult<Value>> + Send + Sync>;

fn decode<T: DeserializeOwned>(value: Value) -> StageResult<T> {
    serde_json::from_value(value).map_err(|e| StageError::Decode(e.to_string()))
}

fn encode<T: Serialize>(value: T) -> StageResult<Value> {
    serde_json::to_value(value).map_err(|e| StageError::Failed(e.into()))
}

/// One unit of mux fan-out: run child `index` on `input`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxTask {
    pub index: usize,
    pub input: Value,
}

impl MuxTask {
    pub fn new(index: usize, input: impl Into<Value>) -> Self {
        Self {
            index,
            input: input.into(),
        }
    }
}

/// Single model invocation
#[derive(Clone)]
pub struct AtomicStage {
    pub(crate) name: String,
    pub(crate) model: String,
    pub(crate) render: InputFn,
    pub(crate) parse: OutputFn,
    pub(crate) judge: Option<JudgeFn>,
    pub(crate) input_schema: ValueSchema,
    pub(crate) output_schema: ValueSchema,
}

impl AtomicStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model identifier resolved through the registry
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Debug for AtomicStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicStage")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("input", &self.input_schema)
            .field("output", &self.output_schema)
            .field("judged", &self.judge.is_some())
            .finish()
    }
}

/// Two stages run one after the other
#[derive(Clone)]
pub struct SequenceStage {
    pub(crate) left: Box<PipelineNode>,
    pub(crate) right: Box<PipelineNode>,
    pub(crate) judge: Option<JudgeFn>,
}

impl SequenceStage {
    pub fn left(&self) -> &PipelineNode {
        &self.left
    }

    pub fn right(&self) -> &PipelineNode {
        &self.right
    }
}

impl fmt::Debug for SequenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceStage")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("judged", &self.judge.is_some())
            .finish()
    }
}

/// Fan-out over children, fan-in through combine
#[derive(Clone)]
pub struct MuxStage {
    pub(crate) children: Vec<PipelineNode>,
    pub(crate) dispatch: DispatchFn,
    pub(crate) combine: CombineFn,
    pub(crate) judge: Option<JudgeFn>,
    pub(crate) input_schema: ValueSchema,
    pub(crate) output_schema: ValueSchema,
}

impl MuxStage {
    pub fn children(&self) -> &[PipelineNode] {
        &self.children
    }
}

impl fmt::Debug for MuxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStage")
            .field("children", &self.children)
            .field("input", &self.input_schema)
            .field("output", &self.output_schema)
            .field("judged", &self.judge.is_some())
            .finish()
    }
}

/// Type-erased pipeline tree
#[derive(Debug, Clone)]
pub enum PipelineNode {
    Atomic(AtomicStage),
    Sequence(SequenceStage),
    Mux(MuxStage),
}

impl PipelineNode {
    /// Discriminator used in fixtures and traces
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineNode::Atomic(_) => "atomic",
            PipelineNode::Sequence(_) => "sequence",
            PipelineNode::Mux(_) => "mux",
        }
    }

    pub fn input_schema(&self) -> &ValueSchema {
        match self {
            PipelineNode::Atomic(stage) => &stage.input_schema,
            PipelineNode::Sequence(stage) => stage.left.input_schema(),
            PipelineNode::Mux(stage) => &stage.input_schema,
        }
    }

    pub fn output_schema(&self) -> &ValueSchema {
        match self {
            PipelineNode::Atomic(stage) => &stage.output_schema,
            PipelineNode::Sequence(stage) => stage.right.output_schema(),
            PipelineNode::Mux(stage) => &stage.output_schema,
        }
    }

    pub(crate) fn judge(&self) -> Option<&JudgeFn> {
        match self {
            PipelineNode::Atomic(stage) => stage.judge.as_ref(),
            PipelineNode::Sequence(stage) => stage.judge.as_ref(),
            PipelineNode::Mux(stage) => stage.judge.as_ref(),
        }
    }

    fn set_judge(&mut self, judge: JudgeFn) {
        match self {
            PipelineNode::Atomic(stage) => stage.judge = Some(judge),
            PipelineNode::Sequence(stage) => stage.judge = Some(judge),
            PipelineNode::Mux(stage) => stage.judge = Some(judge),
        }
    }

    pub fn has_judge(&self) -> bool {
        self.judge().is_some()
    }

    /// Names of every atomic stage, depth first
    pub fn stage_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            PipelineNode::Atomic(stage) => names.push(&stage.name),
            PipelineNode::Sequence(stage) => {
                stage.left.collect_names(names);
                stage.right.collect_names(names);
            }
            PipelineNode::Mux(stage) => {
                for child in &stage.children {
                    child.collect_names(names);
                }
            }
        }
    }
}

/// Typed pipeline from `I` to `O`
pub struct Pipeline<I, O> {
    node: PipelineNode,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _types: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pipeline").field(&self.node).finish()
    }
}

impl<I, O> Pipeline<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    fn from_node(node: PipelineNode) -> Self {
        Self {
            node,
            _types: PhantomData,
        }
    }

    /// Single model invocation.
    ///
    /// # Arguments
    ///
    /// * `name` - Stage name, matched against fixtures
    /// * `model` - Model identifier resolved through the registry
    /// * `render` - Builds the prompt from the input and the fixture context
    /// * `parse` - Turns the raw completion into the stage output
    pub fn atomic<R, P, Fut>(
        name: impl Into<String>,
        model: impl Into<String>,
        render: R,
        parse: P,
    ) -> Self
    where
        R: Fn(I, &Value) -> Conversation + Send + Sync + 'static,
        P: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let render_fn: InputFn =
            Arc::new(move |input: Value, context: &Value| Ok(render(decode(input)?, context)));
        let parse_fn: OutputFn = Arc::new(move |completion: String| {
            let output = parse(completion);
            async move { encode(output.await.map_err(StageError::Failed)?) }.boxed()
        });

        Self::from_node(PipelineNode::Atomic(AtomicStage {
            name: name.into(),
            model: model.into(),
            render: render_fn,
            parse: parse_fn,
            judge: None,
            input_schema: ValueSchema::of::<I>(),
            output_schema: ValueSchema::of::<O>(),
        }))
    }

    /// Run `left`, then feed its output to `right`
    pub fn sequence<M>(left: Pipeline<I, M>, right: Pipeline<M, O>) -> Self {
        Self::from_node(PipelineNode::Sequence(SequenceStage {
            left: Box::new(left.node),
            right: Box::new(right.node),
            judge: None,
        }))
    }

    /// Fan out to `children` as `dispatch` decides, merge with `combine`.
    ///
    /// `combine` receives child outputs in dispatch order.
    pub fn mux<D, C, Fut>(children: Vec<PipelineNode>, dispatch: D, combine: C) -> Self
    where
        D: Fn(I) -> Vec<MuxTask> + Send + Sync + 'static,
        C: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let dispatch_fn: DispatchFn = Arc::new(move |input: Value| Ok(dispatch(decode(input)?)));
        let combine_fn: CombineFn = Arc::new(move |outputs: Vec<Value>| {
            let output = combine(outputs);
            async move { encode(output.await.map_err(StageError::Failed)?) }.boxed()
        });

        Self::from_node(PipelineNode::Mux(MuxStage {
            children,
            dispatch: dispatch_fn,
            combine: combine_fn,
            judge: None,
            input_schema: ValueSchema::of::<I>(),
            output_schema: ValueSchema::of::<O>(),
        }))
    }

    /// Compare this node's output with the fixture's expected value.
    ///
    /// The judge only runs when the fixture supplies an expected value here.
    pub fn with_judge<J, F, Fut>(mut self, judge: F) -> Self
    where
        F: Fn(O, O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<J>> + Send + 'static,
        J: Serialize + Send + 'static,
    {
        let judge_fn: JudgeFn = Arc::new(move |output: Value, expected: Value| {
            let decoded = decode::<O>(output).and_then(|output| Ok((output, decode::<O>(expected)?)));
            match decoded {
                Ok((output, expected)) => {
                    let judgment = judge(output, expected);
                    async move { encode(judgment.await.map_err(StageError::Failed)?) }.boxed()
                }
                Err(err) => futures::future::ready(Err(err)).boxed(),
            }
        });
        self.node.set_judge(judge_fn);
        self
    }
}

impl<I, O> Pipeline<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + PartialEq + Send + 'static,
{
    /// Judge by equality: the judgment is `true` when output equals expected
    pub fn judged_by_equality(self) -> Self {
        self.with_judge(|output: O, expected: O| async move { Ok(output == expected) })
    }
}

impl<I, O> Pipeline<I, O> {
    pub fn node(&self) -> &PipelineNode {
        &self.node
    }

    /// Erase the types, e.g. to use this pipeline as a mux child
    pub fn into_node(self) -> PipelineNode {
        self.node
    }
}

impl<I, O> AsRef<PipelineNode> for Pipeline<I, O> {
    fn as_ref(&self) -> &PipelineNode {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shout() -> Pipeline<String, String> {
        Pipeline::atomic(
            "shout",
            "echo",
            |input: String, context: &Value| {
                let style = context["style"].as_str().unwrap_or("plain");
                Conversation::user(format!("{style}: {input}"))
            },
            |completion: String| async move { Ok(completion.to_uppercase()) },
        )
    }

    fn atomic(node: &PipelineNode) -> &AtomicStage {
        match node {
            PipelineNode::Atomic(stage) => stage,
            other => panic!("expected atomic, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_atomic_projections() {
        let pipeline = shout();
        let stage = atomic(pipeline.node());

        let prompt = (stage.render)(json!("hi"), &json!({"style": "loud"})).unwrap();
        assert_eq!(prompt.last_user(), Some("loud: hi"));

        let output = (stage.parse)("hey".to_string()).await.unwrap();
        assert_eq!(output, json!("HEY"));
    }

    #[test]
    fn test_render_rejects_wrong_input_type() {
        let pipeline = shout();
        let result = (atomic(pipeline.node()).render)(json!(42), &Value::Null);
        assert!(matches!(result, Err(StageError::Decode(_))));
    }

    #[tokio::test]
    async fn test_judge_is_attached_and_typed() {
        let pipeline = shout().judged_by_equality();
        assert!(pipeline.node().has_judge());

        let judge = pipeline.node().judge().unwrap();
        assert_eq!(judge(json!("A"), json!("A")).await.unwrap(), json!(true));
        assert_eq!(judge(json!("A"), json!("B")).await.unwrap(), json!(false));
        assert!(matches!(
            judge(json!("A"), json!(1)).await,
            Err(StageError::Decode(_))
        ));
    }

    #[test]
    fn test_sequence_and_mux_shape() {
        let length: Pipeline<String, usize> = Pipeline::atomic(
            "length",
            "echo",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion.len()) },
        );
        let inner = Pipeline::sequence(shout(), length);
        let mux: Pipeline<String, usize> = Pipeline::mux(
            vec![inner.into_node(), shout().into_node()],
            |input: String| vec![MuxTask::new(1, input.clone()), MuxTask::new(0, input)],
            |outputs: Vec<Value>| async move { Ok(outputs.len()) },
        );

        let node = mux.node();
        assert_eq!(node.kind(), "mux");
        assert_eq!(node.stage_names(), vec!["shout", "length", "shout"]);
        assert!(!node.has_judge());

        let PipelineNode::Mux(stage) = node else {
            panic!("expected mux");
        };
        assert_eq!(stage.children()[0].kind(), "sequence");
        assert!(stage.children()[0].output_schema().validate(&json!(3)).is_ok());
        assert!(stage.children()[0].input_schema().validate(&json!(3)).is_err());

        let tasks = (stage.dispatch)(json!("x")).unwrap();
        assert_eq!(tasks, vec![MuxTask::new(1, "x"), MuxTask::new(0, "x")]);
    }

    #[test]
    fn test_debug_lists_stages() {
        let text = format!("{:?}", Pipeline::sequence(shout(), shout()));
        assert!(text.contains("SequenceStage"));
        assert!(text.contains("shout"));
    }
}
