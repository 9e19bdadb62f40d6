//! Fixture schemas derived from a pipeline
//!
//! A [`FixtureSchema`] mirrors the shape of a [`PipelineNode`] node for node,
//! so a fixture is checked against the exact branch structure of the pipeline
//! it will be evaluated with, not only against generic value types.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::LmFlowError;
use crate::pipeline::PipelineNode;

type CheckFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Type-erased validator for one value position.
///
/// Built from the Rust type a stage consumes or produces; a value passes when
/// it deserializes into that type.
#[derive(Clone)]
pub struct ValueSchema {
    type_name: &'static str,
    check: CheckFn,
}

impl ValueSchema {
    /// Schema accepting exactly the values that deserialize into `T`
    pub fn of<T: DeserializeOwned + 'static>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            check: Arc::new(|value: &Value| {
                T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        self.type_name
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.check)(value)
    }
}

impl fmt::Debug for ValueSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueSchema").field(&self.type_name).finish()
    }
}

/// A rejected fixture field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The discriminator names no known node type
    UnknownVariant { path: String, kind: String },
    /// Any other divergence from the pipeline shape
    Mismatch { path: String, message: String },
}

impl Violation {
    fn mismatch(path: &str, message: impl Into<String>) -> Self {
        Violation::Mismatch {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Violation::UnknownVariant { path, .. } | Violation::Mismatch { path, .. } => path,
        }
    }

    /// Attach the offending file
    pub fn into_error(self, file: &Path) -> LmFlowError {
        match self {
            Violation::UnknownVariant { path, kind } => LmFlowError::UnknownVariant {
                file: file.to_path_buf(),
                path,
                kind,
            },
            Violation::Mismatch { path, message } => LmFlowError::SchemaMismatch {
                file: file.to_path_buf(),
                path,
                message,
            },
        }
    }
}

/// Expected-value tree schema, isomorphic to a pipeline
#[derive(Debug, Clone)]
pub enum FixtureSchema {
    Atomic {
        name: String,
        expected: ValueSchema,
    },
    Sequence {
        left: Box<FixtureSchema>,
        right: Box<FixtureSchema>,
        expected: ValueSchema,
    },
    Mux {
        children: Vec<FixtureSchema>,
        expected: ValueSchema,
    },
}

const NODE_TYPES: [&str; 3] = ["atomic", "sequence", "mux"];

impl FixtureSchema {
    /// Derive the schema mirroring `node`
    pub fn derive(node: &PipelineNode) -> Self {
        match node {
            PipelineNode::Atomic(stage) => FixtureSchema::Atomic {
                name: stage.name().to_string(),
                expected: stage.output_schema.clone(),
            },
            PipelineNode::Sequence(stage) => FixtureSchema::Sequence {
                left: Box::new(Self::derive(&stage.left)),
                right: Box::new(Self::derive(&stage.right)),
                expected: node.output_schema().clone(),
            },
            PipelineNode::Mux(stage) => FixtureSchema::Mux {
                children: stage.children.iter().map(Self::derive).collect(),
                expected: stage.output_schema.clone(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FixtureSchema::Atomic { .. } => "atomic",
            FixtureSchema::Sequence { .. } => "sequence",
            FixtureSchema::Mux { .. } => "mux",
        }
    }

    /// Validate an expected-value tree rooted at `path`
    pub fn validate(&self, value: &Value, path: &str) -> Result<(), Violation> {
        let object = value
            .as_object()
            .ok_or_else(|| Violation::mismatch(path, "expected a mapping"))?;

        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(_) => {
                return Err(Violation::mismatch(
                    &format!("{path}.type"),
                    "node type must be a string",
                ));
            }
            None => {
                return Err(Violation::mismatch(
                    &format!("{path}.type"),
                    "missing node type",
                ));
            }
        };

        if !NODE_TYPES.contains(&kind) {
            return Err(Violation::UnknownVariant {
                path: format!("{path}.type"),
                kind: kind.to_string(),
            });
        }
        if kind != self.kind() {
            return Err(Violation::mismatch(
                &format!("{path}.type"),
                format!("expected node type '{}', found '{}'", self.kind(), kind),
            ));
        }

        match self {
            FixtureSchema::Atomic { name, expected } => {
                match object.get("name") {
                    Some(Value::String(found)) if found == name => {}
                    Some(Value::String(found)) => {
                        return Err(Violation::mismatch(
                            &format!("{path}.name"),
                            format!("expected stage '{}', found '{}'", name, found),
                        ));
                    }
                    _ => {
                        return Err(Violation::mismatch(
                            &format!("{path}.name"),
                            format!("missing stage name '{}'", name),
                        ));
                    }
                }
                check_expected(expected, object.get("expected"), path)
            }
            FixtureSchema::Sequence {
                left,
                right,
                expected,
            } => {
                let left_value = object
                    .get("left")
                    .ok_or_else(|| Violation::mismatch(&format!("{path}.left"), "missing left branch"))?;
                let right_value = object
                    .get("right")
                    .ok_or_else(|| Violation::mismatch(&format!("{path}.right"), "missing right branch"))?;
                left.validate(left_value, &format!("{path}.left"))?;
                right.validate(right_value, &format!("{path}.right"))?;
                check_expected(expected, object.get("expected"), path)
            }
            FixtureSchema::Mux { children, expected } => {
                let elements = match object.get("children") {
                    Some(Value::Array(elements)) => elements,
                    Some(_) => {
                        return Err(Violation::mismatch(
                            &format!("{path}.children"),
                            "children must be a list",
                        ));
                    }
                    None => {
                        return Err(Violation::mismatch(
                            &format!("{path}.children"),
                            "missing children",
                        ));
                    }
                };
                for (position, element) in elements.iter().enumerate() {
                    validate_union(children, element, &format!("{path}.children[{position}]"))?;
                }
                check_expected(expected, object.get("expected"), path)
            }
        }
    }

    /// Whether `value` could have been authored for this node: same type
    /// and, for atomic stages, the same name.
    fn claims(&self, value: &Value) -> bool {
        let kind = value.get("type").and_then(Value::as_str);
        match self {
            FixtureSchema::Atomic { name, .. } => {
                kind == Some("atomic") && value.get("name").and_then(Value::as_str) == Some(name)
            }
            _ => kind == Some(self.kind()),
        }
    }
}

fn check_expected(schema: &ValueSchema, value: Option<&Value>, path: &str) -> Result<(), Violation> {
    match value {
        None | Some(Value::Null) => Ok(()),
        Some(value) => schema.validate(value).map_err(|message| {
            Violation::mismatch(
                &format!("{path}.expected"),
                format!("not a valid {}: {}", schema.type_name(), message),
            )
        }),
    }
}

/// A mux element passes if any child schema accepts it
fn validate_union(children: &[FixtureSchema], value: &Value, path: &str) -> Result<(), Violation> {
    let mut closest = None;
    for child in children {
        match child.validate(value, path) {
            Ok(()) => return Ok(()),
            Err(violation @ Violation::UnknownVariant { .. }) => return Err(violation),
            Err(violation) if closest.is_none() && child.claims(value) => closest = Some(violation),
            Err(_) => {}
        }
    }

    Err(closest.unwrap_or_else(|| {
        Violation::mismatch(
            path,
            format!("matches none of the {} mux child shapes", children.len()),
        )
    }))
}

/// Schema of a whole fixture document:
/// `{tags?: [string], input, context?, expected: <tree>}`
#[derive(Debug, Clone)]
pub struct FixtureDocumentSchema {
    pub input: ValueSchema,
    pub expected: FixtureSchema,
}

impl FixtureDocumentSchema {
    pub fn derive(node: &PipelineNode) -> Self {
        Self {
            input: node.input_schema().clone(),
            expected: FixtureSchema::derive(node),
        }
    }

    pub fn validate(&self, document: &Value) -> Result<(), Violation> {
        let object = document
            .as_object()
            .ok_or_else(|| Violation::mismatch("", "fixture must be a mapping"))?;

        match object.get("tags") {
            None | Some(Value::Null) => {}
            Some(Value::Array(tags)) => {
                if let Some(position) = tags.iter().position(|tag| !tag.is_string()) {
                    return Err(Violation::mismatch(
                        &format!("tags[{position}]"),
                        "tags must be strings",
                    ));
                }
            }
            Some(_) => return Err(Violation::mismatch("tags", "tags must be a list")),
        }

        let input = object.get("input").unwrap_or(&Value::Null);
        self.input.validate(input).map_err(|message| {
            Violation::mismatch(
                "input",
                format!("not a valid {}: {}", self.input.type_name(), message),
            )
        })?;

        let expected = object
            .get("expected")
            .ok_or_else(|| Violation::mismatch("expected", "missing expected tree"))?;
        self.expected.validate(expected, "expected")
    }
}
