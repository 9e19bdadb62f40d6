//! Error types for lmflow operations

use std::path::PathBuf;

/// Result type for lmflow operations
pub type Result<T> = std::result::Result<T, LmFlowError>;

/// Error types for the lmflow evaluation framework
#[derive(Debug, thiserror::Error)]
pub enum LmFlowError {
    /// A fixture authored a field that the loader derives itself
    #[error("Fixture {file} must not define reserved field '{field}'")]
    ReservedField { file: PathBuf, field: String },

    /// Fixture shape diverges from the pipeline shape
    #[error("In {file}: schema mismatch at {path}: {message}")]
    SchemaMismatch {
        file: PathBuf,
        path: String,
        message: String,
    },

    /// Two fixture files map to the same fixture id
    #[error("Fixture id '{fixture_id}' is used by both {first} and {second}")]
    DuplicateFixtureId {
        fixture_id: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// Discriminator or stage name of a fixture node does not match the pipeline
    #[error("Mismatch at {path}: expected {expected}, found {found}")]
    TypeOrNameMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// Mux dispatch index out of range, or dispatch/fixture arity mismatch
    #[error("Index error at {path}: {message}")]
    IndexOutOfRange { path: String, message: String },

    /// Unrecognized node kind in a fixture
    #[error("In {file}: unknown node type \"{kind}\" at {path}")]
    UnknownVariant {
        file: PathBuf,
        path: String,
        kind: String,
    },

    /// Model collaborator failed to produce a completion
    #[error("Model '{model}' failed for stage '{stage}': {message}")]
    ModelInvocation {
        stage: String,
        model: String,
        message: String,
    },

    /// Output projection, combine or judge function failed
    #[error("Stage '{stage}' failed at {path}: {message}")]
    Projection {
        stage: String,
        path: String,
        message: String,
    },

    /// Model registry has no entry for a stage's model
    #[error("No model '{model}' available for stage '{stage}'")]
    ModelNotFound { stage: String, model: String },

    /// Evaluation of a specific fixture failed
    #[error("Fixture '{fixture_id}' failed: {source}")]
    Fixture {
        fixture_id: String,
        #[source]
        source: Box<LmFlowError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A structured file could not be parsed
    #[error("Failed to parse {file}: {message}")]
    Parse { file: PathBuf, message: String },

    /// IO error on a specific path
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl LmFlowError {
    /// Attach the fixture that was being evaluated when this error occurred
    pub fn in_fixture(self, fixture_id: impl Into<String>) -> Self {
        LmFlowError::Fixture {
            fixture_id: fixture_id.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LmFlowError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<String> for LmFlowError {
    fn from(s: String) -> Self {
        LmFlowError::Other(s)
    }
}

impl From<&str> for LmFlowError {
    fn from(s: &str) -> Self {
        LmFlowError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for LmFlowError {
    fn from(err: anyhow::Error) -> Self {
        LmFlowError::Other(err.to_string())
    }
}
