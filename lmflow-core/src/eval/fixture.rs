//! Fixture definitions and loading
//!
//! A fixture file holds one test case: an input, a free-form context,
//! optional tags and an expected-value tree mirroring the pipeline. The
//! loader derives the fixture id from the file path and the content hash from
//! the raw bytes; authors must not write either.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use super::filter::TagFilter;
use crate::error::{LmFlowError, Result};
use crate::pipeline::FixtureDocumentSchema;

/// Field holding the injected content hash
pub const CONTENT_HASH_FIELD: &str = "content_hash";

/// Field holding the injected fixture id
pub const FIXTURE_ID_FIELD: &str = "fixture_id";

/// Expected-value tree, one node per pipeline node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExpectedNode {
    Atomic {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
    },
    Sequence {
        left: Box<ExpectedNode>,
        right: Box<ExpectedNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
    },
    Mux {
        children: Vec<ExpectedNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
    },
}

impl ExpectedNode {
    pub fn kind(&self) -> &'static str {
        match self {
            ExpectedNode::Atomic { .. } => "atomic",
            ExpectedNode::Sequence { .. } => "sequence",
            ExpectedNode::Mux { .. } => "mux",
        }
    }

    /// Expected value of this node itself
    pub fn expected(&self) -> Option<&Value> {
        match self {
            ExpectedNode::Atomic { expected, .. }
            | ExpectedNode::Sequence { expected, .. }
            | ExpectedNode::Mux { expected, .. } => expected.as_ref(),
        }
    }
}

/// A loaded, validated fixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Path relative to the input root, `/`-separated, without extension
    pub fixture_id: String,

    /// Hex SHA-256 of the file as authored
    pub content_hash: String,

    /// Tags for selection
    #[serde(default)]
    pub tags: Vec<String>,

    /// Root pipeline input
    #[serde(default)]
    pub input: Value,

    /// Free-form context handed to every input projection
    #[serde(default)]
    pub context: Value,

    /// Expected-value tree
    pub expected: ExpectedNode,
}

/// Yields the candidate fixture files under a root
pub trait FileEnumerator: Send + Sync {
    fn enumerate(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

/// Recursive enumeration in file-name order
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkDirEnumerator;

impl FileEnumerator for WalkDirEnumerator {
    fn enumerate(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                LmFlowError::io(path, e.into())
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

/// Digest over a fixture's raw bytes
pub trait ContentHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> Option<Format> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "yaml" | "yml" => Some(Format::Yaml),
        "json" => Some(Format::Json),
        _ => None,
    }
}

/// Fixture id for `path`: its path relative to `root`, extension stripped,
/// segments joined with `/` whatever the host separator.
pub fn fixture_id_for(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        LmFlowError::Other(format!(
            "{} is not under the input folder {}",
            path.display(),
            root.display()
        ))
    })?;

    let segments: Vec<String> = relative
        .with_extension("")
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    Ok(segments.join("/"))
}

fn parse_document(path: &Path, format: Format, bytes: &[u8]) -> Result<Value> {
    let parsed = match format {
        Format::Yaml => serde_yaml::from_slice::<Value>(bytes).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_slice::<Value>(bytes).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| LmFlowError::Parse {
        file: path.to_path_buf(),
        message,
    })
}

/// Loads and validates every fixture under an input root
pub struct FixtureLoader {
    root: PathBuf,
    schema: FixtureDocumentSchema,
    enumerator: Arc<dyn FileEnumerator>,
    hasher: Arc<dyn ContentHasher>,
    filter: TagFilter,
    concurrency: usize,
}

impl std::fmt::Debug for FixtureLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureLoader")
            .field("root", &self.root)
            .field("schema", &self.schema)
            .field("filter", &self.filter)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl FixtureLoader {
    pub fn new(root: impl Into<PathBuf>, schema: FixtureDocumentSchema) -> Self {
        Self {
            root: root.into(),
            schema,
            enumerator: Arc::new(WalkDirEnumerator),
            hasher: Arc::new(Sha256Hasher),
            filter: TagFilter::Always,
            concurrency: 4,
        }
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

    /// Maximum number of files read at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Load the selected fixtures in discovery order.
    ///
    /// Any unreadable, malformed or mismatching file fails the whole load.
    pub async fn load(&self) -> Result<Vec<Fixture>> {
        if self.concurrency == 0 {
            return Err(LmFlowError::Configuration(
                "Fixture loading concurrency must be at least 1".to_string(),
            ));
        }

        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            LmFlowError::Configuration(format!(
                "Input folder {} is not accessible: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(LmFlowError::Configuration(format!(
                "Input folder {} is not a directory",
                self.root.display()
            )));
        }

        let enumerator = self.enumerator.clone();
        let root = self.root.clone();
        let paths = tokio::task::spawn_blocking(move || enumerator.enumerate(&root))
            .await
            .map_err(|e| LmFlowError::Other(format!("File enumeration task failed: {}", e)))??;

        let mut candidates = Vec::new();
        for path in paths {
            match format_of(&path) {
                Some(format) => candidates.push((path, format)),
                None => tracing::info!(path = %path.display(), "Skipping non-fixture file"),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let reads = candidates.into_iter().map(|(path, format)| {
            let semaphore = semaphore.clone();
            let hasher = self.hasher.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| LmFlowError::Other("Failed to acquire semaphore".to_string()))?;
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| LmFlowError::io(&path, e))?;
                let content_hash = hasher.hash(&bytes);
                Ok::<_, LmFlowError>((path, format, bytes, content_hash))
            }
        });

        let mut fixtures = Vec::new();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for read in join_all(reads).await {
            let (path, format, bytes, content_hash) = read?;
            let fixture = self.prepare(&path, format, &bytes, content_hash)?;

            if let Some(first) = seen.insert(fixture.fixture_id.clone(), path.clone()) {
                return Err(LmFlowError::DuplicateFixtureId {
                    fixture_id: fixture.fixture_id,
                    first,
                    second: path,
                });
            }

            if self.filter.matches(&fixture.tags) {
                fixtures.push(fixture);
            } else {
                tracing::debug!(fixture_id = %fixture.fixture_id, "Fixture filtered out by tags");
            }
        }

        tracing::info!(
            root = %self.root.display(),
            selected = fixtures.len(),
            "Loaded fixtures"
        );
        Ok(fixtures)
    }

    fn prepare(&self, path: &Path, format: Format, bytes: &[u8], content_hash: String) -> Result<Fixture> {
        let mut document = parse_document(path, format, bytes)?;
        let object = document.as_object_mut().ok_or_else(|| LmFlowError::SchemaMismatch {
            file: path.to_path_buf(),
            path: String::new(),
            message: "fixture must be a mapping".to_string(),
        })?;

        for field in [CONTENT_HASH_FIELD, FIXTURE_ID_FIELD] {
            if object.contains_key(field) {
                return Err(LmFlowError::ReservedField {
                    file: path.to_path_buf(),
                    field: field.to_string(),
                });
            }
        }

        let fixture_id = fixture_id_for(&self.root, path)?;

        self.schema
            .validate(&document)
            .map_err(|violation| violation.into_error(path))?;

        if let Some(object) = document.as_object_mut() {
            if object.get("tags").is_some_and(Value::is_null) {
                object.remove("tags");
            }
            object.insert(CONTENT_HASH_FIELD.to_string(), Value::String(content_hash));
            object.insert(FIXTURE_ID_FIELD.to_string(), Value::String(fixture_id));
        }

        serde_json::from_value(document).map_err(|e| LmFlowError::SchemaMismatch {
            file: path.to_path_buf(),
            path: String::new(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod fixture_tests {
    use super::*;
    use crate::llm::Conversation;
    use crate::pipeline::Pipeline;

    fn schema() -> FixtureDocumentSchema {
        let echo: Pipeline<String, String> = Pipeline::atomic(
            "echo",
            "mock",
            |input: String, _: &Value| Conversation::user(input),
            |completion: String| async move { Ok(completion) },
        );
        FixtureDocumentSchema::derive(echo.node())
    }

    const CASE: &str = "tags: [smoke]\ninput: hi\nexpected:\n  type: atomic\n  name: echo\n  expected: hi\n";

    async fn write(root: &Path, relative: &str, content: &str) -> PathBuf {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn test_fixture_id_is_slash_joined() {
        let root = Path::new("cases");
        let path = root.join("greetings").join("nested").join("basic.yaml");
        assert_eq!(fixture_id_for(root, &path).unwrap(), "greetings/nested/basic");
        assert_eq!(fixture_id_for(root, &root.join("top.json")).unwrap(), "top");
        assert!(fixture_id_for(root, Path::new("elsewhere/x.yaml")).is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            Sha256Hasher.hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_expected_node_tree_parses() {
        let node: ExpectedNode = serde_yaml::from_str(
            "type: sequence\nleft: {type: atomic, name: a, expected: 2}\nright: {type: mux, children: []}\n",
        )
        .unwrap();
        match &node {
            ExpectedNode::Sequence { left, right, expected } => {
                assert_eq!(left.expected(), Some(&serde_json::json!(2)));
                assert_eq!(right.kind(), "mux");
                assert!(expected.is_none());
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_injects_id_and_hash_in_discovery_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/second.yml", CASE).await;
        write(dir.path(), "a.yaml", CASE).await;
        write(dir.path(), "README.md", "not a fixture").await;
        write(
            dir.path(),
            "c.JSON",
            r#"{"input": "x", "expected": {"type": "atomic", "name": "echo"}}"#,
        )
        .await;

        let fixtures = FixtureLoader::new(dir.path(), schema())
            .with_concurrency(2)
            .load()
            .await
            .unwrap();

        let ids: Vec<_> = fixtures.iter().map(|f| f.fixture_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b/second", "c"]);
        assert_eq!(fixtures[0].content_hash, Sha256Hasher.hash(CASE.as_bytes()));
        assert_eq!(fixtures[0].content_hash, fixtures[1].content_hash);
        assert_eq!(fixtures[0].tags, vec!["smoke".to_string()]);
        assert!(fixtures[2].tags.is_empty());
    }

    #[tokio::test]
    async fn test_hash_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "case.yaml", CASE).await;
        let loader = FixtureLoader::new(dir.path(), schema());

        let first = loader.load().await.unwrap();
        let second = loader.load().await.unwrap();
        assert_eq!(first[0].content_hash, second[0].content_hash);
    }

    #[tokio::test]
    async fn test_reserved_fields_rejected() {
        for field in [CONTENT_HASH_FIELD, FIXTURE_ID_FIELD] {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "case.yaml", &format!("{}: abc\n{}", field, CASE)).await;

            let err = FixtureLoader::new(dir.path(), schema()).load().await.unwrap_err();
            match err {
                LmFlowError::ReservedField { field: found, file } => {
                    assert_eq!(found, field);
                    assert!(file.ends_with("case.yaml"));
                }
                other => panic!("unexpected error: {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_shape_mismatch_names_file_and_field() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bad.yaml",
            "input: hi\nexpected:\n  type: atomic\n  name: shout\n",
        )
        .await;

        let err = FixtureLoader::new(dir.path(), schema()).load().await.unwrap_err();
        match err {
            LmFlowError::SchemaMismatch { file, path, .. } => {
                assert!(file.ends_with("bad.yaml"));
                assert_eq!(path, "expected.name");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_tag_filter_applied() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "tagged.yaml", CASE).await;
        write(
            dir.path(),
            "untagged.yaml",
            "input: hi\nexpected: {type: atomic, name: echo}\n",
        )
        .await;

        let fixtures = FixtureLoader::new(dir.path(), schema())
            .with_filter(TagFilter::parse("!smoke").unwrap())
            .load()
            .await
            .unwrap();
        assert_eq!(fixtures.len(), 1);
        assert_eq!(fixtures[0].fixture_id, "untagged");
    }

    #[tokio::test]
    async fn test_same_stem_in_two_formats_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yaml", CASE).await;
        write(
            dir.path(),
            "a.json",
            r#"{"input": "hi", "expected": {"type": "atomic", "name": "echo"}}"#,
        )
        .await;
        write(dir.path(), "b.yml", CASE).await;

        let err = FixtureLoader::new(dir.path(), schema()).load().await.unwrap_err();
        match err {
            LmFlowError::DuplicateFixtureId {
                fixture_id,
                first,
                second,
            } => {
                assert_eq!(fixture_id, "a");
                assert!(first.ends_with("a.json"));
                assert!(second.ends_with("a.yaml"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected_even_when_filtered_out() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "nested/case.yaml", CASE).await;
        write(dir.path(), "nested/case.yml", CASE).await;

        let err = FixtureLoader::new(dir.path(), schema())
            .with_filter(TagFilter::parse("!smoke").unwrap())
            .load()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LmFlowError::DuplicateFixtureId { ref fixture_id, .. } if fixture_id == "nested/case"
        ));
    }

    #[tokio::test]
    async fn test_single_permit_loads_everything() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.yaml", "b.yaml", "c.yaml", "d.yaml"] {
            write(dir.path(), name, CASE).await;
        }

        let fixtures = FixtureLoader::new(dir.path(), schema())
            .with_concurrency(1)
            .load()
            .await
            .unwrap();
        assert_eq!(fixtures.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_root_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FixtureLoader::new(dir.path().join("absent"), schema())
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, LmFlowError::Configuration(_)));
    }
}
