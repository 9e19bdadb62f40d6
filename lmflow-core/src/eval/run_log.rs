//! Run log: the persisted record of one evaluation run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trace::TraceNode;

/// Who ran what, where and when
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: Uuid,
    /// Invoking command line
    pub cmd: String,
    pub cwd: String,
    pub timestamp: DateTime<Utc>,
    pub user: String,
}

impl RunIdentity {
    /// Identity of the current process
    pub fn current() -> Self {
        let cmd = std::env::args().collect::<Vec<_>>().join(" ");
        let cwd = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            run_id: Uuid::new_v4(),
            cmd,
            cwd,
            timestamp: Utc::now(),
            user,
        }
    }
}

/// Trace of one successfully evaluated fixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLog {
    pub fixture_id: String,
    pub content_hash: String,
    pub trace: TraceNode,
}

/// A fixture whose evaluation failed, recorded when the run keeps going
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLog {
    pub fixture_id: String,
    pub content_hash: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    #[serde(flatten)]
    pub identity: RunIdentity,

    /// Resolved model specifications
    pub models: Vec<serde_json::Value>,

    pub cases: Vec<CaseLog>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureLog>,
}

impl RunLog {
    pub fn run_id(&self) -> Uuid {
        self.identity.run_id
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn case(&self, fixture_id: &str) -> Option<&CaseLog> {
        self.cases.iter().find(|case| case.fixture_id == fixture_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Conversation;
    use serde_json::json;

    fn log() -> RunLog {
        RunLog {
            identity: RunIdentity::current(),
            models: vec![json!({"type": "mock", "name": "m"})],
            cases: vec![CaseLog {
                fixture_id: "a/b".to_string(),
                content_hash: "00ff".to_string(),
                trace: TraceNode::Atomic {
                    name: "s".to_string(),
                    model: "m".to_string(),
                    input: json!("x"),
                    prompt: Conversation::user("x"),
                    completion: "y".to_string(),
                    output: json!("y"),
                    expected: None,
                    judgment: None,
                },
            }],
            failures: vec![],
        }
    }

    #[test]
    fn test_identity_fields_flattened() {
        let value = serde_json::to_value(log()).unwrap();
        assert!(value.get("run_id").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("user").is_some());
        assert!(value.get("failures").is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let original = log();
        let text = serde_json::to_string_pretty(&original).unwrap();
        let parsed: RunLog = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.case("a/b").is_some());
        assert!(parsed.is_success());
    }
}
