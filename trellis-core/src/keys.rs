//! Execution idempotency keys and trigger dedup keys
//!
//! An execution key `{run_id}:{step_index}:{attempt}` is the unique
//! identity of one step-execution attempt. Retries increment the attempt
//! and therefore produce a new key; dispatching the same key twice must
//! land on the same row.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::KeyError;

/// Unique identity of one step-execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub run_id: String,
    pub step_index: usize,
    pub attempt: u32,
}

impl ExecutionKey {
    pub fn new(run_id: Uuid, step_index: usize, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_index,
            attempt,
        }
    }

    /// Parse a key string
    ///
    /// The two rightmost colon-delimited fields are index and attempt, so
    /// run ids that themselves contain colons survive a round-trip.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let mut fields = s.rsplitn(3, ':');

        let attempt = fields
            .next()
            .ok_or_else(|| KeyError(s.to_string()))?
            .parse::<u32>()
            .map_err(|_| KeyError(s.to_string()))?;
        let step_index = fields
            .next()
            .ok_or_else(|| KeyError(s.to_string()))?
            .parse::<usize>()
            .map_err(|_| KeyError(s.to_string()))?;
        let run_id = fields.next().ok_or_else(|| KeyError(s.to_string()))?;

        if run_id.is_empty() {
            return Err(KeyError(s.to_string()));
        }

        Ok(Self {
            run_id: run_id.to_string(),
            step_index,
            attempt,
        })
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.run_id, self.step_index, self.attempt)
    }
}

/// Dedup ledger key for an incoming trigger
///
/// Push triggers may include the commit SHA so distinct commits to one
/// ref are not collapsed together.
pub fn trigger_key(
    trigger_type: &str,
    repo_id: &str,
    git_ref: &str,
    commit_sha: Option<&str>,
) -> String {
    match commit_sha {
        Some(sha) => format!("{}:{}:{}:{}", trigger_type, repo_id, git_ref, sha),
        None => format!("{}:{}:{}", trigger_type, repo_id, git_ref),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let run_id = Uuid::new_v4();
        let key = ExecutionKey::new(run_id, 3, 2);
        let parsed = ExecutionKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.run_id, run_id.to_string());
        assert_eq!(parsed.step_index, 3);
        assert_eq!(parsed.attempt, 2);
    }

    #[test]
    fn test_run_id_with_colons_round_trips() {
        let key = ExecutionKey {
            run_id: "org:proj:run-7".to_string(),
            step_index: 0,
            attempt: 1,
        };
        let parsed = ExecutionKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(ExecutionKey::parse("").is_err());
        assert!(ExecutionKey::parse("no-colons").is_err());
        assert!(ExecutionKey::parse("run:1").is_err());
        assert!(ExecutionKey::parse("run:one:2").is_err());
        assert!(ExecutionKey::parse(":0:1").is_err());
    }

    #[test]
    fn test_trigger_key_shapes() {
        assert_eq!(trigger_key("push", "repo-1", "main", None), "push:repo-1:main");
        assert_eq!(
            trigger_key("push", "repo-1", "main", Some("abc123")),
            "push:repo-1:main:abc123"
        );
    }
}
