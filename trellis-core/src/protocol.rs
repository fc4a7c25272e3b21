//! Runner wire protocol
//!
//! Messages exchanged over the runner websocket channel, plus the fixed
//! timeouts governing it. Every inbound message is validated for its
//! required fields before dispatch; unknown or malformed types are
//! rejected without mutating any state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::job::StepConfig;
use crate::error::ProtocolError;

/// Registration must arrive within this long after connect
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
/// An assigned step must be ACKed within this long or it is requeued
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Runners send a heartbeat this often
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A runner silent for this long is declared dead
pub const HEARTBEAT_DEAD_AFTER: Duration = Duration::from_secs(30);

/// Messages a runner sends to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    Register {
        runner_id: String,
        name: String,
        runner_type: String,
        #[serde(default)]
        labels: Vec<String>,
    },
    Ack {
        step_id: Uuid,
    },
    Heartbeat,
    Log {
        step_id: Uuid,
        lines: Vec<String>,
    },
    StepComplete {
        step_id: Uuid,
        exit_code: i32,
        #[serde(default)]
        error: Option<String>,
    },
}

impl RunnerMessage {
    /// Decode and validate one inbound frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: RunnerMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// Per-type required-field checks beyond what serde enforces
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            RunnerMessage::Register { runner_id, name, .. } => {
                if runner_id.trim().is_empty() {
                    return Err(ProtocolError::MissingField {
                        message_type: "register",
                        field: "runner_id",
                    });
                }
                if name.trim().is_empty() {
                    return Err(ProtocolError::MissingField {
                        message_type: "register",
                        field: "name",
                    });
                }
                Ok(())
            }
            RunnerMessage::Log { lines, .. } => {
                if lines.is_empty() {
                    return Err(ProtocolError::MissingField {
                        message_type: "log",
                        field: "lines",
                    });
                }
                Ok(())
            }
            RunnerMessage::Ack { .. }
            | RunnerMessage::Heartbeat
            | RunnerMessage::StepComplete { .. } => Ok(()),
        }
    }
}

/// Messages the backend sends to a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
    Registered {
        runner_id: String,
    },
    ExecuteStep {
        step_id: Uuid,
        execution_key: String,
        config: StepConfig,
    },
    Pong,
    Error {
        message: String,
    },
}

impl BackendMessage {
    pub fn to_json(&self) -> String {
        // Message enums serialize infallibly
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_round_trip() {
        let msg = RunnerMessage::Register {
            runner_id: "rig-1".to_string(),
            name: "bench rig".to_string(),
            runner_type: "hardware".to_string(),
            labels: vec!["arm64".to_string(), "gpio".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert_eq!(RunnerMessage::parse(&json).unwrap(), msg);
    }

    #[test]
    fn test_labels_default_to_empty() {
        let msg = RunnerMessage::parse(
            r#"{"type":"register","runner_id":"r","name":"n","runner_type":"hardware"}"#,
        )
        .unwrap();
        match msg {
            RunnerMessage::Register { labels, .. } => assert!(labels.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = RunnerMessage::parse(r#"{"type":"selfdestruct"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        // runner_id absent entirely
        assert!(RunnerMessage::parse(r#"{"type":"register","name":"n"}"#).is_err());
        // runner_id present but empty
        let err = RunnerMessage::parse(
            r#"{"type":"register","runner_id":"  ","name":"n","runner_type":"t"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "runner_id", .. }));
    }

    #[test]
    fn test_empty_log_batch_rejected() {
        let json = format!(r#"{{"type":"log","step_id":"{}","lines":[]}}"#, Uuid::new_v4());
        assert!(RunnerMessage::parse(&json).is_err());
    }

    #[test]
    fn test_heartbeat_is_bare() {
        assert_eq!(
            RunnerMessage::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            RunnerMessage::Heartbeat
        );
    }

    #[test]
    fn test_backend_messages_serialize_with_tag() {
        let msg = BackendMessage::Registered {
            runner_id: "rig-1".to_string(),
        };
        assert!(msg.to_json().contains(r#""type":"registered""#));
        assert!(BackendMessage::Pong.to_json().contains(r#""type":"pong""#));
    }
}
