//! JSON messages exchanged with the client
//!
//! Client to server:
//!
//! ```text
//! {"action":"start","language":"python","code":"print(1)"}
//! {"action":"input","data":"21"}
//! {"action":"stop"}
//! ```
//!
//! Server to client: `{"output": ...}` (with `"prompt": "true"` when the
//! program awaits input), `{"error": ...}` and one terminal `{"status": ...}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::OutputFrame;
use crate::types::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON.")]
    InvalidJson,

    #[error("Unknown action.")]
    UnknownAction,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

/// A command sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientCommand {
    Start {
        #[serde(default)]
        language: String,
        #[serde(default)]
        code: String,
    },
    Input {
        #[serde(default)]
        data: String,
    },
    Stop,
}

const ACTIONS: [&str; 3] = ["start", "input", "stop"];

/// Parse one text message from the client
pub fn parse_client_message(text: &str) -> Result<ClientCommand, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    let known = value
        .get("action")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|action| ACTIONS.contains(&action));
    if !known {
        return Err(ProtocolError::UnknownAction);
    }

    serde_json::from_value(value).map_err(|_| ProtocolError::InvalidJson)
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Success,
    Error,
    Timeout,
    Stopped,
}

/// A message sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Output {
        output: String,
        #[serde(skip_serializing_if = "is_false", serialize_with = "true_string")]
        prompt: bool,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        friendly_error: Option<String>,
    },
    Status {
        status: SessionOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        execution_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        friendly_error: Option<String>,
    },
}

fn is_false(flag: &bool) -> bool {
    !flag
}

// Prompts are flagged with the string "true"
fn true_string<S: serde::Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *flag { "true" } else { "false" })
}

impl ServerMessage {
    pub fn output(text: impl Into<String>) -> Self {
        ServerMessage::Output {
            output: text.into(),
            prompt: false,
        }
    }

    pub fn prompt(text: impl Into<String>) -> Self {
        ServerMessage::Output {
            output: text.into(),
            prompt: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
            friendly_error: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl From<OutputFrame> for ServerMessage {
    fn from(frame: OutputFrame) -> Self {
        if frame.is_prompt() {
            ServerMessage::prompt(frame.data)
        } else {
            ServerMessage::output(frame.data)
        }
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(error: ProtocolError) -> Self {
        ServerMessage::error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::relay::{FrameKind, StreamOrigin};

    #[test]
    fn parse_start() {
        let command =
            parse_client_message(r#"{"action":"start","language":"python","code":"print(1)"}"#)
                .unwrap();
        assert_eq!(
            command,
            ClientCommand::Start {
                language: "python".into(),
                code: "print(1)".into()
            }
        );
    }

    #[test]
    fn parse_start_defaults_missing_fields() {
        assert_eq!(
            parse_client_message(r#"{"action":"start"}"#).unwrap(),
            ClientCommand::Start {
                language: String::new(),
                code: String::new()
            }
        );
    }

    #[test]
    fn parse_input_and_stop() {
        assert_eq!(
            parse_client_message(r#"{"action":"input","data":"21"}"#).unwrap(),
            ClientCommand::Input { data: "21".into() }
        );
        assert_eq!(
            parse_client_message(r#"{"action":"stop"}"#).unwrap(),
            ClientCommand::Stop
        );
    }

    #[test]
    fn malformed_json() {
        assert_eq!(
            parse_client_message("{not json"),
            Err(ProtocolError::InvalidJson)
        );
        assert_eq!(
            parse_client_message(r#"{"action":"input","data":5}"#),
            Err(ProtocolError::InvalidJson)
        );
    }

    #[test]
    fn unknown_action() {
        for text in [r#"{"action":"dance"}"#, r#"{"data":"x"}"#, "[]", "42"] {
            assert_eq!(
                parse_client_message(text),
                Err(ProtocolError::UnknownAction),
                "{text}"
            );
        }
    }

    #[test]
    fn protocol_errors_share_a_kind() {
        assert_eq!(ProtocolError::InvalidJson.kind(), ErrorKind::ProtocolError);
        assert_eq!(ProtocolError::UnknownAction.kind().as_str(), "protocol_error");
    }

    #[test]
    fn protocol_errors_render_client_messages() {
        assert_eq!(
            serde_json::to_value(ServerMessage::from(ProtocolError::InvalidJson)).unwrap(),
            json!({"error": "Invalid JSON."})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::from(ProtocolError::UnknownAction)).unwrap(),
            json!({"error": "Unknown action."})
        );
    }

    #[test]
    fn output_messages() {
        assert_eq!(
            serde_json::to_value(ServerMessage::output("42\n")).unwrap(),
            json!({"output": "42\n"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::prompt("n:")).unwrap(),
            json!({"output": "n:", "prompt": "true"})
        );
    }

    #[test]
    fn frames_convert_to_messages() {
        let frame = OutputFrame {
            data: "n:".into(),
            kind: FrameKind::Prompt,
            origin: StreamOrigin::Stdout,
        };
        assert_eq!(ServerMessage::from(frame), ServerMessage::prompt("n:"));
    }

    #[test]
    fn status_message() {
        let message = ServerMessage::Status {
            status: SessionOutcome::Timeout,
            exit_code: None,
            execution_time: 10.5,
            friendly_error: Some("too long".into()),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"status": "timeout", "execution_time": 10.5, "friendly_error": "too long"})
        );
        assert!(message.to_json().starts_with(r#"{"status":"timeout""#));
    }
}
