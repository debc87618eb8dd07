//! Command domain types
//!
//! Commands reach the daemon either on its local endpoint or as the answer to
//! a check-in. Both arrive as a [`CommandEnvelope`] and are parsed into a
//! typed [`Command`] only after the envelope has been authorized.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::lenient::{opt_u32_from_any, u32_from_any};
use crate::domain::task::{FrameRange, TaskId};

/// Raw command as sent by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub cmd: String,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Identity of the host the command is meant for
    #[serde(rename = "rentaflop_id", alias = "rentaflopId", default)]
    pub host_id: String,
}

/// A parsed, typed command
#[derive(Debug, Clone)]
pub enum Command {
    Mine(MineParams),
    Update(UpdateParams),
    Uninstall,
    SendLogs,
    Status,
    Benchmark,
}

impl Command {
    /// Parses an envelope, attaching the binary payload of a render submission
    pub fn from_envelope(
        envelope: &CommandEnvelope,
        render_file: Option<Vec<u8>>,
    ) -> Result<Self, CommandError> {
        let params = || {
            if envelope.params.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                envelope.params.clone()
            }
        };

        match envelope.cmd.as_str() {
            "mine" => {
                let mut mine: MineParams = serde_json::from_value(params())
                    .map_err(|e| CommandError::InvalidParams("mine".to_string(), e.to_string()))?;
                mine.render_file = render_file;
                Ok(Command::Mine(mine))
            }
            "update" => {
                let update = serde_json::from_value(params()).map_err(|e| {
                    CommandError::InvalidParams("update".to_string(), e.to_string())
                })?;
                Ok(Command::Update(update))
            }
            "uninstall" => Ok(Command::Uninstall),
            "send_logs" | "sendLogs" => Ok(Command::SendLogs),
            "status" => Ok(Command::Status),
            "benchmark" => Ok(Command::Benchmark),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Mine(_) => "mine",
            Command::Update(_) => "update",
            Command::Uninstall => "uninstall",
            Command::SendLogs => "send_logs",
            Command::Status => "status",
            Command::Benchmark => "benchmark",
        }
    }
}

/// Why an envelope could not be turned into a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Unknown(String),
    InvalidParams(String, String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Unknown(cmd) => write!(f, "unknown command '{}'", cmd),
            CommandError::InvalidParams(cmd, msg) => {
                write!(f, "invalid params for '{}': {}", cmd, msg)
            }
        }
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MineAction {
    Start,
    Stop,
}

/// Parameters of the `mine` command
///
/// With a `task_id` the command starts or stops a render task; without one
/// it starts or stops crypto mining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MineParams {
    pub action: MineAction,

    #[serde(deserialize_with = "u32_from_any")]
    pub gpu: u32,

    #[serde(default)]
    pub task_id: Option<TaskId>,

    #[serde(default, deserialize_with = "opt_u32_from_any")]
    pub start_frame: Option<u32>,

    #[serde(default, deserialize_with = "opt_u32_from_any")]
    pub n_frames: Option<u32>,

    /// Encrypted scene payload, attached from the multipart body
    #[serde(skip)]
    pub render_file: Option<Vec<u8>>,
}

impl MineParams {
    /// Frame range of a render submission, if both bounds were supplied
    pub fn frames(&self) -> Option<FrameRange> {
        FrameRange::from_count(self.start_frame?, self.n_frames?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Daemon code update
    #[serde(alias = "rentaflop")]
    Code,
    /// Security-only system package upgrade
    System,
}

/// Parameters of the `update` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParams {
    #[serde(rename = "type")]
    pub kind: UpdateKind,

    /// Git revision to move to; latest branch head when absent
    #[serde(default)]
    pub target_version: Option<String>,

    /// Whether a system update ends with a reboot
    #[serde(default = "default_reboot")]
    pub reboot: bool,
}

fn default_reboot() -> bool {
    true
}

impl UpdateParams {
    pub fn code(target_version: Option<String>) -> Self {
        Self {
            kind: UpdateKind::Code,
            target_version: target_version.filter(|v| !v.trim().is_empty()),
            reboot: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> CommandEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_render_submission() {
        let env = envelope(json!({
            "cmd": "mine",
            "params": {"action": "start", "gpu": "1", "task_id": 54, "start_frame": 1, "n_frames": 10},
            "rentaflop_id": "abc"
        }));
        assert_eq!(env.host_id, "abc");

        let Command::Mine(params) = Command::from_envelope(&env, Some(vec![1, 2, 3])).unwrap()
        else {
            panic!("expected mine command");
        };
        assert_eq!(params.action, MineAction::Start);
        assert_eq!(params.gpu, 1);
        assert_eq!(params.task_id.as_ref().unwrap().as_str(), "54");
        assert_eq!(params.frames(), FrameRange::new(1, 10));
        assert_eq!(params.render_file, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_update_accepts_legacy_type() {
        let env = envelope(json!({"cmd": "update", "params": {"type": "rentaflop"}}));
        let Command::Update(params) = Command::from_envelope(&env, None).unwrap() else {
            panic!("expected update command");
        };
        assert_eq!(params.kind, UpdateKind::Code);
        assert!(params.reboot);
        assert_eq!(params.target_version, None);
    }

    #[test]
    fn test_camel_case_identity_and_send_logs_alias() {
        let env = envelope(json!({"cmd": "sendLogs", "rentaflopId": "xyz"}));
        assert_eq!(env.host_id, "xyz");
        assert!(matches!(
            Command::from_envelope(&env, None),
            Ok(Command::SendLogs)
        ));
    }

    #[test]
    fn test_unknown_command() {
        let env = envelope(json!({"cmd": "format_disk"}));
        assert_eq!(
            Command::from_envelope(&env, None).unwrap_err(),
            CommandError::Unknown("format_disk".to_string())
        );
    }

    #[test]
    fn test_invalid_mine_params() {
        let env = envelope(json!({"cmd": "mine", "params": {"action": "start"}}));
        assert!(matches!(
            Command::from_envelope(&env, None),
            Err(CommandError::InvalidParams(_, _))
        ));
    }
}
