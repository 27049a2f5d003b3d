//! Wire messages
//!
//! Every frame is an [`Envelope`]: `{type, seq, payload}` with payloads
//! drawn from the domain entities. `seq` is per-connection and
//! per-direction, assigned by the writer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowkit::domain::{ExecutionOptions, ExecutionSegment, MetricsReport, SlaveInfo, SlaveStatus, TaskUpdate, Workflow};

/// A task handed to one slave: the workflow plus this slave's share
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskAssignment {
    pub task_id: String,
    pub execution_id: String,
    pub workflow: Workflow,
    pub segment: ExecutionSegment,
    pub options: ExecutionOptions,
}

/// Control-plane command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    /// Abort in-flight work, drain, stay registered
    Stop,
    /// Gate iteration dispatch without releasing assignments
    Pause,
    Resume,
    /// Adjust the effective VU cap within max-vus
    Scale,
}

/// A command fanned out from the master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommandMessage {
    pub command: CommandType,
    /// Scope; `None` means every execution on the slave
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Typed payloads multiplexed over one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    Register(SlaveInfo),
    RegisterAck {
        accepted: bool,
        #[serde(default)]
        assigned_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Heartbeat {
        slave_id: String,
        status: SlaveStatus,
    },
    Assign(TaskAssignment),
    Command(CommandMessage),
    Update(TaskUpdate),
    Metrics(MetricsReport),
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::RegisterAck { .. } => "register-ack",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Assign(_) => "assign",
            Self::Command(_) => "command",
            Self::Update(_) => "update",
            Self::Metrics(_) => "metrics",
        }
    }
}

/// One framed message with its per-connection sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub message: Message,
}
