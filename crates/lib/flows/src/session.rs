use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailroom_models::{
    CallUUID, ExitUUID, FlowType, FlowUUID, NodeUUID, RunStatus, RunUUID, SessionStatus,
    SessionUUID, SprintUUID, StepUUID,
};

use crate::{Event, FlowContact, FlowRef, Trigger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub uuid: StepUUID,
    pub node_uuid: NodeUUID,
    pub exit_uuid: Option<ExitUUID>,
    pub arrived_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    pub value: String,
    pub category: Option<String>,
    pub node_uuid: NodeUUID,
    pub input: Option<String>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub uuid: RunUUID,
    pub flow: FlowRef,
    pub status: RunStatus,
    #[serde(default)]
    pub path: Vec<Step>,
    /// Keyed by snake-cased result name.
    #[serde(default)]
    pub results: BTreeMap<String, RunResult>,
    #[serde(default)]
    pub responded: bool,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
}

impl Run {
    pub fn end(&mut self, status: RunStatus, now: DateTime<Utc>) {
        if self.status.is_ended() {
            return;
        }
        self.status = status;
        self.exited_on = Some(now);
        self.modified_on = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Msg,
    Dial,
}

/// What kind of input a voice message wait expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitHint {
    Digits,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wait {
    pub kind: WaitKind,
    pub expires_on: Option<DateTime<Utc>>,
    pub timeout_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<WaitHint>,
}

/// An engine session. Persisted as the `output` of the session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub uuid: SessionUUID,
    pub session_type: FlowType,
    pub status: SessionStatus,
    pub contact: FlowContact,
    pub trigger: Trigger,
    #[serde(default)]
    pub runs: Vec<Run>,
    pub wait: Option<Wait>,
    pub expires_on: Option<DateTime<Utc>>,
    pub call_uuid: Option<CallUUID>,
    /// Engine-private state, carried but not interpreted by the core.
    #[serde(default)]
    pub state: serde_json::Value,
}

impl Session {
    /// The innermost run that is active or waiting.
    pub fn current_run(&self) -> Option<&Run> {
        self.runs.iter().rev().find(|r| !r.status.is_ended())
    }

    pub fn current_run_mut(&mut self) -> Option<&mut Run> {
        self.runs.iter_mut().rev().find(|r| !r.status.is_ended())
    }

    pub fn current_flow(&self) -> Option<FlowUUID> {
        if self.status != SessionStatus::Waiting {
            return None;
        }
        self.current_run().map(|r| r.flow.uuid)
    }

    /// The flow and node of the step that produced an event.
    pub fn find_step(&self, step_uuid: StepUUID) -> Option<(FlowUUID, NodeUUID)> {
        self.runs.iter().find_map(|run| {
            run.path
                .iter()
                .find(|step| step.uuid == step_uuid)
                .map(|step| (run.flow.uuid, step.node_uuid))
        })
    }

    pub fn run(&self, uuid: RunUUID) -> Option<&Run> {
        self.runs.iter().find(|r| r.uuid == uuid)
    }
}

/// One traversal of an exit to a destination node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub flow_uuid: FlowUUID,
    pub node_uuid: NodeUUID,
    pub exit_uuid: ExitUUID,
    pub destination_uuid: NodeUUID,
    pub operand: Option<String>,
    pub time: DateTime<Utc>,
}

/// Output of a single start or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub uuid: SprintUUID,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Sprint {
    pub fn new() -> Self {
        Self {
            uuid: SprintUUID::new(),
            events: Vec::new(),
            segments: Vec::new(),
        }
    }
}

impl Default for Sprint {
    fn default() -> Self {
        Self::new()
    }
}
