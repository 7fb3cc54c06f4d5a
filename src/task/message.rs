//! Mailbox message types for inter-tier communication.
//!
//! Every exchange between the coordinator, a worker, and a supervisor is a
//! durable [`TaskMessage`] appended to the task's mailbox. Inbound messages
//! flow down toward the pair; outbound reports flow up to the coordinator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which tier authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Coordinator,
    Worker,
    Supervisor,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Coordinator => "coordinator",
            Tier::Worker => "worker",
            Tier::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Tier::Coordinator),
            "worker" => Ok(Tier::Worker),
            "supervisor" => Ok(Tier::Supervisor),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Messages flowing down to a worker or supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    /// Mid-flight guidance for the worker.
    Instruction,
    /// An answer to a `needs_input` report.
    Input,
    Pause,
    Resume,
    Cancel,
    /// Changed goal or supervision guidance.
    Redirect,
    /// Tells a controller loop to wind down without touching task status.
    Terminate,
}

impl InboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::Instruction => "instruction",
            InboundKind::Input => "input",
            InboundKind::Pause => "pause",
            InboundKind::Resume => "resume",
            InboundKind::Cancel => "cancel",
            InboundKind::Redirect => "redirect",
            InboundKind::Terminate => "terminate",
        }
    }

    /// Kinds that restart a terminal task when sent to it.
    pub fn can_revive(&self) -> bool {
        matches!(self, InboundKind::Instruction | InboundKind::Redirect)
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reports flowing up from a worker or supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Progress,
    Artifact,
    NeedsInput,
    Completed,
    Failed,
    /// Supervisor judgement of worker output.
    Assessment,
    /// Supervisor corrective action taken on the worker.
    Intervention,
    /// Supervisor request for coordinator attention.
    Escalation,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Progress => "progress",
            OutboundKind::Artifact => "artifact",
            OutboundKind::NeedsInput => "needs_input",
            OutboundKind::Completed => "completed",
            OutboundKind::Failed => "failed",
            OutboundKind::Assessment => "assessment",
            OutboundKind::Intervention => "intervention",
            OutboundKind::Escalation => "escalation",
        }
    }

    /// Only a supervisor (or the coordinator forcing a verdict) may emit these.
    pub fn supervisor_only(&self) -> bool {
        matches!(
            self,
            OutboundKind::Assessment | OutboundKind::Intervention | OutboundKind::Escalation
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundKind::Completed | OutboundKind::Failed)
    }
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message kind together with its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Inbound(InboundKind),
    Outbound(OutboundKind),
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Inbound(k) => k.as_str(),
            MessageKind::Outbound(k) => k.as_str(),
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, MessageKind::Inbound(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "instruction" => MessageKind::Inbound(InboundKind::Instruction),
            "input" => MessageKind::Inbound(InboundKind::Input),
            "pause" => MessageKind::Inbound(InboundKind::Pause),
            "resume" => MessageKind::Inbound(InboundKind::Resume),
            "cancel" => MessageKind::Inbound(InboundKind::Cancel),
            "redirect" => MessageKind::Inbound(InboundKind::Redirect),
            "terminate" => MessageKind::Inbound(InboundKind::Terminate),
            "progress" => MessageKind::Outbound(OutboundKind::Progress),
            "artifact" => MessageKind::Outbound(OutboundKind::Artifact),
            "needs_input" => MessageKind::Outbound(OutboundKind::NeedsInput),
            "completed" => MessageKind::Outbound(OutboundKind::Completed),
            "failed" => MessageKind::Outbound(OutboundKind::Failed),
            "assessment" => MessageKind::Outbound(OutboundKind::Assessment),
            "intervention" => MessageKind::Outbound(OutboundKind::Intervention),
            "escalation" => MessageKind::Outbound(OutboundKind::Escalation),
            other => return Err(format!("unknown message kind: {other}")),
        };
        Ok(kind)
    }
}

/// A single durable mailbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task_id: Uuid,
    pub ts: DateTime<Utc>,
    pub sender: Tier,
    pub kind: MessageKind,
    /// Short human-readable summary.
    pub content: String,
    /// Longer free-form payload, may be empty.
    pub detail: String,
    /// Set once a controller has dequeued the message. Never deleted.
    pub consumed: bool,
}

impl TaskMessage {
    pub fn inbound(
        task_id: Uuid,
        sender: Tier,
        kind: InboundKind,
        content: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(task_id, sender, MessageKind::Inbound(kind), content, detail)
    }

    pub fn outbound(
        task_id: Uuid,
        sender: Tier,
        kind: OutboundKind,
        content: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(task_id, sender, MessageKind::Outbound(kind), content, detail)
    }

    fn new(
        task_id: Uuid,
        sender: Tier,
        kind: MessageKind,
        content: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            ts: Utc::now(),
            sender,
            kind,
            content: content.into(),
            detail: detail.into(),
            consumed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_strings() {
        let kinds = [
            "instruction",
            "input",
            "pause",
            "resume",
            "cancel",
            "redirect",
            "terminate",
            "progress",
            "artifact",
            "needs_input",
            "completed",
            "failed",
            "assessment",
            "intervention",
            "escalation",
        ];
        for s in kinds {
            let kind: MessageKind = s.parse().unwrap();
            assert_eq!(kind.to_string(), s);
        }
        assert!("nonsense".parse::<MessageKind>().is_err());
    }

    #[test]
    fn directions_are_fixed_per_kind() {
        let pause: MessageKind = "pause".parse().unwrap();
        assert!(pause.is_inbound());
        let progress: MessageKind = "progress".parse().unwrap();
        assert!(!progress.is_inbound());
    }

    #[test]
    fn supervisor_only_kinds() {
        assert!(OutboundKind::Assessment.supervisor_only());
        assert!(OutboundKind::Intervention.supervisor_only());
        assert!(OutboundKind::Escalation.supervisor_only());
        assert!(!OutboundKind::Progress.supervisor_only());
        assert!(!OutboundKind::Completed.supervisor_only());
    }

    #[test]
    fn revive_kinds() {
        assert!(InboundKind::Instruction.can_revive());
        assert!(InboundKind::Redirect.can_revive());
        assert!(!InboundKind::Input.can_revive());
        assert!(!InboundKind::Cancel.can_revive());
    }

    #[test]
    fn new_messages_start_unconsumed() {
        let task_id = Uuid::new_v4();
        let msg = TaskMessage::inbound(task_id, Tier::Coordinator, InboundKind::Pause, "pause", "");
        assert!(!msg.consumed);
        assert_eq!(msg.task_id, task_id);
        assert!(msg.kind.is_inbound());
    }
}
