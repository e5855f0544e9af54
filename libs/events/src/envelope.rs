//! Stage event envelope: the record emitted for every task transition.

use chrono::{DateTime, Utc};
use rollout_id::{EventId, TaskId};
use serde::{Deserialize, Serialize};

use crate::{EventError, TaskState};

/// One progress record within a stage.
///
/// A stage is a named batch of tasks (for example every instance of one
/// group being updated); each task reports `started` and then exactly one of
/// `finished` or `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Position within the emitting task's stream.
    pub event_id: EventId,

    /// The convergence run this event belongs to.
    pub task_id: TaskId,

    pub occurred_at: DateTime<Utc>,

    /// Stage name, e.g. "Updating instance".
    pub stage: String,

    /// Free-form tags; the instance group name for instance stages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Human-readable task label, e.g. "web/inst_... (0) (canary)".
    pub task: String,

    /// 1-based position of the task within the stage.
    pub index: u32,

    /// Number of tasks in the stage.
    pub total: u32,

    pub state: TaskState,

    /// Percent complete for this task.
    pub progress: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageEvent {
    pub fn builder() -> StageEventBuilder {
        StageEventBuilder::default()
    }

    /// Serializes the event as a single JSON line.
    pub fn to_json_line(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Default)]
pub struct StageEventBuilder {
    event_id: Option<EventId>,
    task_id: Option<TaskId>,
    occurred_at: Option<DateTime<Utc>>,
    stage: Option<String>,
    tags: Vec<String>,
    task: Option<String>,
    index: Option<u32>,
    total: Option<u32>,
    state: Option<TaskState>,
    error: Option<String>,
}

impl StageEventBuilder {
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn task_id(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>, tags: Vec<String>) -> Self {
        self.stage = Some(stage.into());
        self.tags = tags;
        self
    }

    pub fn task(mut self, label: impl Into<String>, index: u32, total: u32) -> Self {
        self.task = Some(label.into());
        self.index = Some(index);
        self.total = Some(total);
        self
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Builds the event, checking required fields and index bounds.
    pub fn build(self) -> Result<StageEvent, EventError> {
        let state = self.state.ok_or(EventError::MissingField("state"))?;
        let index = self.index.ok_or(EventError::MissingField("index"))?;
        let total = self.total.ok_or(EventError::MissingField("total"))?;

        if index == 0 || index > total {
            return Err(EventError::IndexOutOfRange { index, total });
        }
        if self.error.is_some() && state != TaskState::Failed {
            return Err(EventError::InvalidPayload(format!(
                "error message attached to a {state} event"
            )));
        }

        Ok(StageEvent {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            task_id: self.task_id.ok_or(EventError::MissingField("task_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            stage: self.stage.ok_or(EventError::MissingField("stage"))?,
            tags: self.tags,
            task: self.task.ok_or(EventError::MissingField("task"))?,
            index,
            total,
            progress: state.progress(),
            state,
            error: self.error,
        })
    }
}
