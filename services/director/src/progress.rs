//! Progress events for rollout stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rollout_events::{StageEvent, TaskState};
use rollout_id::{EventId, TaskId};
use tokio::sync::mpsc;
use tracing::warn;

/// Receives every progress event of a run.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StageEvent);
}

/// Numbers events and hands them to a sink.
pub struct ProgressReporter {
    task: TaskId,
    next: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl ProgressReporter {
    pub fn new(task: TaskId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            task,
            next: AtomicU64::new(EventId::FIRST.value()),
            sink,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Opens a stage of `total` tasks.
    pub fn stage(self: &Arc<Self>, name: &str, tags: Vec<String>, total: u32) -> Stage {
        Stage {
            reporter: Arc::clone(self),
            name: name.to_string(),
            tags,
            total,
        }
    }

    fn emit(
        &self,
        stage: &Stage,
        label: &str,
        index: u32,
        state: TaskState,
        error: Option<String>,
    ) {
        let id = EventId::new(self.next.fetch_add(1, Ordering::Relaxed));
        let mut builder = StageEvent::builder()
            .event_id(id)
            .task_id(self.task)
            .stage(stage.name.clone(), stage.tags.clone())
            .task(label, index, stage.total)
            .state(state);
        if let Some(error) = error {
            builder = builder.error(error);
        }

        match builder.build() {
            Ok(event) => self.sink.emit(event),
            Err(e) => warn!(stage = %stage.name, task = label, error = %e, "Dropping malformed progress event"),
        }
    }
}

/// A named batch of tasks sharing one `total`.
#[derive(Clone)]
pub struct Stage {
    reporter: Arc<ProgressReporter>,
    name: String,
    tags: Vec<String>,
    total: u32,
}

impl Stage {
    pub fn started(&self, label: &str, index: u32) {
        self.reporter
            .emit(self, label, index, TaskState::Started, None);
    }

    pub fn finished(&self, label: &str, index: u32) {
        self.reporter
            .emit(self, label, index, TaskState::Finished, None);
    }

    pub fn failed(&self, label: &str, index: u32, error: impl ToString) {
        self.reporter
            .emit(self, label, index, TaskState::Failed, Some(error.to_string()));
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Prints each event as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutEventSink;

impl EventSink for StdoutEventSink {
    fn emit(&self, event: StageEvent) {
        match event.to_json_line() {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to encode stage event"),
        }
    }
}

/// Forwards events to an unbounded channel.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<StageEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: StageEvent) {
        if self.tx.send(event).is_err() {
            warn!("Progress receiver dropped");
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<StageEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StageEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: StageEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
