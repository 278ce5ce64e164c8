//! Turn-level display smoothing.
//!
//! Raw engine events are too jittery to show directly: early text is often
//! discarded a moment later when the agent decides to call a tool. The
//! scheduler buffers text, replaces it with an activity label while tools run,
//! and only starts streaming once the agent has been quiet for a while.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::engine::timer::TimerSlot;
use crate::engine::EngineEvent;

use super::activity::tool_activity_label;

/// A change to apply to the visible reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayAction {
    /// Replace the visible content with a "working" label.
    ShowActivity { label: String },
    /// Append text to the visible reply.
    StreamText { text: String },
    /// Replace the visible reply with the final text.
    SetFinal { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    BufferingText,
    ToolActive,
    StreamingFinal,
}

type DeliverFn = Box<dyn Fn(DisplayAction) + Send + Sync>;
type LabelFn = Box<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Per-turn scheduler. Create one for each turn.
pub struct ToolAwareDisplayScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    deliver: DeliverFn,
    config: SchedulerConfig,
    core: Mutex<SchedulerCore>,
}

struct SchedulerCore {
    state: SchedulerState,
    buffer: String,
    flush_timer: TimerSlot,
    label: LabelFn,
    disposed: bool,
}

impl ToolAwareDisplayScheduler {
    /// `deliver` runs under the scheduler's lock and must not call back into
    /// this scheduler.
    pub fn new<F>(deliver: F, config: SchedulerConfig) -> Self
    where
        F: Fn(DisplayAction) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SchedulerInner {
                deliver: Box::new(deliver),
                config,
                core: Mutex::new(SchedulerCore {
                    state: SchedulerState::Idle,
                    buffer: String::new(),
                    flush_timer: TimerSlot::new(),
                    label: Box::new(tool_activity_label),
                    disposed: false,
                }),
            }),
        }
    }

    /// Replace the default tool label formatter.
    pub fn with_label_fn<L>(self, label: L) -> Self
    where
        L: Fn(&str, &Value) -> String + Send + Sync + 'static,
    {
        self.inner.core.lock().label = Box::new(label);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.core.lock().state
    }

    /// Feed one engine event. Must be called from within a Tokio runtime.
    pub fn handle(&self, event: &EngineEvent) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.disposed {
            return;
        }

        match event {
            EngineEvent::TextDelta { text } => match core.state {
                SchedulerState::Idle => {
                    core.buffer.push_str(text);
                    core.state = SchedulerState::BufferingText;
                    inner.arm_flush(&mut core, inner.config.flush_delay());
                }
                SchedulerState::BufferingText | SchedulerState::ToolActive => {
                    core.buffer.push_str(text);
                }
                SchedulerState::StreamingFinal => {
                    (inner.deliver)(DisplayAction::StreamText { text: text.clone() });
                }
            },
            EngineEvent::TextFinal { text } => {
                core.flush_timer.cancel();
                core.buffer.clear();
                core.state = SchedulerState::StreamingFinal;
                (inner.deliver)(DisplayAction::SetFinal { text: text.clone() });
            }
            EngineEvent::ToolStart { name, input } => {
                core.flush_timer.cancel();
                core.buffer.clear();
                core.state = SchedulerState::ToolActive;
                let label = (core.label)(name.as_str(), input);
                (inner.deliver)(DisplayAction::ShowActivity { label });
            }
            EngineEvent::ToolEnd => {
                if core.state == SchedulerState::ToolActive {
                    core.buffer.clear();
                    core.state = SchedulerState::BufferingText;
                    inner.arm_flush(&mut core, inner.config.post_tool_delay());
                }
            }
            EngineEvent::Error { .. } | EngineEvent::Done => core.flush_timer.cancel(),
            EngineEvent::ImageData { .. } | EngineEvent::LogLine { .. } => {}
        }
    }

    /// Feed every event of a turn, stopping after `done`.
    pub async fn drive<S>(&self, mut events: S)
    where
        S: Stream<Item = EngineEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.handle(&event);
            if event.is_done() {
                break;
            }
        }
    }

    /// Stop reacting to events and cancel any pending flush.
    pub fn dispose(&self) {
        let mut core = self.inner.core.lock();
        core.disposed = true;
        core.flush_timer.cancel();
    }
}

impl SchedulerInner {
    fn arm_flush(self: &Arc<Self>, core: &mut SchedulerCore, delay: Duration) {
        let inner = Arc::downgrade(self);
        core.flush_timer.arm(delay, move |generation| {
            if let Some(inner) = inner.upgrade() {
                inner.on_flush(generation);
            }
        });
    }

    fn on_flush(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.disposed || !core.flush_timer.take_fired(generation) {
            return;
        }
        if core.state != SchedulerState::BufferingText {
            return;
        }
        core.state = SchedulerState::StreamingFinal;
        if !core.buffer.is_empty() {
            let text = std::mem::take(&mut core.buffer);
            (self.deliver)(DisplayAction::StreamText { text });
        }
    }
}
