//! Turning engine events into chat display updates.

mod activity;
mod scheduler;

pub use activity::tool_activity_label;
pub use scheduler::{DisplayAction, SchedulerState, ToolAwareDisplayScheduler};
