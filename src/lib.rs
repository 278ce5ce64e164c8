//! Relay between a chat front end and a long-lived coding agent process.
//!
//! - [`engine::ProcessTurnSupervisor`] keeps one agent CLI process alive across
//!   turns and turns its stream-json output into [`engine::EngineEvent`]s.
//! - [`display::ToolAwareDisplayScheduler`] smooths a turn's events into
//!   display updates.
//! - [`keyed_queue::KeyedMutexQueue`] serializes turns per conversation.

pub mod config;
pub mod display;
pub mod engine;
pub mod keyed_queue;

pub use config::{
    load_settings, load_settings_from, RelaySettings, SchedulerConfig, SettingsError,
    SupervisorConfig,
};
pub use display::{tool_activity_label, DisplayAction, SchedulerState, ToolAwareDisplayScheduler};
pub use engine::{
    ClaudeStreamDecoder, EngineError, EngineEvent, ImageData, LogStream, ProcessState,
    ProcessTurnSupervisor, RecordPart, TurnStream, WireDecoder,
};
pub use keyed_queue::KeyedMutexQueue;
