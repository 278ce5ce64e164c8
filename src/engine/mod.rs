//! Agent process engine: launch, per-turn I/O and lifecycle supervision.

pub mod decoder;
mod framing;
mod images;
pub mod launch;
mod markup;
pub mod protocol;
mod supervisor;
pub(crate) mod timer;
mod turn;
pub mod types;

pub use decoder::{ClaudeStreamDecoder, RecordPart, ResultContent, WireDecoder};
pub use images::image_key;
pub use markup::strip_markers;
pub use supervisor::ProcessTurnSupervisor;
pub use turn::TurnStream;
pub use types::{EngineError, EngineEvent, ImageData, LogStream, ProcessState, ToolUse};
