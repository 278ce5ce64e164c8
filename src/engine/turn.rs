//! One request/response exchange and its delivery bridge.
//!
//! The producer side (`Turn`) lives inside the supervisor's state and is fed
//! by the output readers, timers and exit observer. The consumer side
//! (`TurnStream`) is handed to the caller. An unbounded channel sits between
//! them, so producers never wait on a slow consumer and the consumer suspends
//! only while nothing is queued.

use futures::Stream;
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::images::ImageFilter;
use super::markup::ToolMarkupFilter;
use super::types::{EngineEvent, ImageData, ToolUse};

pub(crate) struct Turn {
    pub id: String,
    tx: mpsc::UnboundedSender<EngineEvent>,
    /// Raw streamed text, tool spans included.
    merged: String,
    markup: ToolMarkupFilter,
    open_tools: HashSet<String>,
    images: ImageFilter,
    finished: bool,
}

impl Turn {
    pub fn new(max_images: usize) -> (Self, TurnStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let turn = Self {
            id: Uuid::new_v4().to_string(),
            tx,
            merged: String::new(),
            markup: ToolMarkupFilter::new(),
            open_tools: HashSet::new(),
            images: ImageFilter::new(max_images),
            finished: false,
        };
        (turn, TurnStream::new(rx))
    }

    /// Queue an event for the consumer. A consumer that went away is not an
    /// error; the turn still runs to completion.
    pub fn emit(&self, event: EngineEvent) {
        if self.finished {
            return;
        }
        let _ = self.tx.send(event);
    }

    /// Feed streamed text: raw text goes to the merged buffer, the visible
    /// part becomes a delta.
    pub fn push_text(&mut self, text: &str) {
        self.merged.push_str(text);
        let visible = self.markup.push(text);
        if !visible.is_empty() {
            self.emit(EngineEvent::TextDelta { text: visible });
        }
    }

    pub fn merged(&self) -> &str {
        &self.merged
    }

    /// Flush text held back while checking for a split marker.
    pub fn flush_text(&mut self) {
        let visible = self.markup.finish();
        if !visible.is_empty() {
            self.emit(EngineEvent::TextDelta { text: visible });
        }
    }

    pub fn start_tool(&mut self, tool: ToolUse) {
        if !self.open_tools.insert(tool.id) {
            return;
        }
        self.emit(EngineEvent::ToolStart {
            name: tool.name,
            input: tool.input,
        });
    }

    pub fn end_tool(&mut self, id: &str) {
        if self.open_tools.remove(id) {
            self.emit(EngineEvent::ToolEnd);
        }
    }

    pub fn push_image(&mut self, image: ImageData) {
        if self.images.admit(&image) {
            self.emit(EngineEvent::ImageData { image });
        }
    }

    /// Deliver `done`. Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        let _ = self.tx.send(EngineEvent::Done);
        self.finished = true;
    }

    /// Deliver `error` + `done`. No-op once finished.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.emit(EngineEvent::error(message));
        self.finish();
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.fail("turn abandoned");
    }
}

/// Consumer side of a turn: an ordered, finite stream ending with `Done`.
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    done: bool,
}

impl TurnStream {
    fn new(rx: mpsc::UnboundedReceiver<EngineEvent>) -> Self {
        Self { rx, done: false }
    }

    /// A stream that reports `error` + `done` without any process I/O.
    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(EngineEvent::error(message));
        let _ = tx.send(EngineEvent::Done);
        Self::new(rx)
    }
}

impl Stream for TurnStream {
    type Item = EngineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_done() {
                    self.done = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
