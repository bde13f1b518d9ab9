//! Stream Aggregator
//!
//! Drains a model's delta stream into one string, reporting each fragment and
//! the end of the stream to an observer. Fragments are appended in arrival
//! order; nothing is dropped or reordered.

use crate::error::{AskError, Result};
use crate::llm::{ChatDelta, DeltaStream};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Appended to partial text by redraw-style displays while a reply is streaming.
pub const PROGRESS_MARKER: char = '▌';

pub fn with_progress_marker(text: &str) -> String {
    let mut shown = String::with_capacity(text.len() + PROGRESS_MARKER.len_utf8());
    shown.push_str(text);
    shown.push(PROGRESS_MARKER);
    shown
}

/// How the stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishState {
    /// Terminal signal with finish reason "stop".
    Stopped,
    /// Terminal signal with another reason, e.g. "length" or "content_filter".
    Other(String),
    /// The stream ran out without any terminal signal.
    Missing,
}

impl FinishState {
    fn from_reason(reason: &str) -> Self {
        if reason == "stop" {
            FinishState::Stopped
        } else {
            FinishState::Other(reason.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledText {
    pub text: String,
    pub finish: FinishState,
}

impl AssembledText {
    pub fn is_complete(&self) -> bool {
        self.finish == FinishState::Stopped
    }

    /// Why the text can't be trusted as a whole reply, if it can't.
    pub fn incomplete_reason(&self) -> Option<String> {
        match &self.finish {
            FinishState::Stopped => None,
            FinishState::Other(reason) => Some(format!("model stream ended with finish reason '{}'", reason)),
            FinishState::Missing => Some("model stream ended without a finish signal".to_string()),
        }
    }
}

/// Receives one event per fragment and one when the stream ends.
pub trait StreamObserver: Send {
    fn on_delta(&mut self, _fragment: &str, _text: &str) {}

    fn on_finish(&mut self, _assembled: &AssembledText) {}
}

/// Observer for runs without any display.
pub struct NoopStreamObserver;

impl StreamObserver for NoopStreamObserver {}

/// Accumulation state, fed one delta at a time.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    text: String,
    finish_reason: Option<String>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta. Returns the appended fragment, if any.
    ///
    /// Deltas pushed after the terminal signal are ignored.
    pub fn push(&mut self, delta: ChatDelta) -> Option<String> {
        if self.is_finished() {
            return None;
        }

        let fragment = delta.content.filter(|c| !c.is_empty());
        if let Some(ref fragment) = fragment {
            self.text.push_str(fragment);
        }
        if let Some(reason) = delta.finish_reason {
            self.finish_reason = Some(reason);
        }
        fragment
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish(self) -> AssembledText {
        let finish = match self.finish_reason.as_deref() {
            Some(reason) => FinishState::from_reason(reason),
            None => FinishState::Missing,
        };
        AssembledText {
            text: self.text,
            finish,
        }
    }
}

/// Drain `stream` until its terminal signal (or its end).
///
/// Cancellation is observed between fragments; the stream is dropped on
/// cancellation, which releases the underlying subscription.
pub async fn aggregate(
    mut stream: DeltaStream,
    observer: &mut dyn StreamObserver,
    cancel: &CancellationToken,
) -> Result<AssembledText> {
    let mut aggregator = StreamAggregator::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled after {} chars", aggregator.text().len());
                return Err(AskError::Cancelled);
            }
            next = stream.next() => next,
        };

        let Some(delta) = next else {
            break;
        };

        if let Some(fragment) = aggregator.push(delta?) {
            observer.on_delta(&fragment, aggregator.text());
        }
        if aggregator.is_finished() {
            break;
        }
    }

    let assembled = aggregator.finish();
    if let Some(reason) = assembled.incomplete_reason() {
        warn!("⚠️  {} ({} chars assembled)", reason, assembled.text.len());
    }
    observer.on_finish(&assembled);
    Ok(assembled)
}
