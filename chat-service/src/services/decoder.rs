//! Upstream stream decoder.
//!
//! Turns the line-oriented `data: {...}` stream of a chat-completions
//! endpoint into normalized [`DecodedEvent`]s. Chunk boundaries of the byte
//! stream are irrelevant: the same bytes always decode to the same events.

use super::providers::ProviderError;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use service_core::utils::LineBuffer;
use std::collections::VecDeque;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const FINISH_REASON_STOP: &str = "stop";

/// A provider-agnostic stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub content: String,
    pub done: bool,
}

impl DecodedEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn finished() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental decoder. Once a terminal event has been produced every later
/// input is ignored.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineBuffer,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode every line completed by `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        if self.finished {
            return Vec::new();
        }
        let lines = self.lines.push(chunk);
        self.decode_lines(lines)
    }

    /// Decode an unterminated last line, if the stream ended without `\n`.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        if self.finished {
            return Vec::new();
        }
        let tail = self.lines.finish();
        self.decode_lines(tail)
    }

    fn decode_lines(&mut self, lines: impl IntoIterator<Item = String>) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        for line in lines {
            self.decode_line(&line, &mut events);
            if self.finished {
                break;
            }
        }
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<DecodedEvent>) {
        let Some(payload) = line.trim().strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();

        if payload == DONE_SENTINEL {
            events.push(DecodedEvent::finished());
            self.finished = true;
            return;
        }

        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed upstream line");
                return;
            }
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.and_then(|d| d.content) {
            if !content.is_empty() {
                events.push(DecodedEvent::token(content));
            }
        }

        if choice.finish_reason.as_deref() == Some(FINISH_REASON_STOP) {
            events.push(DecodedEvent::finished());
            self.finished = true;
        }
    }
}

/// Adapt a byte stream into a stream of decoded events.
///
/// A transport error ends the stream after being yielded once. A byte stream
/// that ends without a terminal line simply ends; the caller decides what
/// that means.
pub fn decode_stream<S, B, E>(
    bytes: S,
) -> impl Stream<Item = Result<DecodedEvent, ProviderError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: StreamDecoder,
        pending: VecDeque<DecodedEvent>,
        exhausted: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.exhausted || state.decoder.is_finished() {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.feed(chunk.as_ref());
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.exhausted = true;
                    let events = state.decoder.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
}
