//! Scripted provider for testing.
//!
//! Each `stream_chat` call takes the next queued [`MockStream`]; an empty
//! queue answers with a short fixed reply.

use super::{ChatProvider, CompletionRequest, ProviderError, ProviderStream};
use crate::services::credentials::ModelCredentials;
use crate::services::decoder::DecodedEvent;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub enum MockStream {
    /// Yield these items, then end.
    Events(Vec<Result<DecodedEvent, ProviderError>>),
    /// Fail before streaming starts.
    Fail(ProviderError),
    /// Yield whatever the test pushes into the paired sender.
    Live(mpsc::Receiver<Result<DecodedEvent, ProviderError>>),
}

impl MockStream {
    /// Tokens followed by a terminal event.
    pub fn tokens(tokens: &[&str]) -> Self {
        let mut events: Vec<_> = tokens.iter().map(|t| Ok(DecodedEvent::token(*t))).collect();
        events.push(Ok(DecodedEvent::finished()));
        MockStream::Events(events)
    }

    pub fn live() -> (Self, mpsc::Sender<Result<DecodedEvent, ProviderError>>) {
        let (tx, rx) = mpsc::channel(16);
        (MockStream::Live(rx), tx)
    }
}

pub struct MockChatProvider {
    streams: Mutex<VecDeque<MockStream>>,
    completion: Mutex<Result<String, ProviderError>>,
    requests: Mutex<Vec<CompletionRequest>>,
    stream_calls: AtomicUsize,
    complete_calls: AtomicUsize,
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            completion: Mutex::new(Ok("Mock conversation title".to_string())),
            requests: Mutex::new(Vec::new()),
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_stream(&self, stream: MockStream) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.push_back(stream);
        }
    }

    pub fn set_completion(&self, completion: Result<String, ProviderError>) {
        if let Ok(mut current) = self.completion.lock() {
            *current = completion;
        }
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, streaming and one-shot.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, request: &CompletionRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn stream_chat(
        &self,
        _model: &ModelCredentials,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(request);

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let next = self.streams.lock().ok().and_then(|mut s| s.pop_front());
        match next.unwrap_or_else(|| MockStream::tokens(&["Mock", " response"])) {
            MockStream::Events(events) => Ok(Box::pin(tokio_stream::iter(events))),
            MockStream::Fail(err) => Err(err),
            MockStream::Live(rx) => Ok(Box::pin(ReceiverStream::new(rx))),
        }
    }

    async fn complete(
        &self,
        _model: &ModelCredentials,
        request: &CompletionRequest,
    ) -> Result<String, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.record(request);

        self.completion
            .lock()
            .map_err(|_| ProviderError::InvalidResponse("mock poisoned".to_string()))?
            .clone()
    }
}
