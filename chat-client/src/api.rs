//! HTTP client for the relay's `/api` surface.

use crate::error::ClientError;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use service_core::protocol::{
    ChatEvent, ChatRequest, GenerateTitleRequest, GenerateTitleResponse, SyncResponse,
    USER_ID_HEADER,
};
use service_core::utils::LineBuffer;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::instrument;

const DATA_PREFIX: &str = "data:";

/// Normalized events of one response stream, closed by the terminal event.
pub type EventStream = BoxStream<'static, Result<ChatEvent, ClientError>>;

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(USER_ID_HEADER, &self.user_id)
    }

    /// Open the response stream for a chat request.
    #[instrument(skip(self, body), fields(chat_id = %body.chat_id, request_id = %body.request_id))]
    pub async fn chat(&self, body: &ChatRequest) -> Result<EventStream, ClientError> {
        let response = self
            .request(Method::POST, "/api/chat")
            .json(body)
            .send()
            .await?;
        let response = check(response).await?;

        Ok(parse_events(response.bytes_stream()).boxed())
    }

    /// Ask the server to cancel the running session of a chat.
    ///
    /// Returns false when the server had nothing running.
    pub async fn stop(&self, chat_id: &str) -> Result<bool, ClientError> {
        let response = self
            .request(Method::POST, &format!("/api/chat/{}/stop", chat_id))
            .send()
            .await?;

        match check(response).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn generate_title(
        &self,
        body: &GenerateTitleRequest,
    ) -> Result<GenerateTitleResponse, ClientError> {
        let response = self
            .request(Method::POST, "/api/chat/generate-title")
            .json(body)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    pub async fn sync(&self) -> Result<SyncResponse, ClientError> {
        let response = self.request(Method::GET, "/api/sync").send().await?;

        Ok(check(response).await?.json().await?)
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

struct ParseState<S> {
    bytes: Pin<Box<S>>,
    lines: LineBuffer,
    ready: VecDeque<ChatEvent>,
    finished: bool,
}

/// Decode a `text/event-stream` body into [`ChatEvent`]s.
///
/// Comment lines (keep-alives) and non-data fields are skipped. Nothing is
/// yielded after the terminal event.
pub fn parse_events<S, B, E>(bytes: S) -> impl Stream<Item = Result<ChatEvent, ClientError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ClientError> + Send + 'static,
{
    let state = ParseState {
        bytes: Box::pin(bytes),
        lines: LineBuffer::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                if event.done {
                    state.finished = true;
                    state.ready.clear();
                }
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            let lines = match state.bytes.next().await {
                Some(Ok(chunk)) => state.lines.push(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.finished = true;
                    state.lines.finish().into_iter().collect()
                }
            };

            for line in lines {
                let Some(data) = line.strip_prefix(DATA_PREFIX) else {
                    continue;
                };
                match serde_json::from_str::<ChatEvent>(data.trim()) {
                    Ok(event) => state.ready.push_back(event),
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e.into()), state));
                    }
                }
            }
        }
    })
}
