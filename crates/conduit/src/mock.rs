//! Deterministic substitutes for the transport and the dispatcher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::errors::{ConduitError, ConduitResult};
use crate::models::chunk::StreamChunk;
use crate::models::message::Role;
use crate::models::request::ProtocolRequest;
use crate::models::response::{ChatResponse, Choice, ResponseMessage, Response};
use crate::providers::sse::{done_frame, encode_frame};
use crate::stream::ChunkStream;
use crate::transport::{ensure_success, BodyStream, HttpRequest, HttpResponse, HttpTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum MockBody {
    Fixed(Bytes),
    Channel(mpsc::Receiver<Bytes>),
}

/// A canned HTTP response
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: MockBody,
}

impl MockResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: MockBody::Fixed(Bytes::from(body.to_string())),
        }
    }

    pub fn raw<B: Into<Bytes>>(status: u16, body: B) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: MockBody::Fixed(body.into()),
        }
    }

    /// Each payload framed as an event, followed by the terminal event
    pub fn sse(payloads: &[Value]) -> Self {
        let mut wire: String = payloads
            .iter()
            .map(|payload| encode_frame(&payload.to_string()))
            .collect();
        wire.push_str(&done_frame());
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: MockBody::Fixed(Bytes::from(wire)),
        }
    }

    /// A 200 event stream whose bytes are pushed through the returned sender.
    /// The body ends when the sender is dropped.
    pub fn streaming(buffer: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let response = Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: MockBody::Channel(receiver),
        };
        (sender, response)
    }
}

/// Sets the flag when the body that owns it is dropped
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Serves queued responses in order and records every request it sees.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    released: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, response: MockResponse) -> Self {
        self.push_response(response);
        self
    }

    pub fn push_response(&self, response: MockResponse) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    /// Whether a response body handed out by this transport has been dropped
    pub fn body_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
    ) -> ConduitResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }
        let url = request.url.clone();
        lock(&self.requests).push(request);

        let response = lock(&self.responses).pop_front().ok_or_else(|| {
            ConduitError::ProviderUnreachable {
                url,
                message: "no mock response queued".to_string(),
            }
        })?;

        let guard = ReleaseGuard(self.released.clone());
        let body: BodyStream = match response.body {
            MockBody::Fixed(bytes) => {
                stream::once(async move { Ok::<_, ConduitError>(bytes) }).boxed()
            }
            MockBody::Channel(receiver) => ReceiverStream::new(receiver)
                .map(Ok::<_, ConduitError>)
                .boxed(),
        };
        let body = body
            .map(move |chunk| {
                let _ = &guard;
                chunk
            })
            .boxed();

        ensure_success(
            HttpResponse {
                status: response.status,
                headers: response.headers,
                body,
            },
            cancel,
        )
        .await
    }
}

enum Outcome {
    Response(Response),
    Error(ConduitError),
}

/// Answers dispatches from queued responses and chunk lists.
#[derive(Default)]
pub struct MockDispatcher {
    outcomes: Mutex<VecDeque<Outcome>>,
    streams: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<ProtocolRequest>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, response: Response) -> Self {
        lock(&self.outcomes).push_back(Outcome::Response(response));
        self
    }

    pub fn with_error(self, error: ConduitError) -> Self {
        lock(&self.outcomes).push_back(Outcome::Error(error));
        self
    }

    pub fn with_stream(self, chunks: Vec<StreamChunk>) -> Self {
        lock(&self.streams).push_back(chunks);
        self
    }

    pub fn requests(&self) -> Vec<ProtocolRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<Response> {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }
        lock(&self.requests).push(request);
        match lock(&self.outcomes).pop_front() {
            Some(Outcome::Response(response)) => Ok(response),
            Some(Outcome::Error(error)) => Err(error),
            None => Err(ConduitError::ProviderUnreachable {
                url: "mock://dispatcher".to_string(),
                message: "no mock response queued".to_string(),
            }),
        }
    }

    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<ChunkStream> {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }
        let protocol = request.protocol();
        lock(&self.requests).push(request);
        if !protocol.supports_streaming() {
            return Err(ConduitError::UnsupportedStreaming(protocol));
        }

        let chunks = lock(&self.streams).pop_front().unwrap_or_default();
        let (sender, stream) = ChunkStream::channel(chunks.len());
        for chunk in chunks {
            // capacity covers every chunk, so this never fails
            let _ = sender.try_send(Ok(chunk));
        }
        Ok(stream.with_cancellation(cancel.clone()))
    }
}

/// A single-choice assistant reply
pub fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        id: None,
        model: None,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content: Some(content.to_string()),
                tool_calls: Vec::new(),
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: None,
    }
}
