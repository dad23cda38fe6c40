//! Streaming decoder: turns an SSE body into an ordered channel of chunks.
//!
//! One task produces into a bounded channel per stream. The channel is
//! closed exactly once, on the terminal sentinel, EOF, cancellation or the
//! first error. Errors are delivered as the last item before the close;
//! cancellation closes without one. The body reader is dropped, and with it
//! the connection released, on every exit path.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::errors::{ConduitError, ConduitResult};
use crate::models::chunk::StreamChunk;
use crate::models::message::Role;
use crate::models::response::{ChatResponse, Choice, ResponseMessage, Usage};
use crate::models::tool::ToolCall;
use crate::providers::base::Capability;
use crate::providers::sse::{SseFrame, SseParser};
use crate::transport::BodyStream;

pub const DEFAULT_CHUNK_BUFFER: usize = 16;

/// Receiving end of a streaming response.
///
/// Once the cancellation token it was opened with fires, no further chunks
/// are yielded even if some were already buffered.
pub struct ChunkStream {
    inner: ReceiverStream<ConduitResult<StreamChunk>>,
    cancel: Option<CancellationToken>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl ChunkStream {
    pub fn new(receiver: mpsc::Receiver<ConduitResult<StreamChunk>>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
            cancel: None,
            cancelled: None,
        }
    }

    /// A stream fed by the returned sender; it ends when the sender is dropped.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ConduitResult<StreamChunk>>, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (sender, Self::new(receiver))
    }

    /// End the stream as soon as `cancel` fires, even while the producer
    /// keeps its sender open.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancelled = Some(Box::pin(cancel.clone().cancelled_owned()));
        self.cancel = Some(cancel);
        self
    }

    /// Next chunk, or `None` once the producer has closed the channel
    pub async fn recv(&mut self) -> Option<ConduitResult<StreamChunk>> {
        self.next().await
    }

    /// Fold every delta into a complete response.
    pub async fn collect_response(mut self) -> ConduitResult<ChatResponse> {
        let mut accumulator = ResponseAccumulator::default();
        while let Some(chunk) = self.next().await {
            accumulator.push(chunk?);
        }
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(ConduitError::Cancelled);
        }
        Ok(accumulator.finish())
    }
}

impl Stream for ChunkStream {
    type Item = ConduitResult<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Poll::Ready(None);
        }
        // Registers the waker so a pending consumer sees cancellation
        if let Some(cancelled) = self.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(None);
            }
        }
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream").finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Close {
    Sentinel,
    Eof,
    Cancelled,
    ConsumerGone,
    Failed(ConduitError),
}

/// Start decoding `body` on its own task and return the consuming end.
pub fn spawn_decoder(
    body: BodyStream,
    capability: Arc<dyn Capability>,
    cancel: CancellationToken,
    buffer: usize,
) -> ChunkStream {
    let (sender, stream) = ChunkStream::channel(buffer);
    let stream = stream.with_cancellation(cancel.clone());
    let protocol = capability.protocol();

    tokio::spawn(async move {
        let close = decode(body, capability.as_ref(), &cancel, &sender).await;
        match close {
            Close::Failed(error) => {
                tracing::debug!(%protocol, error = %error, "stream failed");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = sender.send(Err(error)) => {}
                }
            }
            reason => tracing::debug!(%protocol, ?reason, "stream closed"),
        }
    });

    stream
}

async fn decode(
    mut body: BodyStream,
    capability: &dyn Capability,
    cancel: &CancellationToken,
    sender: &mpsc::Sender<ConduitResult<StreamChunk>>,
) -> Close {
    let mut parser = SseParser::default();
    let mut choices = OpenChoices::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Close::Cancelled,
            next = body.next() => next,
        };
        let frames = match next {
            Some(Ok(bytes)) => parser.push(&bytes),
            Some(Err(error)) => return Close::Failed(error),
            None => break,
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(error) => return Close::Failed(error),
        };
        if let Some(close) = forward(frames, capability, cancel, sender, &mut choices).await {
            return close;
        }
    }

    let frames = match parser.finish() {
        Ok(frames) => frames,
        Err(error) => return Close::Failed(error),
    };
    if let Some(close) = forward(frames, capability, cancel, sender, &mut choices).await {
        return close;
    }

    if choices.all_finished() {
        Close::Eof
    } else {
        Close::Failed(ConduitError::StreamParseFailed(
            "stream ended before the terminal event with unfinished choices".to_string(),
        ))
    }
}

async fn forward(
    frames: Vec<SseFrame>,
    capability: &dyn Capability,
    cancel: &CancellationToken,
    sender: &mpsc::Sender<ConduitResult<StreamChunk>>,
    choices: &mut OpenChoices,
) -> Option<Close> {
    for frame in frames {
        let payload = match frame {
            SseFrame::Done => return Some(Close::Sentinel),
            SseFrame::Data(payload) => payload,
        };
        let chunk = match capability.parse_chunk(&payload) {
            Ok(chunk) => chunk,
            Err(error) => return Some(Close::Failed(error)),
        };
        choices.observe(&chunk);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(Close::Cancelled),
            sent = sender.send(Ok(chunk)) => {
                if sent.is_err() {
                    return Some(Close::ConsumerGone);
                }
            }
        }
    }
    None
}

/// Choice indexes seen so far and whether each has finished
#[derive(Debug, Default)]
struct OpenChoices {
    finished: BTreeMap<u32, bool>,
}

impl OpenChoices {
    fn observe(&mut self, chunk: &StreamChunk) {
        for choice in &chunk.choices {
            let finished = self.finished.entry(choice.index).or_insert(false);
            *finished |= choice.finish_reason.is_some();
        }
    }

    fn all_finished(&self) -> bool {
        self.finished.values().all(|finished| *finished)
    }
}

#[derive(Debug, Default)]
struct PartialChoice {
    role: Option<Role>,
    content: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    finish_reason: Option<String>,
}

/// Folds streamed deltas into the equivalent unary response
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    id: Option<String>,
    model: String,
    choices: BTreeMap<u32, PartialChoice>,
    usage: Option<Usage>,
}

impl ResponseAccumulator {
    pub fn push(&mut self, chunk: StreamChunk) {
        if self.id.is_none() {
            self.id = chunk.id;
        }
        if self.model.is_empty() {
            self.model = chunk.model;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let partial = self.choices.entry(choice.index).or_default();
            if let Some(role) = choice.delta.role {
                partial.role = Some(role);
            }
            if let Some(content) = choice.delta.content {
                partial.content.push_str(&content);
            }
            for delta in choice.delta.tool_calls {
                let call = partial
                    .tool_calls
                    .entry(delta.index)
                    .or_insert_with(|| ToolCall::new("", "", ""));
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(kind) = delta.kind {
                    call.kind = kind;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.function.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.function.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                partial.finish_reason = choice.finish_reason;
            }
        }
    }

    pub fn finish(self) -> ChatResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, partial)| {
                let tool_calls: Vec<ToolCall> = partial.tool_calls.into_values().collect();
                let content = if partial.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(partial.content)
                };
                Choice {
                    index,
                    message: ResponseMessage {
                        role: partial.role.unwrap_or(Role::Assistant),
                        content,
                        tool_calls,
                    },
                    finish_reason: partial.finish_reason,
                }
            })
            .collect();

        ChatResponse {
            id: self.id,
            model: Some(self.model).filter(|model| !model.is_empty()),
            choices,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::{ChatCapability, EmbeddingsCapability};
    use crate::providers::sse::{done_frame, encode_frame};
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    fn body(parts: Vec<String>) -> BodyStream {
        stream::iter(parts.into_iter().map(|part| Ok(Bytes::from(part)))).boxed()
    }

    fn delta(content: &str) -> String {
        json!({"model": "m1", "choices": [{"index": 0, "delta": {"content": content}}]}).to_string()
    }

    fn finish() -> String {
        json!({"model": "m1", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})
            .to_string()
    }

    async fn drain(mut stream: ChunkStream) -> Vec<ConduitResult<StreamChunk>> {
        let mut items = Vec::new();
        while let Some(item) = stream.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_frames_then_sentinel_close_cleanly() -> anyhow::Result<()> {
        let wire = format!(
            "{}{}{}",
            encode_frame(&delta("Hel")),
            encode_frame(&delta("lo")),
            done_frame()
        );
        // split mid-line to exercise buffering
        let (head, tail) = wire.split_at(17);
        let stream = spawn_decoder(
            body(vec![head.to_string(), tail.to_string()]),
            Arc::new(ChatCapability),
            CancellationToken::new(),
            DEFAULT_CHUNK_BUFFER,
        );

        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        let contents: Vec<String> = items
            .into_iter()
            .map(|item| item.map(|chunk| chunk.content()))
            .collect::<ConduitResult<_>>()?;
        assert_eq!(contents, vec!["Hel", "lo"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_parse_error_is_the_last_item() {
        let wire = format!("{}{}", encode_frame(&delta("a")), encode_frame("{not json"));
        let stream = spawn_decoder(
            body(vec![wire, encode_frame(&delta("never"))]),
            Arc::new(ChatCapability),
            CancellationToken::new(),
            DEFAULT_CHUNK_BUFFER,
        );

        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(ConduitError::StreamParseFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_after_finish_reason_is_clean() {
        let wire = format!("{}{}", encode_frame(&delta("a")), encode_frame(&finish()));
        let items = drain(spawn_decoder(
            body(vec![wire]),
            Arc::new(ChatCapability),
            CancellationToken::new(),
            DEFAULT_CHUNK_BUFFER,
        ))
        .await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_eof_with_open_choice_fails() {
        let items = drain(spawn_decoder(
            body(vec![encode_frame(&delta("a"))]),
            Arc::new(ChatCapability),
            CancellationToken::new(),
            DEFAULT_CHUNK_BUFFER,
        ))
        .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[1],
            Err(ConduitError::StreamParseFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_without_streaming() {
        let items = drain(spawn_decoder(
            body(vec![encode_frame("{}")]),
            Arc::new(EmbeddingsCapability),
            CancellationToken::new(),
            DEFAULT_CHUNK_BUFFER,
        ))
        .await;
        assert!(matches!(
            items.as_slice(),
            [Err(ConduitError::UnsupportedStreaming(_))]
        ));
    }

    #[tokio::test]
    async fn test_cancelled_stream_yields_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = drain(spawn_decoder(
            body(vec![encode_frame(&delta("a")), done_frame()]),
            Arc::new(ChatCapability),
            cancel,
            DEFAULT_CHUNK_BUFFER,
        ))
        .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_pending_consumer_wakes_on_cancel() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let (sender, stream) = ChunkStream::channel(4);
        let mut stream = stream.with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let next = tokio::time::timeout(std::time::Duration::from_millis(500), stream.recv()).await?;
        assert!(next.is_none());
        // The producer is still alive; the stream ended because of the token
        assert!(!sender.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_collect_response_merges_deltas() -> anyhow::Result<()> {
        let chunks = vec![
            json!({"id": "c1", "model": "m1", "choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                {"index": 0, "id": "call_1", "type": "function", "function": {"name": "add", "arguments": "{\"a\":"}}
            ]}}]}),
            json!({"model": "m1", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "2,\"b\":3}"}}
            ]}}]}),
            json!({"model": "m1", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}],
                   "usage": {"prompt_tokens": 5, "completion_tokens": 7}}),
        ];
        let (sender, stream) = ChunkStream::channel(DEFAULT_CHUNK_BUFFER);
        for chunk in chunks {
            sender.send(Ok(serde_json::from_value(chunk)?)).await?;
        }
        drop(sender);

        let response = stream.collect_response().await?;
        assert_eq!(response.id.as_deref(), Some("c1"));
        assert_eq!(response.finish_reason(), Some("tool_calls"));
        let call = &response.choices[0].message.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name(), "add");
        assert_eq!(call.parsed_arguments()?, json!({"a": 2, "b": 3}));
        assert_eq!(response.choices[0].message.content, None);
        assert_eq!(response.usage.and_then(|usage| usage.total()), Some(12));
        Ok(())
    }

    #[tokio::test]
    async fn test_collect_response_surfaces_stream_error() {
        let (sender, stream) = ChunkStream::channel(2);
        let _ = sender
            .send(Err(ConduitError::StreamParseFailed("bad".into())))
            .await;
        drop(sender);
        assert!(stream.collect_response().await.is_err());
    }
}
