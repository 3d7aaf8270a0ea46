//! Stream normaliser: turns any adapter's raw chunk stream into a byte
//! stream of UTF-8 assistant text deltas.
//!
//! The adapter supplies a decoder so this module never learns backend wire
//! shapes. A completion callback fires exactly once, immediately before the
//! stream closes (regular end, mid-stream error, or early close when a
//! function-call candidate shows up). Dropping the returned stream drops the
//! upstream reader, which cancels the HTTP response body.

use bytes::Bytes;
use futures::Stream;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::provider::{ChunkEvent, ProviderError, RawChunkStream, TextDeltaStream, TokenUsage};

/// Everything the consumer learns at stream close.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Full accumulated assistant text
    pub content: String,
    /// Last usage report seen (terminal chunk for OpenAI-shaped backends)
    pub usage: Option<TokenUsage>,
    /// The stream was closed early because a function call appeared
    pub ended_by_tool_call: bool,
    /// The stream terminated with an error
    pub errored: bool,
}

/// Invoked exactly once, immediately before the stream closes.
pub type CompletionCallback = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Wrap a raw chunk stream into the normalised byte stream.
pub fn normalise<D>(inner: RawChunkStream, decode: D, on_complete: CompletionCallback) -> TextDeltaStream
where
    D: FnMut(&serde_json::Value) -> ChunkEvent + Send + 'static,
{
    Box::pin(NormalisedStream {
        inner,
        decode,
        content: String::new(),
        usage: None,
        on_complete: Some(on_complete),
        done: false,
    })
}

/// Replay an already-resolved answer as a one-chunk stream. Used when the
/// caller asked for streaming but the answer was fully produced during the
/// tool-resolution phase.
pub fn replay(content: String, usage: Option<TokenUsage>, on_complete: CompletionCallback) -> TextDeltaStream {
    let stream = async_stream::stream! {
        if !content.is_empty() {
            yield Ok(Bytes::from(content.clone()));
        }
        on_complete(StreamOutcome {
            content,
            usage,
            ended_by_tool_call: false,
            errored: false,
        });
    };
    Box::pin(stream)
}

#[pin_project]
struct NormalisedStream<D> {
    #[pin]
    inner: RawChunkStream,
    decode: D,
    content: String,
    usage: Option<TokenUsage>,
    on_complete: Option<CompletionCallback>,
    done: bool,
}

impl<D> Stream for NormalisedStream<D>
where
    D: FnMut(&serde_json::Value) -> ChunkEvent + Send + 'static,
{
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let event = (this.decode)(&chunk);

                    if let Some(usage) = event.usage {
                        *this.usage = Some(usage);
                    }

                    if event.tool_call {
                        *this.done = true;
                        complete(this.on_complete, this.content, this.usage, true, false);
                        return Poll::Ready(None);
                    }

                    match event.text {
                        Some(text) if !text.is_empty() => {
                            this.content.push_str(&text);
                            return Poll::Ready(Some(Ok(Bytes::from(text))));
                        }
                        // Keep-alive or usage-only chunk: keep pulling
                        _ => continue,
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    complete(this.on_complete, this.content, this.usage, false, true);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    complete(this.on_complete, this.content, this.usage, false, false);
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn complete(
    slot: &mut Option<CompletionCallback>,
    content: &String,
    usage: &Option<TokenUsage>,
    ended_by_tool_call: bool,
    errored: bool,
) {
    if let Some(callback) = slot.take() {
        callback(StreamOutcome {
            content: content.clone(),
            usage: usage.clone(),
            ended_by_tool_call,
            errored,
        });
    }
}
