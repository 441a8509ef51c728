//! Server-sent-event tap-while-passthrough for streaming responses.
//!
//! Buffer incoming bytes, split on blank lines, parse `data:` frames as
//! JSON, accumulate `delta.content` length, forward the raw bytes to the
//! client unmodified.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

/// Incrementally parses SSE framing and accumulates the character length of
/// every `choices[*].delta.content` seen, without altering the bytes it taps.
#[derive(Default)]
pub struct SseTap {
    buffer: String,
    accumulated_chars: usize,
}

impl SseTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulated_chars(&self) -> usize {
        self.accumulated_chars
    }

    /// Feed one chunk of raw bytes; returns nothing (the bytes themselves
    /// are forwarded unmodified by the caller).
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(idx) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..idx + 2).collect();
            self.consume_frame(&frame);
        }
    }

    fn consume_frame(&mut self, frame: &str) {
        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(content) = value.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
                self.accumulated_chars += content.chars().count();
            }
        }
    }
}

/// Tap an upstream byte stream while forwarding every chunk to the client
/// verbatim. `on_complete` runs once the upstream stream ends (success or
/// error), receiving the final accumulated character count, mirroring the
/// teacher's persist-after-stream-ends pattern.
pub fn tap_passthrough<S, F>(
    mut upstream: S,
    mut on_complete: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
    F: FnMut(usize) + Send + 'static,
{
    async_stream::stream! {
        let mut tap = SseTap::new();
        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    tap.push(&chunk);
                    yield Ok(chunk);
                }
                Some(Err(err)) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, err));
                    break;
                }
                None => break,
            }
        }
        on_complete(tap.accumulated_chars());
    }
}
