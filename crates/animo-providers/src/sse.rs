//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts a byte stream (usually a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use crate::ProviderError;

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, ProviderError>> + Send>>;

/// Parse a reqwest response body as an SSE stream.
pub fn parse_response(response: reqwest::Response) -> SseStream {
    Box::pin(parse_sse_stream(response.bytes_stream()))
}

/// Parse any byte stream as SSE. Lines may be split across chunks.
pub fn parse_sse_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + 'static,
{
    let byte_stream = byte_stream.map(|r| r.map_err(|e| e.to_string()));

    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
        },
        |mut state| async move {
            loop {
                // Try to extract a line from the buffer
                if let Some(newline_pos) = state.buffer.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        // Comment, skip
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        state.current_id = Some(value.trim_start().to_string());
                    }
                    // Ignore unknown fields
                    continue;
                }

                // Need more data from the stream
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(ProviderError::Transient(format!("SSE stream error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        // Stream ended. Dispatch any remaining data.
                        let event = state.take_event()?;
                        return Some((Ok(event), state));
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseState {
    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}
