//! Response framing for chat streams.
//!
//! `EventStream` passes text through as produced. `Platform` writes one line
//! per character: the marker `0:` followed by the character as a JSON string.

use serde::de::Error as _;

use crate::AgentEvent;

const PLATFORM_MARKER: &str = "0:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    EventStream,
    Platform,
}

impl Framing {
    pub fn for_platform(is_for_platform: bool) -> Self {
        if is_for_platform {
            Self::Platform
        } else {
            Self::EventStream
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::EventStream => "text/event-stream",
            Self::Platform => "text/plain; charset=utf-8",
        }
    }

    /// Encode text into frames, in order.
    pub fn encode(self, text: &str) -> Vec<String> {
        match self {
            Self::EventStream if text.is_empty() => Vec::new(),
            Self::EventStream => vec![text.to_string()],
            Self::Platform => text.chars().map(platform_frame).collect(),
        }
    }

    /// Bytes to write for one agent event, if it has a text rendering.
    ///
    /// Only streamed text and terminal errors reach the client; tool activity
    /// and usage stay internal.
    pub fn encode_event(self, event: &AgentEvent) -> Option<String> {
        let text = match event {
            AgentEvent::PartialReply { delta } => delta.clone(),
            AgentEvent::Error { message, .. } => format!("Error: {message}"),
            AgentEvent::ToolCall { .. } | AgentEvent::ToolResult { .. } | AgentEvent::Usage { .. } => {
                return None;
            }
        };
        let frames = self.encode(&text);
        (!frames.is_empty()).then(|| frames.concat())
    }
}

fn platform_frame(ch: char) -> String {
    let mut buf = [0u8; 4];
    // Serializing a str cannot fail.
    let quoted = serde_json::to_string(ch.encode_utf8(&mut buf) as &str).unwrap_or_default();
    format!("{PLATFORM_MARKER}{quoted}\n")
}

/// Reassemble text from a platform-framed body.
pub fn decode_platform_frames(body: &str) -> Result<String, serde_json::Error> {
    let mut text = String::new();
    for line in body.split_terminator('\n') {
        let Some(quoted) = line.strip_prefix(PLATFORM_MARKER) else {
            return Err(serde_json::Error::custom(format!("frame without marker: {line:?}")));
        };
        text.push_str(&serde_json::from_str::<String>(quoted)?);
    }
    Ok(text)
}
