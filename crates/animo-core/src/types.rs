use serde::{Deserialize, Serialize};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Content block in a conversation entry (text, image, tool_use).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// `"base64"` or `"url"`.
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64_png(data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".into(),
            media_type: "image/png".into(),
            data: data.into(),
        }
    }

    /// Build a source from an `image_url` value, unpacking `data:` URIs.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return Self {
                    source_type: "base64".into(),
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                };
            }
        }
        Self {
            source_type: "url".into(),
            media_type: "image/png".into(),
            data: url.to_string(),
        }
    }

    /// Render as a URL usable in an `image_url` part.
    pub fn to_url(&self) -> String {
        if self.source_type == "base64" {
            format!("data:{};base64,{}", self.media_type, self.data)
        } else {
            self.data.clone()
        }
    }
}

/// A chat message as sent by HTTP callers (OpenAI-style shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: ChatContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    /// Convert the wire content into content blocks, dropping unsupported parts.
    pub fn to_blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            ChatContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ChatPart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
                    ChatPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                        source: ImageSource::from_url(&image_url.url),
                    }),
                    ChatPart::Unsupported => None,
                })
                .collect(),
        }
    }

    /// Plain text of the message, image parts skipped.
    pub fn text(&self) -> String {
        self.to_blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_plain_text() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"draw a circle"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(
            msg.to_blocks(),
            vec![ContentBlock::Text {
                text: "draw a circle".into()
            }]
        );
    }

    #[test]
    fn test_chat_message_parts_with_image() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"like this"},
                {"type":"image_url","image_url":{"url":"data:image/jpeg;base64,QUJD"}},
                {"type":"audio","data":"x"}
            ]}"#,
        )
        .unwrap();
        let blocks = msg.to_blocks();
        assert_eq!(blocks.len(), 2);
        match &blocks[1] {
            ContentBlock::Image { source } => {
                assert_eq!(source.source_type, "base64");
                assert_eq!(source.media_type, "image/jpeg");
                assert_eq!(source.data, "QUJD");
            }
            other => panic!("expected image, got {other:?}"),
        }
        assert_eq!(msg.text(), "like this");
    }

    #[test]
    fn test_image_source_plain_url() {
        let source = ImageSource::from_url("https://example.com/a.png");
        assert_eq!(source.source_type, "url");
        assert_eq!(source.to_url(), "https://example.com/a.png");
    }

    #[test]
    fn test_image_source_data_uri_round_trip() {
        let source = ImageSource::base64_png("aWtlcG5n");
        assert_eq!(source.to_url(), "data:image/png;base64,aWtlcG5n");
        assert_eq!(ImageSource::from_url(&source.to_url()), source);
    }
}
