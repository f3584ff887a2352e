//! Request and result values shared by local and cloud backends.

use serde::{Deserialize, Serialize};

/// One chat turn. `role` is `system`, `user` or `assistant`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A finished chat completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub model: String,
    pub message: ChatMessage,
}

/// A generated image or video, either hosted or carried inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratedMedia {
    Url { url: String },
    Inline { mime: String, base64: String },
}

impl GeneratedMedia {
    pub fn url(&self) -> Option<&str> {
        match self {
            GeneratedMedia::Url { url } => Some(url),
            GeneratedMedia::Inline { .. } => None,
        }
    }

    /// `data:` URI for inline media, the URL otherwise.
    pub fn to_uri(&self) -> String {
        match self {
            GeneratedMedia::Url { url } => url.clone(),
            GeneratedMedia::Inline { mime, base64 } => format!("data:{mime};base64,{base64}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_media_becomes_data_uri() {
        let media = GeneratedMedia::Inline {
            mime: "image/png".into(),
            base64: "iVBORw0KGgo=".into(),
        };
        assert_eq!(media.to_uri(), "data:image/png;base64,iVBORw0KGgo=");
        assert!(media.url().is_none());
    }

    #[test]
    fn media_serializes_with_kind_tag() {
        let media = GeneratedMedia::Url {
            url: "https://cdn.example/v.mp4".into(),
        };
        let json = serde_json::to_value(&media).unwrap();
        assert_eq!(json["kind"], "url");
        assert_eq!(json["url"], "https://cdn.example/v.mp4");
    }
}
