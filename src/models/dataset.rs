//! Conversation dataset types served by the dataset manager.

use serde::{Deserialize, Serialize};

/// A named list of media contents. A single turn may batch several payloads
/// of the same media type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub contents: Vec<String>,
}

impl Media {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            contents: vec![content.into()],
        }
    }

    pub fn named(name: impl Into<String>, contents: Vec<String>) -> Self {
        Self {
            name: name.into(),
            contents,
        }
    }
}

/// One interaction in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Offset in milliseconds from the schedule origin, for fixed schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Milliseconds to wait before sending this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<Media>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Media>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audios: Vec<Media>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Media>,
}

impl Turn {
    /// All non-empty text contents, in order.
    pub fn text_contents(&self) -> impl Iterator<Item = &str> {
        self.texts
            .iter()
            .flat_map(|t| t.contents.iter())
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// An ordered list of turns identified by `session_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_contents_skips_empty() {
        let turn = Turn {
            texts: vec![
                Media::named("q", vec!["hello".into(), "".into()]),
                Media::text("world"),
            ],
            ..Default::default()
        };
        let contents: Vec<_> = turn.text_contents().collect();
        assert_eq!(contents, vec!["hello", "world"]);
    }
}
