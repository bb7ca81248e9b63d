//! The content union carried by tool results, prompt messages and sampling
//! messages. Variants are discriminated by a `type` field.

use serde::{Deserialize, Serialize};

use super::resource::{RawResource, ResourceContents};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded image bytes.
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    ResourceLink(RawResource),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Content::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn resource(resource: ResourceContents) -> Self {
        Content::Resource { resource }
    }

    /// Serialise any value to its JSON text as a text content block.
    pub fn json<S: Serialize>(value: &S) -> Result<Self, serde_json::Error> {
        Ok(Content::text(serde_json::to_string(value)?))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_content_is_type_tagged() {
        let content = Content::text("hi user");
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({"type": "text", "text": "hi user"})
        );
    }

    #[test]
    fn resource_link_flattens_the_resource() {
        let content = Content::ResourceLink(RawResource::new("file:///tmp/a.txt", "a.txt"));
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "resource_link");
        assert_eq!(value["uri"], "file:///tmp/a.txt");
    }
}
