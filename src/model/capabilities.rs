//! Capability sets negotiated at initialize. Declared once, immutable for
//! the session's lifetime.

use serde::{Deserialize, Serialize};

use super::JsonObject;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

impl ListChangedCapability {
    pub const LIST_CHANGED: Self = Self {
        list_changed: Some(true),
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<ListChangedCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
}

impl ServerCapabilities {
    pub fn supports_tools_list_changed(&self) -> bool {
        self.tools.is_some_and(|c| c.list_changed.unwrap_or(false))
    }

    pub fn supports_prompts_list_changed(&self) -> bool {
        self.prompts.is_some_and(|c| c.list_changed.unwrap_or(false))
    }

    pub fn supports_resources_list_changed(&self) -> bool {
        self.resources
            .is_some_and(|c| c.list_changed.unwrap_or(false))
    }

    pub fn supports_resource_subscription(&self) -> bool {
        self.resources.is_some_and(|c| c.subscribe.unwrap_or(false))
    }
}

impl ClientCapabilities {
    pub fn supports_roots_list_changed(&self) -> bool {
        self.roots.is_some_and(|c| c.list_changed.unwrap_or(false))
    }

    pub fn supports_sampling(&self) -> bool {
        self.sampling.is_some()
    }

    pub fn supports_elicitation(&self) -> bool {
        self.elicitation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_capabilities_serialise_to_empty_object() {
        let caps = ServerCapabilities::default();
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({}));
    }

    #[test]
    fn tools_capability_round_trip() {
        let caps = ServerCapabilities {
            tools: Some(ListChangedCapability::LIST_CHANGED),
            ..Default::default()
        };
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value, json!({"tools": {"listChanged": true}}));
        assert!(caps.supports_tools_list_changed());
    }
}
