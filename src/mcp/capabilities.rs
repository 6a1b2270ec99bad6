//! Capability negotiation structures exchanged during the handshake.
//!
//! Marker capabilities (`logging`, `completions`, `sampling`, `elicitation`)
//! serialize as `{}` when enabled and are omitted when disabled. Capabilities
//! with sub-flags serialize only the sub-flags that are set. When reading a
//! peer's payload the presence of a top-level key is what enables a
//! capability; malformed sub-objects fall back to "no sub-flags".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Open-ended experimental feature blocks, passed through untouched.
pub type ExperimentalCapabilities = BTreeMap<String, Value>;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Serde adapter for marker capabilities.
mod marker {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::{Map, Value};

    pub fn serialize<S: Serializer>(enabled: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        // Only reached when enabled; disabled markers are skipped.
        debug_assert!(*enabled);
        Map::<String, Value>::new().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Value::deserialize(deserializer)?;
        Ok(true)
    }
}

/// Deserialize a sub-flag capability leniently: any value means "enabled".
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Some(serde_json::from_value(value).unwrap_or_default()))
}

/// Tools capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Resources capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(default, skip_serializing_if = "is_false")]
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Prompts capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Roots capability (client side).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Server capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub experimental: ExperimentalCapabilities,
    #[serde(default, skip_serializing_if = "is_false", with = "marker")]
    pub logging: bool,
    #[serde(default, skip_serializing_if = "is_false", with = "marker")]
    pub completions: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub prompts: Option<PromptsCapability>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub resources: Option<ResourcesCapability>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    pub fn with_tools(mut self, list_changed: bool) -> Self {
        self.tools = Some(ToolsCapability { list_changed });
        self
    }

    pub fn with_resources(mut self, subscribe: bool, list_changed: bool) -> Self {
        self.resources = Some(ResourcesCapability {
            subscribe,
            list_changed,
        });
        self
    }

    pub fn with_prompts(mut self, list_changed: bool) -> Self {
        self.prompts = Some(PromptsCapability { list_changed });
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    pub fn with_experimental(mut self, name: impl Into<String>, config: Value) -> Self {
        self.experimental.insert(name.into(), config);
        self
    }
}

/// Client capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub experimental: ExperimentalCapabilities,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "is_false", with = "marker")]
    pub sampling: bool,
    #[serde(default, skip_serializing_if = "is_false", with = "marker")]
    pub elicitation: bool,
}

impl ClientCapabilities {
    pub fn with_roots(mut self, list_changed: bool) -> Self {
        self.roots = Some(RootsCapability { list_changed });
        self
    }

    pub fn with_sampling(mut self) -> Self {
        self.sampling = true;
        self
    }

    pub fn with_experimental(mut self, name: impl Into<String>, config: Value) -> Self {
        self.experimental.insert(name.into(), config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tools_without_sub_flags() {
        let caps = ServerCapabilities::default().with_tools(false);
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({"tools": {}}));
    }

    #[test]
    fn test_tools_list_changed() {
        let caps = ServerCapabilities::default().with_tools(true);
        assert_eq!(
            serde_json::to_value(&caps).unwrap(),
            json!({"tools": {"listChanged": true}})
        );
    }

    #[test]
    fn test_disabled_capabilities_are_omitted() {
        let json = serde_json::to_string(&ServerCapabilities::default()).unwrap();
        assert_eq!(json, "{}");

        let caps = ServerCapabilities::default().with_resources(true, false);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"{"resources":{"subscribe":true}}"#);
        assert!(!json.contains("false"));
    }

    #[test]
    fn test_marker_capabilities() {
        let caps = ServerCapabilities::default().with_logging();
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({"logging": {}}));

        let client = ClientCapabilities::default().with_sampling();
        assert_eq!(
            serde_json::to_value(&client).unwrap(),
            json!({"sampling": {}})
        );
    }

    #[test]
    fn test_presence_enables_capability() {
        let caps: ServerCapabilities = serde_json::from_value(json!({
            "logging": {"anything": 1},
            "prompts": true,
            "resources": {"subscribe": "yes"},
            "tools": {"listChanged": true}
        }))
        .unwrap();

        assert!(caps.logging);
        assert!(!caps.completions);
        assert_eq!(caps.prompts, Some(PromptsCapability::default()));
        assert_eq!(caps.resources, Some(ResourcesCapability::default()));
        assert_eq!(caps.tools, Some(ToolsCapability { list_changed: true }));
    }

    #[test]
    fn test_experimental_passes_through() {
        let block = json!({"mode": "fast", "limits": [1, 2, 3]});
        let caps = ClientCapabilities::default()
            .with_roots(true)
            .with_experimental("x-tracing", block.clone());

        let value = serde_json::to_value(&caps).unwrap();
        let back: ClientCapabilities = serde_json::from_value(value).unwrap();
        assert_eq!(back.experimental.get("x-tracing"), Some(&block));
        assert_eq!(back, caps);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let caps: ClientCapabilities =
            serde_json::from_value(json!({"futureThing": {}, "roots": {}})).unwrap();
        assert_eq!(caps.roots, Some(RootsCapability::default()));
        assert!(!caps.sampling);
    }
}
