use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scope-declaring description of desired work.
///
/// `intent_id` is a correlation key: retries and replays may reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub params: Map<String, Value>,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub flags: IntentFlags,
}

/// Explicit allow flags. Everything defaults to the safe side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFlags {
    #[serde(default)]
    pub allow_destructive: bool,
    #[serde(default)]
    pub allow_noop: bool,
}

/// Resource allowlist shared by intents, plans and steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub fs_roots: Vec<String>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub network_hosts: Vec<String>,
}

impl Scope {
    pub fn fs(roots: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fs_roots: roots.into_iter().map(Into::into).collect(),
            allow_network: false,
            network_hosts: Vec::new(),
        }
    }

    pub fn with_network(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow_network = true;
        self.network_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }
}

impl Intent {
    pub fn new(intent_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            intent_id: intent_id.into(),
            params: Map::new(),
            scope,
            context: None,
            flags: IntentFlags::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn allow_destructive(mut self) -> Self {
        self.flags.allow_destructive = true;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
