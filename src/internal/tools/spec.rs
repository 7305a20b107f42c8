use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only contract the kernel relies on for a tool. Implementations are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// JSON Schema for the invocation inputs.
    pub declared_inputs: Value,
    /// JSON Schema for the invocation output.
    pub declared_outputs: Value,
    pub destructive: bool,
    pub supports_dry_run: bool,
    #[serde(default)]
    pub side_effects: SideEffects,
    /// Input fields whose values are resources the scope guard must check.
    #[serde(default)]
    pub resource_inputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffects {
    #[default]
    None,
    Filesystem,
    Network,
    Notification,
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            declared_inputs: serde_json::json!({ "type": "object" }),
            declared_outputs: serde_json::json!({ "type": "object" }),
            destructive: false,
            supports_dry_run: true,
            side_effects: SideEffects::None,
            resource_inputs: Vec::new(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn inputs(mut self, schema: Value) -> Self {
        self.declared_inputs = schema;
        self
    }

    pub fn outputs(mut self, schema: Value) -> Self {
        self.declared_outputs = schema;
        self
    }

    pub fn destructive(mut self, destructive: bool) -> Self {
        self.destructive = destructive;
        self
    }

    pub fn dry_run(mut self, supported: bool) -> Self {
        self.supports_dry_run = supported;
        self
    }

    pub fn side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = side_effects;
        self
    }

    pub fn resource_inputs(mut self, fields: &[&str]) -> Self {
        self.resource_inputs = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// A registered deterministic capability.
///
/// With `dry_run = true` an implementation must not produce any observable
/// external effect. Failures are returned, never panicked.
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_id: String,
    pub dry_run: bool,
    pub value: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool {0} does not support dry-run")]
    DryRunUnsupported(String),
    #[error("Invalid inputs for {tool_id}: {message}")]
    InvalidInputs { tool_id: String, message: String },
    #[error("Invalid output from {tool_id}: {message}")]
    InvalidOutput { tool_id: String, message: String },
    #[error("Invocation error: {0}")]
    Invocation(String),
    #[error("Tool {tool_id} timed out after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },
    #[error("Communication error: {0}")]
    Communication(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "tool.unknown",
            ToolError::DryRunUnsupported(_) => "tool.dry_run_unsupported",
            ToolError::InvalidInputs { .. } => "tool.inputs_invalid",
            ToolError::InvalidOutput { .. } => "tool.output_invalid",
            ToolError::Invocation(_) => "tool.error",
            ToolError::Timeout { .. } => "tool.timeout",
            ToolError::Communication(_) => "tool.communication",
        }
    }
}
