use crate::internal::{
    contract::validate::{validate, SchemaId, ValidationError},
    tools::spec::{Tool, ToolDescriptor, ToolError, ToolOutput},
};
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tokio::time::timeout;

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    inputs: JSONSchema,
    outputs: JSONSchema,
}

/// Single owner of tool identity. Read-only once shared behind an `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolRegistryError> {
        let descriptor = tool.descriptor().clone();
        let payload = serde_json::to_value(&descriptor)
            .map_err(|e| ToolRegistryError::Schema {
                tool_id: descriptor.id.clone(),
                message: e.to_string(),
            })?;
        validate(&payload, SchemaId::Tool)?;

        if self.tools.contains_key(&descriptor.id) {
            return Err(ToolRegistryError::Duplicate(descriptor.id));
        }

        let inputs = compile_schema(&descriptor.id, &descriptor.declared_inputs)?;
        let outputs = compile_schema(&descriptor.id, &descriptor.declared_outputs)?;

        tracing::debug!(tool_id = %descriptor.id, destructive = descriptor.destructive, "tool registered");
        self.tools.insert(
            descriptor.id,
            RegisteredTool {
                tool,
                inputs,
                outputs,
            },
        );
        Ok(())
    }

    pub fn register_tool<T: Tool + 'static>(&mut self, tool: T) -> Result<(), ToolRegistryError> {
        self.register(Arc::new(tool))
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_id).map(|t| t.tool.descriptor())
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    /// Descriptors sorted by id.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| t.tool.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn compile_schema(tool_id: &str, schema: &Value) -> Result<JSONSchema, ToolRegistryError> {
    JSONSchema::compile(schema).map_err(|e| ToolRegistryError::Schema {
        tool_id: tool_id.to_string(),
        message: e.to_string(),
    })
}

fn schema_errors(schema: &JSONSchema, instance: &Value) -> Option<String> {
    match schema.validate(instance) {
        Ok(()) => None,
        Err(errors) => Some(
            errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

/// Performs bounded invocations against a shared registry.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invokes `tool_id`. Callers must hold an allow decision for the step.
    pub async fn invoke(
        &self,
        tool_id: &str,
        inputs: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<ToolOutput, ToolError> {
        let entry = self
            .registry
            .tools
            .get(tool_id)
            .ok_or_else(|| ToolError::UnknownTool(tool_id.to_string()))?;
        let descriptor = entry.tool.descriptor();

        if dry_run && !descriptor.supports_dry_run {
            return Err(ToolError::DryRunUnsupported(tool_id.to_string()));
        }

        let inputs = Value::Object(inputs.clone());
        if let Some(message) = schema_errors(&entry.inputs, &inputs) {
            return Err(ToolError::InvalidInputs {
                tool_id: tool_id.to_string(),
                message,
            });
        }

        let value = timeout(self.timeout, entry.tool.invoke(inputs, dry_run))
            .await
            .map_err(|_| ToolError::Timeout {
                tool_id: tool_id.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        if let Some(message) = schema_errors(&entry.outputs, &value) {
            return Err(ToolError::InvalidOutput {
                tool_id: tool_id.to_string(),
                message,
            });
        }

        Ok(ToolOutput {
            tool_id: tool_id.to_string(),
            dry_run,
            value,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolRegistryError {
    #[error("Invalid tool descriptor: {0}")]
    Validation(#[from] ValidationError),
    #[error("Duplicate tool id: {0}")]
    Duplicate(String),
    #[error("Tool {tool_id} declares an invalid schema: {message}")]
    Schema { tool_id: String, message: String },
}
