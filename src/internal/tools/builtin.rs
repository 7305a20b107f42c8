//! Built-in deterministic tools.
//!
//! Every tool here supports dry-run; a dry run reports the effects it would
//! have under `expected_effects` and touches nothing.

use crate::internal::{
    policy::scope::resolve_path,
    tools::{
        registry::{ToolRegistry, ToolRegistryError},
        spec::{SideEffects, Tool, ToolDescriptor, ToolError},
    },
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::{collections::HashMap, path::Path, time::Duration};

const MAX_HTTP_BODY: usize = 64 * 1024;

pub fn builtin_registry() -> Result<ToolRegistry, ToolRegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register_tool(FsList::new())?;
    registry.register_tool(FsStat::new())?;
    registry.register_tool(FsMkdir::new())?;
    registry.register_tool(FsMove::new())?;
    registry.register_tool(NotifySend::new())?;
    registry.register_tool(NetHttp::new())?;
    Ok(registry)
}

fn object_schema(schema_props: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": schema_props,
        "required": required,
    })
}

fn required_str<'a>(tool_id: &str, inputs: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidInputs {
            tool_id: tool_id.to_string(),
            message: format!("'{}' must be a non-empty string", key),
        })
}

fn show(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn io_error(tool_id: &str, e: std::io::Error) -> ToolError {
    ToolError::Invocation(format!("{}: {}", tool_id, e))
}

pub struct FsList {
    descriptor: ToolDescriptor,
}

impl FsList {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("fs.list")
                .titled("List directory entries")
                .inputs(object_schema(json!({ "path": { "type": "string" } }), &["path"]))
                .side_effects(SideEffects::None)
                .resource_inputs(&["path"]),
        }
    }
}

impl Tool for FsList {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let path = resolve_path(required_str("fs.list", &inputs, "path")?);
            if !tokio::fs::try_exists(&path).await.map_err(|e| io_error("fs.list", e))? {
                return Ok(json!({ "path": show(&path), "entries": [], "exists": false, "dry_run": dry_run }));
            }
            let mut reader = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| io_error("fs.list", e))?;
            let mut entries = Vec::new();
            while let Some(entry) = reader.next_entry().await.map_err(|e| io_error("fs.list", e))? {
                entries.push(entry.file_name().to_string_lossy().into_owned());
            }
            entries.sort();
            Ok(json!({ "path": show(&path), "entries": entries, "exists": true, "dry_run": dry_run }))
        })
    }
}

pub struct FsStat {
    descriptor: ToolDescriptor,
}

impl FsStat {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("fs.stat")
                .titled("Stat a path")
                .inputs(object_schema(json!({ "path": { "type": "string" } }), &["path"]))
                .side_effects(SideEffects::None)
                .resource_inputs(&["path"]),
        }
    }
}

impl Tool for FsStat {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let path = resolve_path(required_str("fs.stat", &inputs, "path")?);
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| io_error("fs.stat", e))?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Ok(json!({
                "path": show(&path),
                "is_dir": metadata.is_dir(),
                "is_file": metadata.is_file(),
                "size": metadata.len(),
                "mtime": mtime,
                "dry_run": dry_run,
            }))
        })
    }
}

pub struct FsMkdir {
    descriptor: ToolDescriptor,
}

impl FsMkdir {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("fs.mkdir")
                .titled("Create a directory")
                .inputs(object_schema(
                    json!({
                        "path": { "type": "string" },
                        "parents": { "type": "boolean" },
                        "exist_ok": { "type": "boolean" }
                    }),
                    &["path"],
                ))
                .side_effects(SideEffects::Filesystem)
                .resource_inputs(&["path"]),
        }
    }
}

impl Tool for FsMkdir {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let path = resolve_path(required_str("fs.mkdir", &inputs, "path")?);
            let parents = inputs.get("parents").and_then(Value::as_bool).unwrap_or(true);
            let exist_ok = inputs.get("exist_ok").and_then(Value::as_bool).unwrap_or(true);
            let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);

            if dry_run {
                return Ok(json!({
                    "path": show(&path),
                    "would_create": !existed,
                    "dry_run": true,
                    "expected_effects": [{
                        "kind": "fs_mkdir",
                        "summary": format!("Create directory {}", path.display()),
                        "resources": [show(&path)],
                    }],
                }));
            }

            if existed {
                if !exist_ok {
                    return Err(ToolError::Invocation(format!(
                        "fs.mkdir: {} already exists",
                        path.display()
                    )));
                }
            } else if parents {
                tokio::fs::create_dir_all(&path).await.map_err(|e| io_error("fs.mkdir", e))?;
            } else {
                tokio::fs::create_dir(&path).await.map_err(|e| io_error("fs.mkdir", e))?;
            }
            Ok(json!({ "path": show(&path), "created": !existed, "dry_run": false }))
        })
    }
}

pub struct FsMove {
    descriptor: ToolDescriptor,
}

impl FsMove {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("fs.move")
                .titled("Move or rename a path")
                .inputs(object_schema(
                    json!({
                        "from": { "type": "string" },
                        "to": { "type": "string" },
                        "overwrite": { "type": "boolean" }
                    }),
                    &["from", "to"],
                ))
                .side_effects(SideEffects::Filesystem)
                .resource_inputs(&["from", "to"]),
        }
    }
}

impl Tool for FsMove {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let from = resolve_path(required_str("fs.move", &inputs, "from")?);
            let to = resolve_path(required_str("fs.move", &inputs, "to")?);
            let overwrite = inputs.get("overwrite").and_then(Value::as_bool).unwrap_or(false);

            if !overwrite && tokio::fs::try_exists(&to).await.unwrap_or(false) {
                return Err(ToolError::Invocation(format!(
                    "fs.move: destination exists (overwrite=false): {}",
                    to.display()
                )));
            }

            // A dry run may preview a move whose source a preceding commit creates.
            if dry_run {
                return Ok(json!({
                    "from": show(&from),
                    "to": show(&to),
                    "dry_run": true,
                    "expected_effects": [{
                        "kind": "fs_move",
                        "summary": format!("Move {} -> {}", from.display(), to.display()),
                        "resources": [show(&from), show(&to)],
                    }],
                }));
            }

            if !tokio::fs::try_exists(&from).await.map_err(|e| io_error("fs.move", e))? {
                return Err(ToolError::Invocation(format!(
                    "fs.move: source not found: {}",
                    from.display()
                )));
            }
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| io_error("fs.move", e))?;
            }
            tokio::fs::rename(&from, &to).await.map_err(|e| io_error("fs.move", e))?;
            Ok(json!({ "from": show(&from), "to": show(&to), "dry_run": false }))
        })
    }
}

pub struct NotifySend {
    descriptor: ToolDescriptor,
}

impl NotifySend {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("notify.send")
                .titled("Send a notification")
                .inputs(object_schema(json!({ "message": { "type": "string" } }), &["message"]))
                .side_effects(SideEffects::Notification),
        }
    }
}

impl Tool for NotifySend {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let message = required_str("notify.send", &inputs, "message")?;
            if !dry_run {
                tracing::info!(target: "nucleus::notify", "{}", message);
            }
            Ok(json!({ "message": message, "delivered": !dry_run, "dry_run": dry_run }))
        })
    }
}

pub struct NetHttp {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
}

impl NetHttp {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("net.http")
                .titled("HTTP request")
                .inputs(object_schema(
                    json!({
                        "method": { "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"] },
                        "url": { "type": "string", "minLength": 1 },
                        "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                        "json": {},
                        "body": { "type": "string" },
                        "timeout_s": { "type": "number", "exclusiveMinimum": 0 }
                    }),
                    &["url"],
                ))
                .side_effects(SideEffects::Network)
                .resource_inputs(&["url"]),
            client: reqwest::Client::new(),
        }
    }
}

impl Tool for NetHttp {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let url = required_str("net.http", &inputs, "url")?;
            let method = inputs.get("method").and_then(Value::as_str).unwrap_or("POST");

            if dry_run {
                return Ok(json!({
                    "dry_run": true,
                    "expected_effects": [{
                        "kind": "net_http",
                        "summary": format!("HTTP {} {}", method, url),
                        "resources": [url],
                    }],
                }));
            }

            let method = reqwest::Method::from_bytes(method.as_bytes())
                .map_err(|e| ToolError::Invocation(format!("net.http: {}", e)))?;
            let timeout_s = inputs.get("timeout_s").and_then(Value::as_f64).unwrap_or(10.0);
            let mut request = self
                .client
                .request(method, url)
                .timeout(Duration::from_secs_f64(timeout_s));

            if let Some(headers) = inputs.get("headers").and_then(Value::as_object) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        request = request.header(name.as_str(), value);
                    }
                }
            }
            if let Some(body) = inputs.get("json").filter(|v| !v.is_null()) {
                request = request.json(body);
            } else if let Some(body) = inputs.get("body").and_then(Value::as_str) {
                request = request.body(body.to_string());
            }

            let response = request
                .send()
                .await
                .map_err(|e| ToolError::Communication(e.to_string()))?;
            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let raw = response
                .bytes()
                .await
                .map_err(|e| ToolError::Communication(e.to_string()))?;
            let truncated = raw.len() > MAX_HTTP_BODY;
            let body_text = String::from_utf8_lossy(&raw[..raw.len().min(MAX_HTTP_BODY)]).into_owned();

            Ok(json!({
                "dry_run": false,
                "status": status,
                "headers": headers,
                "body_text": body_text,
                "truncated": truncated,
            }))
        })
    }
}
