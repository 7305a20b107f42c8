//! Contract validation for every payload that crosses a kernel boundary.
//!
//! Schemas are embedded at build time and compiled once per process. All
//! schemas close their objects (`additionalProperties: false`), so unknown
//! fields fail validation instead of being ignored.

use crate::internal::plan::intent::Intent;
use jsonschema::{error::ValidationErrorKind, JSONSchema};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, ops::Deref};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaId {
    Intent,
    Plan,
    Tool,
    TraceEvent,
    UnitManifest,
}

impl SchemaId {
    pub const ALL: [SchemaId; 5] = [
        SchemaId::Intent,
        SchemaId::Plan,
        SchemaId::Tool,
        SchemaId::TraceEvent,
        SchemaId::UnitManifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaId::Intent => "intent",
            SchemaId::Plan => "plan",
            SchemaId::Tool => "tool",
            SchemaId::TraceEvent => "trace_event",
            SchemaId::UnitManifest => "unit_manifest",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim_end_matches(".schema.json");
        Self::ALL.into_iter().find(|id| id.as_str() == name)
    }

    fn source(&self) -> &'static str {
        match self {
            SchemaId::Intent => include_str!("../../../contracts/schemas/intent.schema.json"),
            SchemaId::Plan => include_str!("../../../contracts/schemas/plan.schema.json"),
            SchemaId::Tool => include_str!("../../../contracts/schemas/tool.schema.json"),
            SchemaId::TraceEvent => {
                include_str!("../../../contracts/schemas/trace_event.schema.json")
            }
            SchemaId::UnitManifest => {
                include_str!("../../../contracts/schemas/unit_manifest.schema.json")
            }
        }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violation, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("{schema} contract violated: {}", summarize(.errors))]
    Contract {
        schema: SchemaId,
        errors: Vec<FieldError>,
    },
    #[error("{schema} payload does not fit the typed model: {message}")]
    Shape { schema: SchemaId, message: String },
    #[error("Contract schema unavailable: {0}")]
    SchemaUnavailable(String),
}

impl ValidationError {
    /// Machine-readable paths of the offending fields.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            ValidationError::Contract { errors, .. } => {
                errors.iter().map(|e| e.path.as_str()).collect()
            }
            ValidationError::Shape { .. } | ValidationError::SchemaUnavailable(_) => vec!["/"],
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ValidationError::Contract { schema, errors } => serde_json::json!({
                "kind": "validation",
                "schema": schema,
                "errors": errors,
            }),
            other => serde_json::json!({
                "kind": "validation",
                "errors": [{ "path": "/", "message": other.to_string() }],
            }),
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A payload that has passed its contract and been decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    inner: T,
}

pub type ValidatedIntent = Validated<Intent>;

impl<T> Validated<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Deref for Validated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

pub struct ContractValidator {
    schemas: HashMap<SchemaId, JSONSchema>,
}

static CONTRACTS: Lazy<Result<ContractValidator, String>> = Lazy::new(ContractValidator::load);

impl ContractValidator {
    fn load() -> Result<Self, String> {
        let mut schemas = HashMap::new();
        for id in SchemaId::ALL {
            let document: Value = serde_json::from_str(id.source())
                .map_err(|e| format!("{}: invalid JSON: {}", id, e))?;
            let compiled = JSONSchema::compile(&document)
                .map_err(|e| format!("{}: schema does not compile: {}", id, e))?;
            schemas.insert(id, compiled);
        }
        Ok(Self { schemas })
    }

    pub fn global() -> Result<&'static ContractValidator, ValidationError> {
        CONTRACTS
            .as_ref()
            .map_err(|e| ValidationError::SchemaUnavailable(e.clone()))
    }

    pub fn check(&self, payload: &Value, schema: SchemaId) -> Result<(), ValidationError> {
        let compiled = self
            .schemas
            .get(&schema)
            .ok_or_else(|| ValidationError::SchemaUnavailable(schema.to_string()))?;

        if let Err(errors) = compiled.validate(payload) {
            let mut errors: Vec<FieldError> = errors.map(|e| field_error(&e)).collect();
            errors.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.message.cmp(&b.message)));
            errors.dedup();
            return Err(ValidationError::Contract { schema, errors });
        }
        Ok(())
    }
}

fn field_error(error: &jsonschema::ValidationError<'_>) -> FieldError {
    let mut path = error.instance_path.to_string();
    // Point at the missing or unexpected field itself, not its parent object.
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            if let Some(name) = property.as_str() {
                path = format!("{}/{}", path, name);
            }
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => {
            if let Some(name) = unexpected.first() {
                path = format!("{}/{}", path, name);
            }
        }
        _ => {}
    }
    if path.is_empty() {
        path.push('/');
    }
    FieldError {
        path,
        message: error.to_string(),
    }
}

/// Validates `payload` against `schema`. Pure; no side effects.
pub fn validate(payload: &Value, schema: SchemaId) -> Result<(), ValidationError> {
    ContractValidator::global()?.check(payload, schema)
}

/// Validates and decodes `payload` into its typed model.
pub fn validate_as<T: DeserializeOwned>(
    payload: &Value,
    schema: SchemaId,
) -> Result<Validated<T>, ValidationError> {
    validate(payload, schema)?;
    let inner = T::deserialize(payload).map_err(|e| ValidationError::Shape {
        schema,
        message: e.to_string(),
    })?;
    Ok(Validated { inner })
}

pub fn validate_intent(payload: &Value) -> Result<ValidatedIntent, ValidationError> {
    validate_as(payload, SchemaId::Intent)
}

/// Compiles every embedded schema; returns the ids that failed.
pub fn check_contracts() -> Vec<(SchemaId, String)> {
    match CONTRACTS.as_ref() {
        Ok(validator) => SchemaId::ALL
            .into_iter()
            .filter(|id| !validator.schemas.contains_key(id))
            .map(|id| (id, "missing".to_string()))
            .collect(),
        Err(e) => vec![(SchemaId::Intent, e.clone())],
    }
}
