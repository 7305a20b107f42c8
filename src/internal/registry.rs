//! Processing-unit registry: maps `intent_id`s to the units that turn an
//! Intent into plan content.

use crate::internal::{
    contract::validate::{validate, validate_as, SchemaId, ValidationError},
    plan::{intent::Intent, ir::PlanDraft},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

const DEFAULT_PLAN_FILE: &str = "plan.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub unit_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plan template path, relative to the manifest. Static units only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub intents: Vec<IntentDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDeclaration {
    pub intent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl UnitManifest {
    pub fn declares(&self, intent_id: &str) -> bool {
        self.intents.iter().any(|i| i.intent_id == intent_id)
    }
}

/// Supplies domain plan content for the intents its manifest declares.
///
/// `plan` must be deterministic for a given intent and manifest version.
pub trait ProcessingUnit: Send + Sync {
    fn manifest(&self) -> &UnitManifest;

    fn plan(&self, intent: &Intent) -> Result<PlanDraft, UnitError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unit {unit_id} failed to plan: {message}")]
pub struct UnitError {
    pub unit_id: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid unit manifest: {0}")]
    Validation(#[from] ValidationError),
    #[error("Duplicate unit id: {0}")]
    Duplicate(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentRoute {
    pub intent_id: String,
    pub unit_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Default, Clone)]
pub struct UnitRegistry {
    units: BTreeMap<String, Arc<dyn ProcessingUnit>>,
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: Arc<dyn ProcessingUnit>) -> Result<(), RegistryError> {
        let manifest = unit.manifest();
        let payload = serde_json::to_value(manifest).map_err(|source| RegistryError::Json {
            path: PathBuf::from(&manifest.unit_id),
            source,
        })?;
        validate(&payload, SchemaId::UnitManifest)?;

        if self.units.contains_key(&manifest.unit_id) {
            return Err(RegistryError::Duplicate(manifest.unit_id.clone()));
        }
        tracing::debug!(unit_id = %manifest.unit_id, version = %manifest.version, "processing unit registered");
        self.units.insert(manifest.unit_id.clone(), unit);
        Ok(())
    }

    /// Loads every `<dir>/<unit>/manifest.json` as a static unit, in name order.
    pub fn load_from_dir(dir: &Path) -> Result<Self, RegistryError> {
        let entries = fs::read_dir(dir).map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut unit_dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join("manifest.json").is_file())
            .collect();
        unit_dirs.sort();

        let mut registry = Self::new();
        for unit_dir in unit_dirs {
            registry.register(Arc::new(StaticUnit::load(&unit_dir)?))?;
        }
        tracing::info!(dir = %dir.display(), units = registry.len(), "processing units loaded");
        Ok(registry)
    }

    /// Every unit whose manifest declares `intent_id`.
    pub fn resolve(&self, intent_id: &str) -> Vec<Arc<dyn ProcessingUnit>> {
        self.units
            .values()
            .filter(|unit| unit.manifest().declares(intent_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, unit_id: &str) -> Option<&Arc<dyn ProcessingUnit>> {
        self.units.get(unit_id)
    }

    pub fn manifests(&self) -> Vec<UnitManifest> {
        self.units.values().map(|u| u.manifest().clone()).collect()
    }

    pub fn list_intents(&self) -> Vec<IntentRoute> {
        let mut routes: Vec<IntentRoute> = self
            .units
            .values()
            .flat_map(|unit| {
                let manifest = unit.manifest();
                manifest.intents.iter().map(move |declared| IntentRoute {
                    intent_id: declared.intent_id.clone(),
                    unit_id: manifest.unit_id.clone(),
                    summary: declared.summary.clone(),
                })
            })
            .collect();
        routes.sort_by(|a, b| {
            a.intent_id
                .cmp(&b.intent_id)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        routes
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(intent_id|params\.[A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex")
});

/// A unit backed by a manifest and a JSON plan template on disk.
///
/// String values in the template may reference `${intent_id}` and
/// `${params.<key>}`. A string that is exactly one placeholder takes the
/// parameter's JSON value; otherwise the value is spliced in as text.
#[derive(Debug, Clone)]
pub struct StaticUnit {
    manifest: UnitManifest,
    template: Value,
}

impl StaticUnit {
    pub fn new(manifest: UnitManifest, template: Value) -> Self {
        Self { manifest, template }
    }

    pub fn load(dir: &Path) -> Result<Self, RegistryError> {
        let manifest_path = dir.join("manifest.json");
        let raw = read_json(&manifest_path)?;
        let manifest = validate_as::<UnitManifest>(&raw, SchemaId::UnitManifest)?.into_inner();

        let plan_path = dir.join(manifest.plan.as_deref().unwrap_or(DEFAULT_PLAN_FILE));
        let template = read_json(&plan_path)?;
        Ok(Self::new(manifest, template))
    }

    fn error(&self, message: impl Into<String>) -> UnitError {
        UnitError {
            unit_id: self.manifest.unit_id.clone(),
            message: message.into(),
        }
    }

    fn substitute(&self, value: &Value, intent: &Intent) -> Result<Value, UnitError> {
        match value {
            Value::String(text) => self.substitute_str(text, intent),
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(item, intent))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.substitute(item, intent)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn substitute_str(&self, text: &str, intent: &Intent) -> Result<Value, UnitError> {
        let lookup = |name: &str| -> Result<Value, UnitError> {
            if name == "intent_id" {
                return Ok(Value::String(intent.intent_id.clone()));
            }
            let key = name.trim_start_matches("params.");
            intent
                .params
                .get(key)
                .cloned()
                .ok_or_else(|| self.error(format!("missing parameter '{}'", key)))
        };

        if let Some(whole) = PLACEHOLDER.captures(text) {
            if whole.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                return lookup(&whole[1]);
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(found) = caps.get(0) else { continue };
            out.push_str(&text[last..found.start()]);
            match lookup(&caps[1])? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            }
            last = found.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }
}

impl ProcessingUnit for StaticUnit {
    fn manifest(&self) -> &UnitManifest {
        &self.manifest
    }

    fn plan(&self, intent: &Intent) -> Result<PlanDraft, UnitError> {
        let rendered = self.substitute(&self.template, intent)?;
        serde_json::from_value(rendered).map_err(|e| self.error(e.to_string()))
    }
}

fn read_json(path: &Path) -> Result<Value, RegistryError> {
    let contents = fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::plan::intent::Scope;
    use serde_json::json;

    fn manifest(unit_id: &str, intents: &[&str]) -> UnitManifest {
        UnitManifest {
            unit_id: unit_id.into(),
            version: "1".into(),
            description: None,
            plan: None,
            intents: intents
                .iter()
                .map(|id| IntentDeclaration { intent_id: id.to_string(), summary: None })
                .collect(),
        }
    }

    fn template() -> Value {
        json!({
            "summary": "List ${params.path} for ${intent_id}",
            "steps": [{
                "step_id": "s1",
                "phase": "staging",
                "tool": "fs.list",
                "inputs": { "path": "${params.path}", "limit": "${params.limit}" }
            }]
        })
    }

    #[test]
    fn whole_placeholders_keep_json_type() {
        let unit = StaticUnit::new(manifest("fs", &["fs.preview"]), template());
        let intent = Intent::new("fs.preview", Scope::fs(["/tmp/a"]))
            .with_param("path", json!("/tmp/a"))
            .with_param("limit", json!(10));
        let draft = unit.plan(&intent).unwrap();
        assert_eq!(draft.summary.as_deref(), Some("List /tmp/a for fs.preview"));
        assert_eq!(draft.steps[0].inputs["limit"], json!(10));
    }

    #[test]
    fn missing_parameter_is_a_unit_error() {
        let unit = StaticUnit::new(manifest("fs", &["fs.preview"]), template());
        let intent = Intent::new("fs.preview", Scope::fs(["/tmp/a"]));
        let err = unit.plan(&intent).unwrap_err();
        assert!(err.message.contains("path"));
    }

    #[test]
    fn duplicate_unit_ids_are_rejected_but_shared_intents_are_kept() {
        let mut registry = UnitRegistry::new();
        registry
            .register(Arc::new(StaticUnit::new(manifest("a", &["x.preview"]), template())))
            .unwrap();
        assert!(matches!(
            registry.register(Arc::new(StaticUnit::new(manifest("a", &["y"]), template()))),
            Err(RegistryError::Duplicate(_))
        ));
        registry
            .register(Arc::new(StaticUnit::new(manifest("b", &["x.preview"]), template())))
            .unwrap();
        assert_eq!(registry.resolve("x.preview").len(), 2);
        assert_eq!(registry.list_intents().len(), 2);
    }

    #[test]
    fn manifest_without_intents_fails_contract() {
        let mut registry = UnitRegistry::new();
        let err = registry
            .register(Arc::new(StaticUnit::new(manifest("a", &[]), template())))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }
}
