use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    IntentReceived,
    PlanGenerated,
    PolicyDecision,
    StepStarted,
    StepFinished,
    StepDenied,
    RunFinished,
    Error,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::IntentReceived => "intent_received",
            TraceKind::PlanGenerated => "plan_generated",
            TraceKind::PolicyDecision => "policy_decision",
            TraceKind::StepStarted => "step_started",
            TraceKind::StepFinished => "step_finished",
            TraceKind::StepDenied => "step_denied",
            TraceKind::RunFinished => "run_finished",
            TraceKind::Error => "error",
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only fact about a run. `seq` is assigned by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: TraceKind,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl TraceEvent {
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn step_id(&self) -> Option<&str> {
        self.payload_str("step_id")
    }

    fn signing_message(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.run_id,
            self.seq,
            self.ts.to_rfc3339(),
            self.kind,
            Value::Object(self.payload.clone())
        )
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        let signature: Signature = keypair.sign(self.signing_message().as_bytes());
        self.signature = Some(Base64Engine.encode(signature.to_bytes()));
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> Result<bool, TraceError> {
        let Some(ref sig_str) = self.signature else {
            return Err(TraceError::Signature(format!(
                "event {} of run {} is unsigned",
                self.seq, self.run_id
            )));
        };

        let signature_bytes = Base64Engine
            .decode(sig_str)
            .map_err(|e| TraceError::Signature(e.to_string()))?;
        if signature_bytes.len() != 64 {
            return Err(TraceError::Signature("Invalid signature length".to_string()));
        }
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| TraceError::Signature(e.to_string()))?;

        Ok(public_key
            .verify(self.signing_message().as_bytes(), &signature)
            .is_ok())
    }
}

/// Signs every event a run emits with one ed25519 key.
pub struct TraceSigner {
    keypair: Keypair,
}

impl fmt::Debug for TraceSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSigner")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl TraceSigner {
    pub fn new() -> Self {
        let mut rng = OsRng::default();
        Self {
            keypair: Keypair::generate(&mut rng),
        }
    }

    pub fn sign_event(&self, event: &mut TraceEvent) {
        event.sign(&self.keypair);
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn public_key_base64(&self) -> String {
        Base64Engine.encode(self.keypair.public.as_bytes())
    }
}

impl Default for TraceSigner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_public_key(encoded: &str) -> Result<PublicKey, TraceError> {
    let bytes = Base64Engine
        .decode(encoded.trim())
        .map_err(|e| TraceError::Signature(e.to_string()))?;
    PublicKey::from_bytes(&bytes).map_err(|e| TraceError::Signature(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Signature error: {0}")]
    Signature(String),
    #[error("Trace write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Trace encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Run {0} already has an open trace")]
    RunAlreadyOpen(String),
    #[error("Run {0} already has recorded events")]
    RunIdTaken(String),
    #[error("Trace line {line} is not a valid event: {message}")]
    InvalidEvent { line: usize, message: String },
    #[error("Trace store lock poisoned")]
    Poisoned,
}
