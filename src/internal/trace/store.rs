//! Append-only trace storage and the per-run appenders that write to it.

use crate::internal::trace::trace::{TraceError, TraceEvent, TraceKind, TraceSigner};
use chrono::Utc;
use serde_json::{Map, Value};
use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Shared audit log. Writers only ever append; readers read from an offset.
pub trait TraceStore: Send + Sync {
    fn append(&self, event: &TraceEvent) -> Result<(), TraceError>;

    /// Events of `run_id` with `seq >= offset`, in append order.
    fn read_from(&self, run_id: &str, offset: u64) -> Result<Vec<TraceEvent>, TraceError>;
}

/// One JSON object per line.
#[derive(Debug)]
pub struct JsonlTraceStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTraceStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TraceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceStore for JsonlTraceStore {
    fn append(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().map_err(|_| TraceError::Poisoned)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn read_from(&self, run_id: &str, offset: u64) -> Result<Vec<TraceEvent>, TraceError> {
        let contents = fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent =
                serde_json::from_str(line).map_err(|e| TraceError::InvalidEvent {
                    line: index + 1,
                    message: e.to_string(),
                })?;
            if event.run_id == run_id && event.seq >= offset {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl TraceStore for MemoryTraceStore {
    fn append(&self, event: &TraceEvent) -> Result<(), TraceError> {
        self.events
            .lock()
            .map_err(|_| TraceError::Poisoned)?
            .push(event.clone());
        Ok(())
    }

    fn read_from(&self, run_id: &str, offset: u64) -> Result<Vec<TraceEvent>, TraceError> {
        Ok(self
            .events
            .lock()
            .map_err(|_| TraceError::Poisoned)?
            .iter()
            .filter(|e| e.run_id == run_id && e.seq >= offset)
            .cloned()
            .collect())
    }
}

/// Hands out one appender per run id. An id is refused while its appender
/// is open and once the store holds events for it.
#[derive(Clone)]
pub struct TraceEmitter {
    store: Arc<dyn TraceStore>,
    signer: Option<Arc<TraceSigner>>,
    open_runs: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for TraceEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEmitter")
            .field("signed", &self.signer.is_some())
            .finish()
    }
}

impl TraceEmitter {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self {
            store,
            signer: None,
            open_runs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_signer(mut self, signer: Arc<TraceSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    pub fn signer(&self) -> Option<&Arc<TraceSigner>> {
        self.signer.as_ref()
    }

    pub fn open(&self, run_id: &str) -> Result<RunTrace, TraceError> {
        let mut open = self.open_runs.lock().map_err(|_| TraceError::Poisoned)?;
        if open.contains(run_id) {
            return Err(TraceError::RunAlreadyOpen(run_id.to_string()));
        }
        // A finished run keeps its id; new events would restart at seq 0.
        if !self.store.read_from(run_id, 0)?.is_empty() {
            return Err(TraceError::RunIdTaken(run_id.to_string()));
        }
        open.insert(run_id.to_string());
        Ok(RunTrace {
            run_id: run_id.to_string(),
            next_seq: 0,
            store: self.store.clone(),
            signer: self.signer.clone(),
            open_runs: self.open_runs.clone(),
        })
    }

    pub fn read(&self, run_id: &str, offset: u64) -> Result<Vec<TraceEvent>, TraceError> {
        self.store.read_from(run_id, offset)
    }
}

/// Single writer for one run. Owns the run's sequence counter.
pub struct RunTrace {
    run_id: String,
    next_seq: u64,
    store: Arc<dyn TraceStore>,
    signer: Option<Arc<TraceSigner>>,
    open_runs: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for RunTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTrace")
            .field("run_id", &self.run_id)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl RunTrace {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Appends the next event. The sequence number only advances on success.
    pub fn emit(&mut self, kind: TraceKind, payload: Value) -> Result<TraceEvent, TraceError> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let mut event = TraceEvent {
            run_id: self.run_id.clone(),
            seq: self.next_seq,
            ts: Utc::now(),
            kind,
            payload,
            signature: None,
        };
        if let Some(signer) = &self.signer {
            signer.sign_event(&mut event);
        }
        self.store.append(&event)?;
        self.next_seq += 1;
        Ok(event)
    }
}

impl Drop for RunTrace {
    fn drop(&mut self) {
        if let Ok(mut open) = self.open_runs.lock() {
            open.remove(&self.run_id);
        }
    }
}
