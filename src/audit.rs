//! Audit logging: every object lifecycle change and processing step emits a
//! structured event.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::Handle;

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditAction {
    ObjectCreated,
    ObjectDestroyed,
    FindInitiated { match_count: usize },
    FindCursorExhausted,
    PolicyRejected { reason: String },
    CipherInitiated,
    CipherFinalized,
    AeInitiated,
    AeFinalized,
    MacInitiated,
    MacFinalized,
    KeyGenerated,
    KeyImported,
    ContractViolation { detail: String },
}

/// A structured audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Which object handle was involved, if any.
    pub handle: Option<Handle>,
    /// Which session triggered this, if any.
    pub session_id: Option<u64>,
    /// What happened.
    pub action: AuditAction,
    /// Who or what triggered this.
    pub actor: String,
    /// Success or failure.
    pub success: bool,
    /// Additional context.
    pub detail: Option<String>,
    /// Monotonic sequence number (populated by integrity chain sink).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// SHA-256 hash of the previous event's JSON (populated by integrity chain sink).
    /// First event in chain has prev_hash = SHA-256("citadel-audit-genesis").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event tied to a specific object handle.
    pub fn object_event(handle: Handle, action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            handle: Some(handle),
            session_id: None,
            action,
            actor: "system".into(),
            success: true,
            detail: None,
            sequence: None,
            prev_hash: None,
        }
    }

    /// Create a session-scoped event with no specific object handle (find
    /// cursor state, policy rejections, cryptographic operation lifecycle).
    pub fn session_event(session_id: u64, action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            handle: None,
            session_id: Some(session_id),
            action,
            actor: "system".into(),
            success: true,
            detail: None,
            sequence: None,
            prev_hash: None,
        }
    }

    /// Create a system-level audit event (no session, no object).
    pub fn system_event(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            handle: None,
            session_id: None,
            action,
            actor: "system".into(),
            success: true,
            detail: None,
            sequence: None,
            prev_hash: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Where audit events go. Implement this for your SIEM/log system.
pub trait AuditSinkSync: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Logs events via the `tracing` crate.
pub struct TracingAuditSink;

impl AuditSinkSync for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            timestamp = %event.timestamp,
            handle = ?event.handle,
            session_id = ?event.session_id,
            action = ?event.action,
            actor = %event.actor,
            success = event.success,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Collects events in memory (for testing and the API layer). The engine is
/// single-threaded per session with no suspension points, so a plain
/// synchronous mutex is enough here.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for_handle(&self, handle: Handle) -> Vec<AuditEvent> {
        self.events.lock().unwrap().iter().filter(|e| e.handle == Some(handle)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSinkSync for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Writes JSON events to a file (append-only).
pub struct FileAuditSink {
    path: std::path::PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSinkSync for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        use std::io::Write;
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => match serde_json::to_string(&event) {
                Ok(json) => {
                    if let Err(e) = writeln!(file, "{}", json) {
                        eprintln!("[audit] write error: {}", e);
                    }
                }
                Err(e) => eprintln!("[audit] serialize error: {}", e),
            },
            Err(e) => {
                eprintln!("[audit] cannot open {:?}: {} (cwd: {:?})", self.path, e, std::env::current_dir().unwrap_or_default());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity chain sink (tamper-evident audit log)
// ---------------------------------------------------------------------------

/// Wraps any `AuditSinkSync` and adds a SHA-256 hash chain.
///
/// Each event gets a monotonic `sequence` number and a `prev_hash`
/// containing the SHA-256 hex digest of the previous event's JSON.
/// Verifiers can replay the log and recompute hashes to detect
/// any insertion, deletion, or modification of events.
///
/// The genesis hash is `SHA-256("citadel-audit-genesis")`.
pub struct IntegrityChainSink {
    inner: Arc<dyn AuditSinkSync>,
    state: Mutex<ChainState>,
}

struct ChainState {
    sequence: u64,
    prev_hash: String,
}

impl IntegrityChainSink {
    pub fn new(inner: Arc<dyn AuditSinkSync>) -> Self {
        use sha2::{Digest, Sha256};
        let genesis = format!("{:x}", Sha256::digest(b"citadel-audit-genesis"));
        Self { inner, state: Mutex::new(ChainState { sequence: 0, prev_hash: genesis }) }
    }
}

impl AuditSinkSync for IntegrityChainSink {
    fn record(&self, mut event: AuditEvent) {
        use sha2::{Digest, Sha256};

        let mut state = self.state.lock().unwrap();

        event.sequence = Some(state.sequence);
        event.prev_hash = Some(state.prev_hash.clone());

        if let Ok(json) = serde_json::to_string(&event) {
            state.prev_hash = format!("{:x}", Sha256::digest(json.as_bytes()));
        }
        state.sequence += 1;

        drop(state);
        self.inner.record(event);
    }
}
