//! Core data model (spec §3).
//!
//! These types are the shared vocabulary between the persistent store (C1),
//! the async job queue (C2), the pulse scheduler (C5), and the HTTP/WS
//! surfaces in `qntx-server`. Field names mirror the spec exactly so the
//! JSON wire shape needs no translation layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QntxError, QntxResult};

/// Per-sequence element cap shared by `Subjects`/`Predicates`/`Contexts`/`Actors`.
pub const MAX_SEQUENCE_LEN: usize = 100;
/// Per-element string length cap, in bytes.
pub const MAX_ELEMENT_BYTES: usize = 1000;
/// Attestation ingress body cap (spec §5).
pub const MAX_INGRESS_BYTES: usize = 10 * 1024 * 1024;

/// Immutable, content-addressed record — the canonical unit of storage.
///
/// Opaque to the core beyond the fields below; `Attributes` values are not
/// interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub id: String,
    pub subjects: Vec<String>,
    pub predicates: Vec<String>,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub actors: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Attestation {
    /// Validates the structural invariants from spec §3. Does not validate
    /// `attributes` contents — those are opaque to the core.
    pub fn validate(&self) -> QntxResult<()> {
        if self.subjects.is_empty() {
            return Err(QntxError::ValidationError(
                "subjects must be non-empty".into(),
            ));
        }
        if self.predicates.is_empty() {
            return Err(QntxError::ValidationError(
                "predicates must be non-empty".into(),
            ));
        }
        for (name, seq) in [
            ("subjects", &self.subjects),
            ("predicates", &self.predicates),
            ("contexts", &self.contexts),
            ("actors", &self.actors),
        ] {
            if seq.len() > MAX_SEQUENCE_LEN {
                return Err(QntxError::ValidationError(format!(
                    "{name} has {} elements, exceeds max {MAX_SEQUENCE_LEN}",
                    seq.len()
                )));
            }
            for elem in seq {
                if elem.len() > MAX_ELEMENT_BYTES {
                    return Err(QntxError::ValidationError(format!(
                        "{name} element exceeds {MAX_ELEMENT_BYTES} bytes"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stable grouping key for the sync hash tree (spec §4.8, §8 scenario 6):
    /// a partition key derived from the sorted subject set.
    pub fn group_key(&self) -> String {
        let mut subjects = self.subjects.clone();
        subjects.sort();
        let joined = subjects.join("\u{1f}");
        blake3::hash(joined.as_bytes()).to_hex().to_string()
    }
}

/// Lifecycle state of a scheduled job (spec §4.5 transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJobState {
    Active,
    Paused,
    Stopping,
    Inactive,
    Deleted,
}

impl std::fmt::Display for ScheduledJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduledJobState::Active => "active",
            ScheduledJobState::Paused => "paused",
            ScheduledJobState::Stopping => "stopping",
            ScheduledJobState::Inactive => "inactive",
            ScheduledJobState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// Tracking scheduled job used by the force-trigger path (spec §4.5).
pub const FORCE_TRIGGER_DOC: &str = "__force_trigger__";

/// Interval-driven execution record (spec §3 "Scheduled job").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub handler_name: String,
    #[serde(with = "serde_bytes_base64")]
    pub payload: Vec<u8>,
    pub source_url: Option<String>,
    pub interval_seconds: i64,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_execution_id: Option<String>,
    pub state: ScheduledJobState,
    pub created_from_doc: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Content-derived id, stable across boot reloads for the same
    /// `(handler_name, source_url)` pair (spec §4.5 idempotent reload).
    pub fn derive_id(handler_name: &str, source_url: Option<&str>) -> String {
        let key = format!("{handler_name}|{}", source_url.unwrap_or(""));
        let hash = blake3::hash(key.as_bytes());
        format!("SPJ_{handler_name}_{}", &hash.to_hex()[..12])
    }

    pub fn is_one_shot(&self) -> bool {
        self.interval_seconds == 0
    }
}

/// Status of one execution attempt (spec §3 "Execution").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub scheduled_job_id: String,
    pub async_job_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a queued unit of work (spec §3 "Async job").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncJobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AsyncJobStatus {
    /// Terminal statuses are sinks (spec §3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AsyncJobStatus::Completed | AsyncJobStatus::Failed | AsyncJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJob {
    pub id: String,
    pub handler_name: String,
    #[serde(with = "serde_bytes_base64")]
    pub payload: Vec<u8>,
    pub source: Option<String>,
    pub parent_id: Option<String>,
    pub status: AsyncJobStatus,
    pub progress: Progress,
    pub cost_estimate: Option<f64>,
    pub cost_actual: Option<f64>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_details: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncJob {
    pub fn new(id: String, handler_name: String, payload: Vec<u8>, source: Option<String>, parent_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            handler_name,
            payload,
            source,
            parent_id,
            status: AsyncJobStatus::Queued,
            progress: Progress::default(),
            cost_estimate: None,
            cost_actual: None,
            error: None,
            error_details: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only per-job log line (spec §3 "Task log entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub job_id: String,
    pub stage: Option<String>,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

/// In-memory peer state (spec §3 "Peer state"), mutated only by the sync
/// ticker task (spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub name: String,
    pub status: PeerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub remote_budget: Option<f64>,
    pub advertised_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Unknown,
    Reachable,
    Unreachable,
}

/// Bytes serialized as base64 so opaque payloads travel cleanly in JSON.
mod serde_bytes_base64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(s)
        }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Attestation {
        Attestation {
            id: "att_1".into(),
            subjects: vec!["person:1".into()],
            predicates: vec!["knows".into()],
            contexts: vec![],
            actors: vec![],
            timestamp: Utc::now(),
            source: "test".into(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn rejects_empty_subjects() {
        let mut a = sample();
        a.subjects.clear();
        assert!(a.validate().is_err());
    }

    #[test]
    fn rejects_oversized_sequence() {
        let mut a = sample();
        a.subjects = (0..MAX_SEQUENCE_LEN + 1).map(|i| i.to_string()).collect();
        assert!(a.validate().is_err());
    }

    #[test]
    fn group_key_is_order_independent() {
        let mut a = sample();
        a.subjects = vec!["b".into(), "a".into()];
        let mut c = sample();
        c.subjects = vec!["a".into(), "b".into()];
        assert_eq!(a.group_key(), c.group_key());
    }

    #[test]
    fn derive_id_is_stable() {
        let id1 = ScheduledJob::derive_id("demo", Some("src"));
        let id2 = ScheduledJob::derive_id("demo", Some("src"));
        assert_eq!(id1, id2);
        assert!(id1.starts_with("SPJ_demo_"));
    }
}
