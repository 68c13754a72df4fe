//! Attestation observer bus (spec §4.6, C6).
//!
//! The bus is constructed once with its observer list — no process-wide
//! registry, no `register()` called after boot (spec §9 redesign note:
//! "observer registry keyed by process-wide singleton ⇒ explicit bus passed
//! through construction").

use std::sync::Arc;

use async_trait::async_trait;
use qntx_core::error::QntxResult;
use qntx_core::model::Attestation;
use qntx_core::store::Store;
use tracing::warn;

/// A single-method subscriber notified after an attestation commits.
/// Failures are the observer's own business — the bus logs and moves on.
#[async_trait]
pub trait AttestationObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_attestation_created(&self, attestation: &Attestation) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    Exists,
}

pub struct AttestationBus {
    store: Arc<dyn Store>,
    observers: Vec<Arc<dyn AttestationObserver>>,
}

impl AttestationBus {
    pub fn new(store: Arc<dyn Store>, observers: Vec<Arc<dyn AttestationObserver>>) -> Self {
        Self { store, observers }
    }

    /// Persists synchronously (fail-fast), then fans the event out to every
    /// observer on its own background task. No cross-observer ordering
    /// guarantee (spec §4.6, §5).
    pub async fn create_attestation(&self, attestation: Attestation) -> QntxResult<IngestStatus> {
        attestation.validate()?;
        let inserted = self.store.insert_attestation_if_absent(&attestation).await?;
        if !inserted {
            return Ok(IngestStatus::Exists);
        }

        for observer in &self.observers {
            let observer = observer.clone();
            let attestation = attestation.clone();
            tokio::spawn(async move {
                if let Err(e) = observer.on_attestation_created(&attestation).await {
                    warn!(observer = observer.name(), attestation_id = %attestation.id, error = %e, "observer failed");
                }
            });
        }

        Ok(IngestStatus::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        seen: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn find_scheduled_job_by_handler_and_source(
            &self,
            _h: &str,
            _s: Option<&str>,
            _st: qntx_core::model::ScheduledJobState,
        ) -> QntxResult<Option<qntx_core::model::ScheduledJob>> {
            Ok(None)
        }
        async fn get_scheduled_job(&self, _id: &str) -> QntxResult<Option<qntx_core::model::ScheduledJob>> {
            Ok(None)
        }
        async fn list_scheduled_jobs_by_state(&self, _state: qntx_core::model::ScheduledJobState) -> QntxResult<Vec<qntx_core::model::ScheduledJob>> {
            Ok(vec![])
        }
        async fn list_scheduled_jobs(&self, _limit: i64) -> QntxResult<Vec<qntx_core::model::ScheduledJob>> {
            Ok(vec![])
        }
        async fn upsert_scheduled_job(&self, _job: &qntx_core::model::ScheduledJob) -> QntxResult<()> {
            Ok(())
        }
        async fn update_scheduled_job_state(&self, _id: &str, _state: qntx_core::model::ScheduledJobState) -> QntxResult<()> {
            Ok(())
        }
        async fn advance_scheduled_job(
            &self,
            _id: &str,
            _next_run_at: chrono::DateTime<chrono::Utc>,
            _last_run_at: chrono::DateTime<chrono::Utc>,
            _last_execution_id: &str,
        ) -> QntxResult<()> {
            Ok(())
        }
        async fn get_execution(&self, _id: &str) -> QntxResult<Option<qntx_core::model::Execution>> {
            Ok(None)
        }
        async fn list_executions_for_schedule(&self, _scheduled_job_id: &str, _limit: i64) -> QntxResult<Vec<qntx_core::model::Execution>> {
            Ok(vec![])
        }
        async fn insert_execution(&self, _execution: &qntx_core::model::Execution) -> QntxResult<()> {
            Ok(())
        }
        async fn complete_execution(
            &self,
            _id: &str,
            _status: qntx_core::model::ExecutionStatus,
            _duration_ms: i64,
            _error_message: Option<&str>,
        ) -> QntxResult<()> {
            Ok(())
        }
        async fn link_execution_async_job(&self, _id: &str, _async_job_id: &str) -> QntxResult<()> {
            Ok(())
        }
        async fn force_trigger_transaction(
            &self,
            _handler_name: &str,
            _payload: &[u8],
            _source_url: Option<&str>,
            _async_job_id: &str,
        ) -> QntxResult<(qntx_core::model::ScheduledJob, qntx_core::model::Execution)> {
            unimplemented!()
        }
        async fn dispatch_transaction(&self, _scheduled_job_id: &str, _async_job_id: &str) -> QntxResult<qntx_core::model::Execution> {
            unimplemented!()
        }
        async fn append_task_log(&self, _entry: &qntx_core::model::TaskLogEntry) -> QntxResult<()> {
            Ok(())
        }
        async fn list_task_logs(&self, _job_id: &str, _stage: Option<&str>, _task_id: Option<&str>) -> QntxResult<Vec<qntx_core::model::TaskLogEntry>> {
            Ok(vec![])
        }
        async fn insert_attestation_if_absent(&self, attestation: &Attestation) -> QntxResult<bool> {
            Ok(self.seen.lock().await.insert(attestation.id.clone()))
        }
        async fn get_attestation(&self, _id: &str) -> QntxResult<Option<Attestation>> {
            Ok(None)
        }
        async fn list_attestations(&self, _limit: i64) -> QntxResult<Vec<Attestation>> {
            Ok(vec![])
        }
        async fn get_async_job_ref(&self, _id: &str) -> QntxResult<Option<qntx_core::model::AsyncJob>> {
            Ok(None)
        }
    }

    struct CountingObserver(Arc<AtomicUsize>);
    #[async_trait]
    impl AttestationObserver for CountingObserver {
        fn name(&self) -> &str {
            "counting"
        }
        async fn on_attestation_created(&self, _attestation: &Attestation) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingObserver;
    #[async_trait]
    impl AttestationObserver for FailingObserver {
        fn name(&self) -> &str {
            "failing"
        }
        async fn on_attestation_created(&self, _attestation: &Attestation) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn sample(id: &str) -> Attestation {
        Attestation {
            id: id.to_string(),
            subjects: vec!["s".into()],
            predicates: vec!["p".into()],
            contexts: vec![],
            actors: vec![],
            timestamp: chrono::Utc::now(),
            source: "test".into(),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_ingest_is_exists() {
        let bus = AttestationBus::new(Arc::new(FakeStore::default()), vec![]);
        let first = bus.create_attestation(sample("a1")).await.unwrap();
        let second = bus.create_attestation(sample("a1")).await.unwrap();
        assert_eq!(first, IngestStatus::Created);
        assert_eq!(second, IngestStatus::Exists);
    }

    #[tokio::test]
    async fn observer_failure_does_not_propagate() {
        let bus = AttestationBus::new(Arc::new(FakeStore::default()), vec![Arc::new(FailingObserver)]);
        let status = bus.create_attestation(sample("a2")).await.unwrap();
        assert_eq!(status, IngestStatus::Created);
    }

    #[tokio::test]
    async fn every_observer_is_notified() {
        let count = Arc::new(AtomicUsize::new(0));
        let bus = AttestationBus::new(
            Arc::new(FakeStore::default()),
            vec![
                Arc::new(CountingObserver(count.clone())),
                Arc::new(CountingObserver(count.clone())),
            ],
        );
        bus.create_attestation(sample("a3")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_attestation_is_rejected_before_persist() {
        let bus = AttestationBus::new(Arc::new(FakeStore::default()), vec![]);
        let mut bad = sample("a4");
        bad.subjects.clear();
        let err = bus.create_attestation(bad).await.unwrap_err();
        assert!(matches!(err, qntx_core::error::QntxError::ValidationError(_)));
    }
}
