//! One transaction per flush: apply every event, then fan results back out

use crate::error::BatchError;
use crate::event::{EventAck, EventRecord, EventRequest, EventResult};
use crate::filters::{decode_filter_definitions, matching_filters};
use crate::history::{bucket_start, HistoryEntry};
use crate::metrics::MetricsCollector;
use crate::store::{AggregationStore, AggregationTransaction};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-event slot; `None` until the event reaches a terminal state
type Outcome = Option<EventResult>;

/// Commits batches against an aggregation store
pub struct BatchCommitter<S: AggregationStore> {
    store: Arc<S>,
    history_bucket: chrono::Duration,
    metrics: Arc<MetricsCollector>,
}

impl<S: AggregationStore> BatchCommitter<S> {
    pub fn new(
        store: Arc<S>,
        history_bucket: chrono::Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { store, history_bucket, metrics }
    }

    /// Commit `batch` and deliver exactly one result to every record
    pub async fn commit(&self, batch: Vec<EventRecord>) {
        if batch.is_empty() {
            return;
        }

        let started = Instant::now();
        let (requests, replies): (Vec<_>, Vec<_>) =
            batch.into_iter().map(EventRecord::into_parts).unzip();

        let outcomes = self.execute(&requests, Utc::now()).await;

        let mut outcomes = outcomes.into_iter();
        let (mut committed, mut failed) = (0, 0);
        for (request, reply) in requests.iter().zip(replies) {
            let result = outcomes.next().flatten().unwrap_or_else(|| {
                error!(
                    metric_id = %request.metric_id,
                    project_id = %request.project_id,
                    "Event finished its batch without a result"
                );
                self.metrics.unhandled_events_total.inc();
                Err(BatchError::UnhandledEvent)
            });

            match &result {
                Ok(_) => committed += 1,
                Err(_) => failed += 1,
            }

            if reply.send(result).is_err() {
                debug!(metric_id = %request.metric_id, "Submitter went away before its result");
            }
        }

        self.metrics.events_committed_total.add(committed);
        self.metrics.events_failed_total.add(failed);
        self.metrics.flush_latency.record(started.elapsed().as_micros() as u64);
    }

    async fn execute(&self, requests: &[EventRequest], now: DateTime<Utc>) -> Vec<Outcome> {
        let mut outcomes: Vec<Outcome> = vec![None; requests.len()];

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                return self.fail_batch(requests.len(), BatchError::Transaction(e.to_string()));
            }
        };

        // Successful events per project; BTreeMap keeps project rows locked in id order
        let mut per_project: BTreeMap<Uuid, i64> = BTreeMap::new();

        for (slot, request) in outcomes.iter_mut().zip(requests) {
            if let Err(e) = tx.savepoint().await {
                Self::rollback(tx).await;
                return self.fail_batch(requests.len(), BatchError::Transaction(e.to_string()));
            }

            match self.apply_event(&mut tx, request, now).await {
                Ok(()) => {
                    if let Err(e) = tx.release_savepoint().await {
                        Self::rollback(tx).await;
                        return self
                            .fail_batch(requests.len(), BatchError::Transaction(e.to_string()));
                    }
                    *per_project.entry(request.project_id).or_default() += 1;
                }
                Err(err) => {
                    warn!(
                        metric_id = %request.metric_id,
                        project_id = %request.project_id,
                        error = %err,
                        "Event rejected"
                    );
                    if let Err(e) = tx.rollback_to_savepoint().await {
                        Self::rollback(tx).await;
                        return self
                            .fail_batch(requests.len(), BatchError::Transaction(e.to_string()));
                    }
                    *slot = Some(Err(err));
                }
            }
        }

        let mut monthly: HashMap<Uuid, i64> = HashMap::with_capacity(per_project.len());
        for (project_id, count) in per_project {
            let failure = match tx.increment_project_usage(project_id, count).await {
                Ok(Some(updated)) => {
                    monthly.insert(project_id, updated);
                    continue;
                }
                Ok(None) => "project not found".to_string(),
                Err(e) => e.to_string(),
            };

            Self::rollback(tx).await;
            return self.fail_batch(
                requests.len(),
                BatchError::ProjectUpdate { project_id, message: failure },
            );
        }

        for (slot, request) in outcomes.iter_mut().zip(requests) {
            if slot.is_none() {
                if let Some(&monthly_event_count) = monthly.get(&request.project_id) {
                    *slot = Some(Ok(EventAck { monthly_event_count }));
                }
            }
        }

        if let Err(e) = tx.commit().await {
            return self.fail_batch(requests.len(), BatchError::Commit(e.to_string()));
        }

        self.metrics.batches_flushed_total.inc();
        debug!(events = requests.len(), projects = monthly.len(), "Batch committed");
        outcomes
    }

    /// Everything one event does inside its savepoint
    async fn apply_event(
        &self,
        tx: &mut S::Tx,
        request: &EventRequest,
        now: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        let metric_id = request.metric_id;

        let row = tx
            .apply_metric_delta(metric_id, request.add, request.remove, now)
            .await
            .map_err(|e| BatchError::Storage {
                metric_id,
                message: e.to_string(),
                transient: e.is_transient(),
            })?
            .ok_or(BatchError::MetricNotFound { metric_id })?;

        if request.remove != 0 && !row.metric_type.accepts_removals() {
            return Err(BatchError::Update {
                metric_id,
                message: format!("{:?} metrics only accept additions", row.metric_type),
            });
        }

        let definitions = decode_filter_definitions(&row.filters)
            .map_err(|e| BatchError::FilterDecode { metric_id, message: e.to_string() })?;
        let hits = matching_filters(&definitions, &request.filters);

        let bucket = bucket_start(now, self.history_bucket);
        let mut entries = vec![HistoryEntry {
            metric_id,
            bucket,
            value_pos: request.add,
            value_neg: request.remove,
            relative_total: row.total,
            relative_event_count: row.event_count,
            filter_ids: hits.clone(),
        }];

        if !hits.is_empty() {
            let updated = tx
                .apply_filter_delta(metric_id, &hits, request.add, request.remove, now)
                .await
                .map_err(|e| BatchError::FilterProcess { metric_id, message: e.to_string() })?;

            if updated.len() != hits.len() {
                return Err(BatchError::FilterProcess {
                    metric_id,
                    message: format!(
                        "{} of {} matched sub-metrics exist",
                        updated.len(),
                        hits.len()
                    ),
                });
            }

            entries.extend(updated.into_iter().map(|sub| HistoryEntry {
                metric_id: sub.id,
                bucket,
                value_pos: request.add,
                value_neg: request.remove,
                relative_total: sub.total,
                relative_event_count: sub.event_count,
                filter_ids: Vec::new(),
            }));
        }

        for entry in &entries {
            tx.upsert_history(entry).await.map_err(|e| BatchError::Insert {
                metric_id: entry.metric_id,
                message: e.to_string(),
            })?;
        }

        Ok(())
    }

    fn fail_batch(&self, len: usize, err: BatchError) -> Vec<Outcome> {
        error!(events = len, error = %err, "Batch failed");
        self.metrics.batches_failed_total.inc();
        vec![Some(Err(err)); len]
    }

    async fn rollback(tx: S::Tx) {
        if let Err(e) = tx.rollback().await {
            error!(error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAggregationStore, MetricType};

    struct Fixture {
        store: Arc<MemoryAggregationStore>,
        committer: BatchCommitter<MemoryAggregationStore>,
        metrics: Arc<MetricsCollector>,
        project: Uuid,
        metric: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryAggregationStore::new());
        let project = store.create_project("acme").await.unwrap();
        let metric = store.create_metric(project, "orders", MetricType::Dual).await.unwrap();
        let metrics = Arc::new(MetricsCollector::new());
        let committer =
            BatchCommitter::new(store.clone(), chrono::Duration::seconds(60), metrics.clone());
        Fixture { store, committer, metrics, project, metric }
    }

    async fn commit_all(
        committer: &BatchCommitter<MemoryAggregationStore>,
        requests: Vec<EventRequest>,
    ) -> Vec<EventResult> {
        let (batch, receivers): (Vec<_>, Vec<_>) =
            requests.into_iter().map(EventRecord::new).unzip();
        committer.commit(batch).await;

        let mut results = Vec::new();
        for receiver in receivers {
            results.push(receiver.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_failed_event_leaves_no_trace() {
        let f = fixture().await;
        let missing = Uuid::new_v4();

        let results = commit_all(
            &f.committer,
            vec![
                EventRequest::new(f.metric, f.project, 5, 0),
                EventRequest::new(missing, f.project, 100, 0),
                EventRequest::new(f.metric, f.project, 0, 2),
            ],
        )
        .await;

        assert_eq!(results[0], Ok(EventAck { monthly_event_count: 2 }));
        assert_eq!(results[1], Err(BatchError::MetricNotFound { metric_id: missing }));
        assert_eq!(results[2], Ok(EventAck { monthly_event_count: 2 }));

        let summary = f.store.read_metric(f.metric).await.unwrap().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.event_count, 2);
        assert_eq!(f.store.project_usage(f.project).await, Some(2));
        assert_eq!(f.metrics.events_committed_total.get(), 2);
        assert_eq!(f.metrics.events_failed_total.get(), 1);
    }

    #[tokio::test]
    async fn test_base_metric_rejects_removals() {
        let f = fixture().await;
        let base = f.store.create_metric(f.project, "visits", MetricType::Base).await.unwrap();

        let requests = vec![
            EventRequest::new(base, f.project, 3, 1),
            EventRequest::new(base, f.project, 3, 0),
        ];
        let results = commit_all(&f.committer, requests).await;

        assert!(
            matches!(&results[0], Err(BatchError::Update { metric_id, .. }) if *metric_id == base)
        );
        assert_eq!(results[1], Ok(EventAck { monthly_event_count: 1 }));
        assert_eq!(f.store.read_metric(base).await.unwrap().unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_unknown_project_fails_whole_batch() {
        let f = fixture().await;
        let stranger = Uuid::new_v4();

        let results = commit_all(
            &f.committer,
            vec![
                EventRequest::new(f.metric, f.project, 1, 0),
                EventRequest::new(f.metric, stranger, 1, 0),
            ],
        )
        .await;

        for result in &results {
            assert!(matches!(
                result,
                Err(BatchError::ProjectUpdate { project_id, .. }) if *project_id == stranger
            ));
        }
        assert_eq!(f.store.read_metric(f.metric).await.unwrap().unwrap().total, 0);
        assert_eq!(f.store.project_usage(f.project).await, Some(0));
        assert_eq!(f.metrics.batches_failed_total.get(), 1);
    }

    #[tokio::test]
    async fn test_history_bucket_carries_filter_hits() {
        let f = fixture().await;
        let pro = f.store.create_filter(f.metric, "plan", "pro").await.unwrap();
        f.store.create_filter(f.metric, "plan", "starter").await.unwrap();

        let results = commit_all(
            &f.committer,
            vec![
                EventRequest::new(f.metric, f.project, 4, 0).with_filter("plan", "pro"),
                EventRequest::new(f.metric, f.project, 0, 1),
            ],
        )
        .await;
        assert!(results.iter().all(Result::is_ok));

        let now = Utc::now();
        let from = now - chrono::Duration::hours(1);
        let to = now + chrono::Duration::hours(1);

        let parent = f.store.read_history(f.metric, from, to).await.unwrap();
        let events: i64 = parent.iter().map(|b| b.event_count).sum();
        let pos: i64 = parent.iter().map(|b| b.value_pos).sum();
        let neg: i64 = parent.iter().map(|b| b.value_neg).sum();
        assert_eq!((events, pos, neg), (2, 4, 1));
        assert!(parent.iter().any(|b| b.filter_ids == vec![pro]));

        let sub = f.store.read_history(pro, from, to).await.unwrap();
        assert_eq!(sub.iter().map(|b| b.value_pos).sum::<i64>(), 4);
    }

    #[tokio::test]
    async fn test_store_fault_is_scoped_and_retryable() {
        let f = fixture().await;
        let flaky = f.store.create_metric(f.project, "refunds", MetricType::Dual).await.unwrap();
        f.store.fail_metric_update_for(flaky);

        let results = commit_all(
            &f.committer,
            vec![
                EventRequest::new(flaky, f.project, 1, 0),
                EventRequest::new(f.metric, f.project, 2, 0),
            ],
        )
        .await;

        match &results[0] {
            Err(err @ BatchError::Storage { metric_id, .. }) => {
                assert_eq!(*metric_id, flaky);
                assert!(err.is_transient());
                assert!(!err.is_batch_wide());
            }
            other => panic!("expected a storage error, got {:?}", other),
        }
        assert_eq!(results[1], Ok(EventAck { monthly_event_count: 1 }));
        assert_eq!(f.store.read_metric(flaky).await.unwrap().unwrap().event_count, 0);
    }

    #[tokio::test]
    async fn test_savepoint_failures_fail_whole_batch() {
        // Savepoint ops per event: create, then release or rollback.
        // Budget 2 fails creating the second savepoint, budget 1 fails the
        // first release, and with an unknown metric first it fails the rollback.
        let cases = [(2, false), (1, false), (1, true)];

        for (budget, unknown_first) in cases {
            let f = fixture().await;
            f.store.fail_savepoints_after(budget);

            let first = if unknown_first { Uuid::new_v4() } else { f.metric };
            let results = commit_all(
                &f.committer,
                vec![
                    EventRequest::new(first, f.project, 1, 0),
                    EventRequest::new(f.metric, f.project, 2, 0),
                ],
            )
            .await;

            for result in &results {
                assert!(
                    matches!(result, Err(BatchError::Transaction(_))),
                    "budget {budget}: {result:?}"
                );
            }
            let summary = f.store.read_metric(f.metric).await.unwrap().unwrap();
            assert_eq!((summary.total, summary.event_count), (0, 0));
            assert_eq!(f.store.project_usage(f.project).await, Some(0));
            assert_eq!(f.store.commits(), 0);
            assert_eq!(f.metrics.batches_failed_total.get(), 1);
            assert_eq!(f.metrics.events_failed_total.get(), 2);
        }
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_transaction() {
        let f = fixture().await;
        f.committer.commit(Vec::new()).await;
        assert_eq!(f.store.begin_attempts(), 0);
    }
}
