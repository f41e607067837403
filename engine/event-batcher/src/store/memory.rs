//! In-memory aggregation store, used by the test suites
//!
//! A transaction takes the whole state lock for its lifetime and works on a
//! copy; commit writes the copy back. A savepoint keeps an undo log of the
//! rows the event touched, so rolling back one event costs only its writes.

use super::{
    AggregationStore, AggregationTransaction, MetricRowUpdate, MetricSummary, MetricType,
    StoreResult, SubMetricSummary, SubMetricUpdate,
};
use crate::error::StoreError;
use crate::filters::{decode_filter_definitions, encode_filter_definitions, FilterDefinition};
use crate::history::{HistoryBucket, HistoryEntry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ProjectRow {
    monthly_event_count: i64,
}

#[derive(Debug, Clone)]
struct MetricRow {
    project_id: Uuid,
    parent_metric_id: Option<Uuid>,
    name: String,
    metric_type: MetricType,
    filter_category: Option<String>,
    total: i64,
    event_count: i64,
    last_event_timestamp: Option<DateTime<Utc>>,
    filters: String,
}

impl MetricRow {
    fn apply(&mut self, add: i64, remove: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.total = self
            .total
            .checked_add(add)
            .and_then(|total| total.checked_sub(remove))
            .ok_or_else(|| StoreError::corrupt("bigint out of range"))?;
        self.event_count += 1;
        self.last_event_timestamp = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    projects: HashMap<Uuid, ProjectRow>,
    metrics: HashMap<Uuid, MetricRow>,
    history: BTreeMap<(Uuid, DateTime<Utc>), HistoryBucket>,
}

/// Prior state of one row written inside a savepoint
#[derive(Debug)]
enum Undo {
    Metric(Uuid, MetricRow),
    Project(Uuid, ProjectRow),
    History((Uuid, DateTime<Utc>), Option<HistoryBucket>),
}

fn record(undo: &mut Option<Vec<Undo>>, entry: impl FnOnce() -> Undo) {
    if let Some(log) = undo.as_mut() {
        log.push(entry());
    }
}

/// Injected failures
#[derive(Debug)]
struct Faults {
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_history: Mutex<HashSet<Uuid>>,
    fail_metric_update: Mutex<HashSet<Uuid>>,
    /// Savepoint operations (create, release, rollback) left before they fail
    savepoint_budget: AtomicU64,
    begin_attempts: AtomicU64,
    commits: AtomicU64,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_begin: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_history: Mutex::new(HashSet::new()),
            fail_metric_update: Mutex::new(HashSet::new()),
            savepoint_budget: AtomicU64::new(u64::MAX),
            begin_attempts: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }
}

impl Faults {
    fn spend_savepoint_op(&self) -> StoreResult<()> {
        self.savepoint_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| StoreError::unavailable("savepoint rejected"))
    }
}

/// Aggregation store kept entirely in process memory
#[derive(Debug)]
pub struct MemoryAggregationStore {
    state: Arc<tokio::sync::Mutex<MemoryState>>,
    faults: Arc<Faults>,
    paused: watch::Sender<bool>,
}

impl MemoryAggregationStore {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(tokio::sync::Mutex::new(MemoryState::default())),
            faults: Arc::new(Faults::default()),
            paused,
        }
    }

    /// New project with a zero usage counter; the name is not kept
    pub async fn create_project(&self, _name: &str) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.projects.insert(id, ProjectRow { monthly_event_count: 0 });
        Ok(id)
    }

    pub async fn create_metric(
        &self,
        project_id: Uuid,
        name: &str,
        metric_type: MetricType,
    ) -> StoreResult<Uuid> {
        let mut state = self.state.lock().await;
        if !state.projects.contains_key(&project_id) {
            return Err(StoreError::not_found(format!("project {project_id}")));
        }

        let id = Uuid::new_v4();
        state.metrics.insert(
            id,
            MetricRow {
                project_id,
                parent_metric_id: None,
                name: name.to_string(),
                metric_type,
                filter_category: None,
                total: 0,
                event_count: 0,
                last_event_timestamp: None,
                filters: "{}".to_string(),
            },
        );
        Ok(id)
    }

    /// Add a (category, option) sub-metric and register it on the parent
    pub async fn create_filter(
        &self,
        metric_id: Uuid,
        category: &str,
        name: &str,
    ) -> StoreResult<Uuid> {
        let mut state = self.state.lock().await;
        let parent = state
            .metrics
            .get(&metric_id)
            .filter(|row| row.parent_metric_id.is_none())
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("metric {metric_id}")))?;

        let mut definitions = decode_filter_definitions(&parent.filters)?;
        let id = Uuid::new_v4();
        definitions.insert(
            id,
            FilterDefinition { category: category.to_string(), name: name.to_string() },
        );
        let blob = encode_filter_definitions(&definitions)?;

        state.metrics.insert(
            id,
            MetricRow {
                project_id: parent.project_id,
                parent_metric_id: Some(metric_id),
                name: name.to_string(),
                metric_type: parent.metric_type,
                filter_category: Some(category.to_string()),
                total: 0,
                event_count: 0,
                last_event_timestamp: None,
                filters: "{}".to_string(),
            },
        );
        if let Some(row) = state.metrics.get_mut(&metric_id) {
            row.filters = blob;
        }
        Ok(id)
    }

    /// Overwrite a metric's stored filter blob as-is
    pub async fn set_raw_filters(&self, metric_id: Uuid, blob: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let row = state
            .metrics
            .get_mut(&metric_id)
            .ok_or_else(|| StoreError::not_found(format!("metric {metric_id}")))?;
        row.filters = blob.to_string();
        Ok(())
    }

    pub async fn project_usage(&self, project_id: Uuid) -> Option<i64> {
        let state = self.state.lock().await;
        state.projects.get(&project_id).map(|project| project.monthly_event_count)
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.faults.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.faults.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Reject every history write for this metric id
    pub fn fail_history_for(&self, metric_id: Uuid) {
        self.faults.fail_history.lock().insert(metric_id);
    }

    /// Reject every metric row update for this metric id
    pub fn fail_metric_update_for(&self, metric_id: Uuid) {
        self.faults.fail_metric_update.lock().insert(metric_id);
    }

    /// Let `ops` more savepoint operations succeed, then fail every one after
    pub fn fail_savepoints_after(&self, ops: u64) {
        self.faults.savepoint_budget.store(ops, Ordering::SeqCst);
    }

    /// Hold every new transaction in `begin` until `resume`
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn begin_attempts(&self) -> u64 {
        self.faults.begin_attempts.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.faults.commits.load(Ordering::SeqCst)
    }
}

impl Default for MemoryAggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AggregationStore for MemoryAggregationStore {
    type Tx = MemoryAggregationTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.faults.begin_attempts.fetch_add(1, Ordering::SeqCst);

        let mut paused = self.paused.subscribe();
        paused
            .wait_for(|paused| !*paused)
            .await
            .map_err(|_| StoreError::unavailable("store dropped"))?;

        if self.faults.fail_begin.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("begin rejected"));
        }

        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryAggregationTransaction {
            guard,
            working,
            undo: None,
            faults: self.faults.clone(),
        })
    }

    async fn read_metric(&self, metric_id: Uuid) -> StoreResult<Option<MetricSummary>> {
        let state = self.state.lock().await;
        let Some(row) = state.metrics.get(&metric_id).filter(|row| row.parent_metric_id.is_none())
        else {
            return Ok(None);
        };

        let mut sub_metrics: Vec<SubMetricSummary> = state
            .metrics
            .iter()
            .filter(|(_, sub)| sub.parent_metric_id == Some(metric_id))
            .map(|(id, sub)| SubMetricSummary {
                id: *id,
                category: sub.filter_category.clone().unwrap_or_default(),
                name: sub.name.clone(),
                total: sub.total,
                event_count: sub.event_count,
            })
            .collect();
        sub_metrics.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));

        Ok(Some(MetricSummary {
            id: metric_id,
            project_id: row.project_id,
            name: row.name.clone(),
            metric_type: row.metric_type,
            total: row.total,
            event_count: row.event_count,
            last_event_timestamp: row.last_event_timestamp,
            sub_metrics,
        }))
    }

    async fn read_history(
        &self,
        metric_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<HistoryBucket>> {
        if from >= to {
            return Ok(Vec::new());
        }

        let state = self.state.lock().await;
        let buckets = state.history.range((metric_id, from)..(metric_id, to));
        Ok(buckets.map(|(_, bucket)| bucket.clone()).collect())
    }
}

/// Transaction over a private copy of the store state
#[derive(Debug)]
pub struct MemoryAggregationTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    undo: Option<Vec<Undo>>,
    faults: Arc<Faults>,
}

#[async_trait::async_trait]
impl AggregationTransaction for MemoryAggregationTransaction {
    async fn savepoint(&mut self) -> StoreResult<()> {
        self.faults.spend_savepoint_op()?;
        self.undo = Some(Vec::new());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        self.faults.spend_savepoint_op()?;
        self.undo
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("savepoint batch_event"))
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        self.faults.spend_savepoint_op()?;
        let log = self.undo.take().ok_or_else(|| StoreError::not_found("savepoint batch_event"))?;

        for entry in log.into_iter().rev() {
            match entry {
                Undo::Metric(id, row) => {
                    self.working.metrics.insert(id, row);
                }
                Undo::Project(id, row) => {
                    self.working.projects.insert(id, row);
                }
                Undo::History(key, Some(bucket)) => {
                    self.working.history.insert(key, bucket);
                }
                Undo::History(key, None) => {
                    self.working.history.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn apply_metric_delta(
        &mut self,
        metric_id: Uuid,
        add: i64,
        remove: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MetricRowUpdate>> {
        let Some(row) = self
            .working
            .metrics
            .get_mut(&metric_id)
            .filter(|row| row.parent_metric_id.is_none())
        else {
            return Ok(None);
        };

        if self.faults.fail_metric_update.lock().contains(&metric_id) {
            return Err(StoreError::unavailable(format!("metric update rejected for {metric_id}")));
        }

        record(&mut self.undo, || Undo::Metric(metric_id, row.clone()));
        row.apply(add, remove, at)?;
        Ok(Some(MetricRowUpdate {
            metric_type: row.metric_type,
            filters: row.filters.clone(),
            total: row.total,
            event_count: row.event_count,
        }))
    }

    async fn apply_filter_delta(
        &mut self,
        parent_id: Uuid,
        filter_ids: &[Uuid],
        add: i64,
        remove: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<SubMetricUpdate>> {
        let mut updated = Vec::with_capacity(filter_ids.len());
        for id in filter_ids {
            let Some(row) = self
                .working
                .metrics
                .get_mut(id)
                .filter(|row| row.parent_metric_id == Some(parent_id))
            else {
                continue;
            };

            record(&mut self.undo, || Undo::Metric(*id, row.clone()));
            row.apply(add, remove, at)?;
            let (total, event_count) = (row.total, row.event_count);
            updated.push(SubMetricUpdate { id: *id, total, event_count });
        }
        Ok(updated)
    }

    async fn upsert_history(&mut self, entry: &HistoryEntry) -> StoreResult<()> {
        if self.faults.fail_history.lock().contains(&entry.metric_id) {
            return Err(StoreError::unavailable(format!(
                "history write rejected for {}",
                entry.metric_id
            )));
        }

        let key = (entry.metric_id, entry.bucket);
        let history = &mut self.working.history;
        record(&mut self.undo, || Undo::History(key, history.get(&key).cloned()));

        history
            .entry(key)
            .and_modify(|bucket| bucket.absorb(entry))
            .or_insert_with(|| HistoryBucket::from_entry(entry));
        Ok(())
    }

    async fn increment_project_usage(
        &mut self,
        project_id: Uuid,
        count: i64,
    ) -> StoreResult<Option<i64>> {
        let Some(project) = self.working.projects.get_mut(&project_id) else {
            return Ok(None);
        };

        record(&mut self.undo, || Undo::Project(project_id, project.clone()));
        project.monthly_event_count += count;
        Ok(Some(project.monthly_event_count))
    }

    async fn commit(mut self) -> StoreResult<()> {
        if self.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("commit rejected"));
        }

        *self.guard = std::mem::take(&mut self.working);
        self.faults.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryAggregationStore, Uuid, Uuid) {
        let store = MemoryAggregationStore::new();
        let project = store.create_project("acme").await.unwrap();
        let metric = store.create_metric(project, "signups", MetricType::Dual).await.unwrap();
        (store, project, metric)
    }

    #[tokio::test]
    async fn test_commit_publishes_working_copy() {
        let (store, project, metric) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let row = tx.apply_metric_delta(metric, 5, 2, Utc::now()).await.unwrap().unwrap();
        assert_eq!(row.total, 3);
        assert_eq!(tx.increment_project_usage(project, 1).await.unwrap(), Some(1));
        tx.commit().await.unwrap();

        let summary = store.read_metric(metric).await.unwrap().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.event_count, 1);
        assert_eq!(store.project_usage(project).await, Some(1));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let (store, _, metric) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        tx.apply_metric_delta(metric, 5, 0, Utc::now()).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.read_metric(metric).await.unwrap().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_is_partial() {
        let (store, _, metric) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        tx.savepoint().await.unwrap();
        tx.apply_metric_delta(metric, 4, 0, Utc::now()).await.unwrap();
        tx.release_savepoint().await.unwrap();

        tx.savepoint().await.unwrap();
        tx.apply_metric_delta(metric, 100, 0, Utc::now()).await.unwrap();
        tx.rollback_to_savepoint().await.unwrap();
        assert!(tx.release_savepoint().await.is_err());
        tx.commit().await.unwrap();

        assert_eq!(store.read_metric(metric).await.unwrap().unwrap().total, 4);
    }

    #[tokio::test]
    async fn test_filters_registered_on_parent() {
        let (store, _, metric) = seeded().await;
        let pro = store.create_filter(metric, "plan", "pro").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let row = tx.apply_metric_delta(metric, 1, 0, Utc::now()).await.unwrap().unwrap();
        let definitions = decode_filter_definitions(&row.filters).unwrap();
        assert_eq!(definitions[&pro].category, "plan");

        // sub-metrics are not addressable as parents
        assert!(tx.apply_metric_delta(pro, 1, 0, Utc::now()).await.unwrap().is_none());

        let ids = [pro, Uuid::new_v4()];
        let updated = tx.apply_filter_delta(metric, &ids, 1, 0, Utc::now()).await.unwrap();
        assert_eq!(updated.len(), 1);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_restores_touched_rows() {
        let (store, project, metric) = seeded().await;
        let pro = store.create_filter(metric, "plan", "pro").await.unwrap();
        let now = Utc::now();
        let entry = HistoryEntry {
            metric_id: metric,
            bucket: crate::history::bucket_start(now, chrono::Duration::seconds(60)),
            value_pos: 2,
            value_neg: 0,
            relative_total: 2,
            relative_event_count: 1,
            filter_ids: vec![pro],
        };

        let mut tx = store.begin().await.unwrap();
        tx.savepoint().await.unwrap();
        tx.apply_metric_delta(metric, 2, 0, now).await.unwrap();
        tx.apply_filter_delta(metric, &[pro], 2, 0, now).await.unwrap();
        tx.upsert_history(&entry).await.unwrap();
        tx.increment_project_usage(project, 1).await.unwrap();
        tx.rollback_to_savepoint().await.unwrap();
        tx.commit().await.unwrap();

        let summary = store.read_metric(metric).await.unwrap().unwrap();
        assert_eq!((summary.total, summary.event_count), (0, 0));
        assert_eq!(summary.sub_metric("plan", "pro").map(|sub| sub.total), Some(0));
        let hour = chrono::Duration::hours(1);
        assert!(store.read_history(metric, now - hour, now + hour).await.unwrap().is_empty());
        assert_eq!(store.project_usage(project).await, Some(0));
    }

    #[tokio::test]
    async fn test_savepoint_budget() {
        let (store, _, _) = seeded().await;
        store.fail_savepoints_after(2);

        let mut tx = store.begin().await.unwrap();
        tx.savepoint().await.unwrap();
        tx.release_savepoint().await.unwrap();
        assert!(tx.savepoint().await.is_err());
        assert!(tx.rollback_to_savepoint().await.is_err());
    }

    #[tokio::test]
    async fn test_metric_update_fault_is_transient() {
        let (store, _, metric) = seeded().await;
        store.fail_metric_update_for(metric);

        let mut tx = store.begin().await.unwrap();
        let err = tx.apply_metric_delta(metric, 1, 0, Utc::now()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (store, _, metric) = seeded().await;

        store.set_fail_begin(true);
        assert!(store.begin().await.is_err());
        store.set_fail_begin(false);

        store.fail_history_for(metric);
        let mut tx = store.begin().await.unwrap();
        let entry = HistoryEntry {
            metric_id: metric,
            bucket: Utc::now(),
            value_pos: 1,
            value_neg: 0,
            relative_total: 1,
            relative_event_count: 1,
            filter_ids: Vec::new(),
        };
        assert!(tx.upsert_history(&entry).await.is_err());

        store.set_fail_commit(true);
        assert!(tx.commit().await.is_err());
        assert_eq!(store.commits(), 0);
        assert_eq!(store.begin_attempts(), 2);
    }
}
