//! Postgres-backed aggregation store

use super::{
    AggregationStore, AggregationTransaction, MetricRowUpdate, MetricSummary, MetricType,
    StoreResult, SubMetricSummary, SubMetricUpdate,
};
use crate::error::StoreError;
use crate::history::{HistoryBucket, HistoryEntry};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

const SAVEPOINT: &str = "SAVEPOINT batch_event";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT batch_event";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT batch_event";

const UPDATE_METRIC: &str = r#"
    UPDATE metrics
    SET total = total + $2 - $3,
        event_count = event_count + 1,
        last_event_timestamp = $4
    WHERE id = $1 AND parent_metric_id IS NULL
    RETURNING metric_type, filters::text AS filters, total, event_count
"#;

const UPDATE_SUB_METRICS: &str = r#"
    UPDATE metrics
    SET total = total + $3 - $4,
        event_count = event_count + 1,
        last_event_timestamp = $5
    WHERE parent_metric_id = $1 AND id = ANY($2)
    RETURNING id, total, event_count
"#;

const UPSERT_HISTORY: &str = r#"
    INSERT INTO metric_events (
        metric_id, bucket_timestamp, value_pos, value_neg,
        relative_total, relative_event_count, event_count, filter_ids
    )
    VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
    ON CONFLICT (metric_id, bucket_timestamp) DO UPDATE SET
        value_pos = metric_events.value_pos + EXCLUDED.value_pos,
        value_neg = metric_events.value_neg + EXCLUDED.value_neg,
        event_count = metric_events.event_count + 1,
        relative_total = CASE
            WHEN EXCLUDED.relative_event_count >= metric_events.relative_event_count
            THEN EXCLUDED.relative_total
            ELSE metric_events.relative_total
        END,
        relative_event_count =
            GREATEST(metric_events.relative_event_count, EXCLUDED.relative_event_count),
        filter_ids = ARRAY(
            SELECT DISTINCT unnest(metric_events.filter_ids || EXCLUDED.filter_ids) ORDER BY 1
        )
"#;

const INCREMENT_PROJECT: &str = r#"
    UPDATE projects
    SET monthly_event_count = monthly_event_count + $2
    WHERE id = $1
    RETURNING monthly_event_count
"#;

/// Aggregation store on a shared Postgres pool
#[derive(Debug, Clone)]
pub struct PgAggregationStore {
    pool: PgPool,
}

impl PgAggregationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Aggregation store migrations applied");
        Ok(())
    }

    pub async fn create_project(&self, name: &str) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO projects (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn create_metric(
        &self,
        project_id: Uuid,
        name: &str,
        metric_type: MetricType,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO metrics (id, project_id, name, metric_type) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(project_id)
        .bind(name)
        .bind(metric_type.code())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Add a (category, option) sub-metric and register it in the parent's filter blob
    pub async fn create_filter(
        &self,
        metric_id: Uuid,
        category: &str,
        name: &str,
    ) -> StoreResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        let parent = sqlx::query(
            "SELECT project_id, metric_type FROM metrics \
             WHERE id = $1 AND parent_metric_id IS NULL FOR UPDATE",
        )
        .bind(metric_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("metric {metric_id}")))?;
        let project_id: Uuid = parent.try_get("project_id")?;
        let metric_type: i16 = parent.try_get("metric_type")?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO metrics \
                 (id, project_id, parent_metric_id, name, metric_type, filter_category) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(project_id)
        .bind(metric_id)
        .bind(name)
        .bind(metric_type)
        .bind(category)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE metrics SET filters = filters || jsonb_build_object( \
                 $2::text, jsonb_build_object('category', $3::text, 'name', $4::text)) \
             WHERE id = $1",
        )
        .bind(metric_id)
        .bind(id.to_string())
        .bind(category)
        .bind(name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn project_usage(&self, project_id: Uuid) -> StoreResult<Option<i64>> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT monthly_event_count FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count)
    }
}

fn decode_metric_type(code: i16) -> StoreResult<MetricType> {
    MetricType::from_code(code).ok_or_else(|| StoreError::corrupt(format!("metric_type {code}")))
}

fn history_bucket_from_row(row: &PgRow) -> StoreResult<HistoryBucket> {
    Ok(HistoryBucket {
        metric_id: row.try_get("metric_id")?,
        bucket: row.try_get("bucket_timestamp")?,
        value_pos: row.try_get("value_pos")?,
        value_neg: row.try_get("value_neg")?,
        relative_total: row.try_get("relative_total")?,
        relative_event_count: row.try_get("relative_event_count")?,
        event_count: row.try_get("event_count")?,
        filter_ids: row.try_get("filter_ids")?,
    })
}

#[async_trait::async_trait]
impl AggregationStore for PgAggregationStore {
    type Tx = PgAggregationTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgAggregationTransaction { tx })
    }

    async fn read_metric(&self, metric_id: Uuid) -> StoreResult<Option<MetricSummary>> {
        let Some(row) = sqlx::query(
            "SELECT id, project_id, name, metric_type, total, event_count, last_event_timestamp \
             FROM metrics WHERE id = $1 AND parent_metric_id IS NULL",
        )
        .bind(metric_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let sub_rows = sqlx::query(
            "SELECT id, filter_category, name, total, event_count FROM metrics \
             WHERE parent_metric_id = $1 ORDER BY filter_category, name",
        )
        .bind(metric_id)
        .fetch_all(&self.pool)
        .await?;

        let sub_metrics = sub_rows
            .iter()
            .map(|sub| {
                let category: Option<String> = sub.try_get("filter_category")?;
                Ok(SubMetricSummary {
                    id: sub.try_get("id")?,
                    category: category.unwrap_or_default(),
                    name: sub.try_get("name")?,
                    total: sub.try_get("total")?,
                    event_count: sub.try_get("event_count")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(MetricSummary {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            metric_type: decode_metric_type(row.try_get("metric_type")?)?,
            total: row.try_get("total")?,
            event_count: row.try_get("event_count")?,
            last_event_timestamp: row.try_get("last_event_timestamp")?,
            sub_metrics,
        }))
    }

    async fn read_history(
        &self,
        metric_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<HistoryBucket>> {
        let rows = sqlx::query(
            "SELECT metric_id, bucket_timestamp, value_pos, value_neg, relative_total, \
                    relative_event_count, event_count, filter_ids \
             FROM metric_events \
             WHERE metric_id = $1 AND bucket_timestamp >= $2 AND bucket_timestamp < $3 \
             ORDER BY bucket_timestamp",
        )
        .bind(metric_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_bucket_from_row).collect()
    }
}

/// One pooled connection inside `BEGIN ... COMMIT`
#[derive(Debug)]
pub struct PgAggregationTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgAggregationTransaction {
    async fn execute(&mut self, statement: &'static str) -> StoreResult<()> {
        sqlx::query(statement).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AggregationTransaction for PgAggregationTransaction {
    async fn savepoint(&mut self) -> StoreResult<()> {
        self.execute(SAVEPOINT).await
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        self.execute(RELEASE_SAVEPOINT).await
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        // ROLLBACK TO keeps the savepoint alive; release it so they never nest
        self.execute(ROLLBACK_TO_SAVEPOINT).await?;
        self.execute(RELEASE_SAVEPOINT).await
    }

    async fn apply_metric_delta(
        &mut self,
        metric_id: Uuid,
        add: i64,
        remove: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MetricRowUpdate>> {
        let Some(row) = sqlx::query(UPDATE_METRIC)
            .bind(metric_id)
            .bind(add)
            .bind(remove)
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(MetricRowUpdate {
            metric_type: decode_metric_type(row.try_get("metric_type")?)?,
            filters: row.try_get("filters")?,
            total: row.try_get("total")?,
            event_count: row.try_get("event_count")?,
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
        let rows = sqlx::query(UPDATE_SUB_METRICS)
            .bind(parent_id)
            .bind(filter_ids)
            .bind(add)
            .bind(remove)
            .bind(at)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SubMetricUpdate {
                    id: row.try_get("id")?,
                    total: row.try_get("total")?,
                    event_count: row.try_get("event_count")?,
                })
            })
            .collect()
    }

    async fn upsert_history(&mut self, entry: &HistoryEntry) -> StoreResult<()> {
        sqlx::query(UPSERT_HISTORY)
            .bind(entry.metric_id)
            .bind(entry.bucket)
            .bind(entry.value_pos)
            .bind(entry.value_neg)
            .bind(entry.relative_total)
            .bind(entry.relative_event_count)
            .bind(&entry.filter_ids[..])
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_project_usage(
        &mut self,
        project_id: Uuid,
        count: i64,
    ) -> StoreResult<Option<i64>> {
        let updated: Option<i64> = sqlx::query_scalar(INCREMENT_PROJECT)
            .bind(project_id)
            .bind(count)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(updated)
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
