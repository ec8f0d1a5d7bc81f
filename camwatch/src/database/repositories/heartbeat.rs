//! Heartbeat repository.
//!
//! Each stream gets its own append-only history table, created on first
//! write and registered in the `streams` catalog.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::database::models::{
    HeartbeatDbModel, HeartbeatRecord, HistoryQuery, history_table_name,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::registry::Protocol;
use crate::{Error, Result};

/// Catalog row cached per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogEntry {
    table_name: String,
    protocol: Protocol,
}

/// Durable per-stream heartbeat history.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Create the stream's history table if needed. Idempotent.
    async fn ensure_stream_table(&self, stream_name: &str, protocol: Protocol) -> Result<String>;

    async fn append(&self, record: &HeartbeatRecord) -> Result<()>;

    /// Append several records. Streams are isolated from each other: when
    /// some cannot be written the rest still are, and the error is
    /// [`Error::PartialWrite`].
    async fn append_batch(&self, records: &[HeartbeatRecord]) -> Result<()>;

    /// Records in `query`'s range, oldest first.
    async fn query_history(
        &self,
        stream_name: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<HeartbeatRecord>>;

    /// Newest `limit` records, returned oldest first.
    async fn latest_records(&self, stream_name: &str, limit: u32) -> Result<Vec<HeartbeatRecord>>;

    /// Names of every stream that has a history table.
    async fn list_streams(&self) -> Result<Vec<String>>;
}

/// SQLx implementation of [`HeartbeatStore`].
///
/// `catalog` caches `streams` rows for the read paths. `provisioned` holds
/// the streams whose table this process has created or verified; a catalog
/// row alone does not prove the table still exists.
pub struct SqlxHeartbeatStore {
    pool: SqlitePool,
    catalog: Mutex<HashMap<String, CatalogEntry>>,
    provisioned: Mutex<HashSet<String>>,
}

impl SqlxHeartbeatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            catalog: Mutex::new(HashMap::new()),
            provisioned: Mutex::new(HashSet::new()),
        }
    }

    async fn catalog_entry(&self, stream_name: &str) -> Result<Option<CatalogEntry>> {
        if let Some(entry) = self.catalog.lock().get(stream_name) {
            return Ok(Some(entry.clone()));
        }
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT table_name, protocol FROM streams WHERE name = ?")
                .bind(stream_name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((table_name, protocol)) = row else {
            return Ok(None);
        };
        let protocol = protocol
            .parse::<Protocol>()
            .map_err(|_| Error::CorruptHistory(format!("unknown protocol '{protocol}' for {stream_name}")))?;
        let entry = CatalogEntry {
            table_name,
            protocol,
        };
        self.catalog
            .lock()
            .insert(stream_name.to_string(), entry.clone());
        Ok(Some(entry))
    }

    /// Forget everything cached about `stream_name`.
    fn invalidate(&self, stream_name: &str) {
        self.provisioned.lock().remove(stream_name);
        self.catalog.lock().remove(stream_name);
    }

    async fn create_table(&self, stream_name: &str, protocol: Protocol) -> Result<String> {
        let table = history_table_name(stream_name);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_name TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                message TEXT NOT NULL
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{table}_observed_at" ON "{table}" (stream_name, observed_at)"#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO streams (name, table_name, protocol, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET protocol = excluded.protocol
            "#,
        )
        .bind(stream_name)
        .bind(&table)
        .bind(protocol.as_str())
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(table)
    }

    /// Insert `(table, record)` rows in one transaction.
    async fn insert_rows(&self, rows: &[(&str, &HeartbeatRecord)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (table, record) in rows {
            sqlx::query(&format!(
                r#"INSERT INTO "{table}" (stream_name, observed_at, outcome, latency_ms, message) VALUES (?, ?, ?, ?, ?)"#
            ))
            .bind(&record.stream_name)
            .bind(record.observed_at_ms())
            .bind(record.outcome.as_str())
            .bind(record.latency_ms)
            .bind(&record.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write one stream's records on their own. A table that vanished
    /// since it was provisioned is created again once.
    async fn append_stream(&self, stream_name: &str, records: &[&HeartbeatRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let mut recreated = false;
        loop {
            let table = self.ensure_stream_table(stream_name, first.protocol).await?;
            let rows: Vec<(&str, &HeartbeatRecord)> =
                records.iter().map(|r| (table.as_str(), *r)).collect();
            match retry_on_sqlite_busy("append_stream", || self.insert_rows(&rows)).await {
                Err(err) if err.is_missing_table() && !recreated => {
                    warn!(stream = %stream_name, table = %table, "History table missing; recreating");
                    self.invalidate(stream_name);
                    recreated = true;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl HeartbeatStore for SqlxHeartbeatStore {
    async fn ensure_stream_table(&self, stream_name: &str, protocol: Protocol) -> Result<String> {
        let ready = self.provisioned.lock().contains(stream_name);
        if ready
            && let Some(entry) = self.catalog_entry(stream_name).await?
            && entry.protocol == protocol
        {
            return Ok(entry.table_name);
        }

        let table = retry_on_sqlite_busy("ensure_stream_table", || {
            self.create_table(stream_name, protocol)
        })
        .await?;
        debug!(stream = %stream_name, table = %table, "History table ready");
        self.catalog.lock().insert(
            stream_name.to_string(),
            CatalogEntry {
                table_name: table.clone(),
                protocol,
            },
        );
        self.provisioned.lock().insert(stream_name.to_string());
        Ok(table)
    }

    async fn append(&self, record: &HeartbeatRecord) -> Result<()> {
        self.append_batch(std::slice::from_ref(record)).await
    }

    async fn append_batch(&self, records: &[HeartbeatRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut groups: Vec<(&str, Vec<&HeartbeatRecord>)> = Vec::new();
        for record in records {
            match groups.iter_mut().find(|(name, _)| *name == record.stream_name) {
                Some((_, group)) => group.push(record),
                None => groups.push((record.stream_name.as_str(), vec![record])),
            }
        }

        // Provision every stream first; one that cannot be set up is left
        // out of the shared transaction.
        let mut tables: HashMap<&str, String> = HashMap::new();
        let mut failed: Vec<(&str, Error)> = Vec::new();
        for &(name, ref group) in &groups {
            match self.ensure_stream_table(name, group[0].protocol).await {
                Ok(table) => {
                    tables.insert(name, table);
                }
                Err(err) => failed.push((name, err)),
            }
        }

        let rows: Vec<(&str, &HeartbeatRecord)> = records
            .iter()
            .filter_map(|r| tables.get(r.stream_name.as_str()).map(|t| (t.as_str(), r)))
            .collect();
        if let Err(err) = retry_on_sqlite_busy("append_heartbeats", || self.insert_rows(&rows)).await {
            warn!(error = %err, streams = tables.len(), "Batch insert failed; writing streams separately");
            for &(name, ref group) in &groups {
                if !tables.contains_key(name) {
                    continue;
                }
                if let Err(err) = self.append_stream(name, group).await {
                    failed.push((name, err));
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let lost = groups
            .iter()
            .filter(|(name, _)| failed.iter().any(|(f, _)| f == name))
            .map(|(_, group)| group.len())
            .sum();
        let streams = failed.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ");
        let reason = failed
            .first()
            .map(|(_, err)| err.to_string())
            .unwrap_or_default();
        Err(Error::PartialWrite {
            lost,
            streams,
            reason,
        })
    }

    async fn query_history(
        &self,
        stream_name: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<HeartbeatRecord>> {
        let Some(entry) = self.catalog_entry(stream_name).await? else {
            return Ok(Vec::new());
        };
        let from = query.from.map(datetime_to_ms).unwrap_or(i64::MIN);
        let to = query.to.map(datetime_to_ms).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, HeartbeatDbModel>(&format!(
            r#"
            SELECT id, stream_name, observed_at, outcome, latency_ms, message
            FROM "{}"
            WHERE stream_name = ? AND observed_at >= ? AND observed_at <= ?
            ORDER BY observed_at ASC, id ASC
            LIMIT ?
            "#,
            entry.table_name
        ))
        .bind(stream_name)
        .bind(from)
        .bind(to)
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| HeartbeatRecord::from_row(row, entry.protocol))
            .collect()
    }

    async fn latest_records(&self, stream_name: &str, limit: u32) -> Result<Vec<HeartbeatRecord>> {
        let Some(entry) = self.catalog_entry(stream_name).await? else {
            return Ok(Vec::new());
        };

        let mut rows = sqlx::query_as::<_, HeartbeatDbModel>(&format!(
            r#"
            SELECT id, stream_name, observed_at, outcome, latency_ms, message
            FROM "{}"
            WHERE stream_name = ?
            ORDER BY observed_at DESC, id DESC
            LIMIT ?
            "#,
            entry.table_name
        ))
        .bind(stream_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();

        rows.into_iter()
            .map(|row| HeartbeatRecord::from_row(row, entry.protocol))
            .collect()
    }

    async fn list_streams(&self) -> Result<Vec<String>> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM streams ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().map(|(n,)| n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool_with_size, run_migrations};
    use crate::database::time::ms_to_datetime;
    use crate::probe::ProbeOutcome;

    async fn store() -> SqlxHeartbeatStore {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlxHeartbeatStore::new(pool)
    }

    fn record(stream: &str, at_ms: i64, outcome: ProbeOutcome) -> HeartbeatRecord {
        HeartbeatRecord {
            stream_name: stream.to_string(),
            protocol: Protocol::PullStream,
            observed_at: ms_to_datetime(at_ms),
            outcome,
            latency_ms: 100,
            message: outcome.to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = store().await;
        let a = store.ensure_stream_table("Front Door", Protocol::PullStream).await.unwrap();
        let b = store.ensure_stream_table("Front Door", Protocol::PullStream).await.unwrap();
        assert_eq!(a, "log_Front_Door");
        assert_eq!(a, b);
        assert_eq!(store.list_streams().await.unwrap(), vec!["Front Door"]);
    }

    #[tokio::test]
    async fn test_append_and_query_in_order() {
        let store = store().await;
        store.append(&record("gate", 3_000, ProbeOutcome::Timeout)).await.unwrap();
        store
            .append_batch(&[
                record("gate", 1_000, ProbeOutcome::Success),
                record("gate", 2_000, ProbeOutcome::AuthFailure),
            ])
            .await
            .unwrap();

        let all = store.query_history("gate", &HistoryQuery::default()).await.unwrap();
        let times: Vec<i64> = all.iter().map(|r| r.observed_at_ms()).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        assert_eq!(all[1].outcome, ProbeOutcome::AuthFailure);

        let ranged = store
            .query_history(
                "gate",
                &HistoryQuery {
                    from: Some(ms_to_datetime(1_500)),
                    to: Some(ms_to_datetime(3_000)),
                    limit: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].observed_at_ms(), 2_000);
    }

    #[tokio::test]
    async fn test_colliding_table_names_keep_histories_apart() {
        let store = store().await;
        store.append(&record("cam 1", 1_000, ProbeOutcome::Success)).await.unwrap();
        store.append(&record("cam-1", 2_000, ProbeOutcome::Timeout)).await.unwrap();

        let a = store.query_history("cam 1", &HistoryQuery::default()).await.unwrap();
        let b = store.query_history("cam-1", &HistoryQuery::default()).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].outcome, ProbeOutcome::Timeout);
    }

    async fn history_len(store: &SqlxHeartbeatStore, stream: &str) -> usize {
        store
            .query_history(stream, &HistoryQuery::default())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_missing_table_is_recreated_after_restart() {
        let store = store().await;
        store.append(&record("A", 1_000, ProbeOutcome::Success)).await.unwrap();
        sqlx::query(r#"DROP TABLE "log_A""#)
            .execute(&store.pool)
            .await
            .unwrap();

        // catalog row survives, table does not
        let restarted = SqlxHeartbeatStore::new(store.pool.clone());
        restarted
            .append_batch(&[
                record("A", 2_000, ProbeOutcome::Timeout),
                record("B", 2_000, ProbeOutcome::Success),
            ])
            .await
            .unwrap();

        assert_eq!(history_len(&restarted, "A").await, 1);
        assert_eq!(history_len(&restarted, "B").await, 1);
    }

    #[tokio::test]
    async fn test_table_dropped_while_running_is_recreated() {
        let store = store().await;
        store.append(&record("A", 1_000, ProbeOutcome::Success)).await.unwrap();
        store.append(&record("B", 1_000, ProbeOutcome::Success)).await.unwrap();
        sqlx::query(r#"DROP TABLE "log_A""#)
            .execute(&store.pool)
            .await
            .unwrap();

        store
            .append_batch(&[
                record("A", 2_000, ProbeOutcome::Timeout),
                record("B", 2_000, ProbeOutcome::Success),
            ])
            .await
            .unwrap();
        store.append(&record("A", 3_000, ProbeOutcome::Success)).await.unwrap();

        assert_eq!(history_len(&store, "A").await, 2);
        assert_eq!(history_len(&store, "B").await, 2);
    }

    #[tokio::test]
    async fn test_broken_stream_does_not_drop_its_batch_mates() {
        let store = store().await;
        sqlx::query(r#"CREATE VIEW "log_bad" AS SELECT 1 AS id"#)
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .append_batch(&[
                record("good", 1_000, ProbeOutcome::Success),
                record("bad", 1_000, ProbeOutcome::Timeout),
                record("good", 2_000, ProbeOutcome::Success),
            ])
            .await
            .unwrap_err();

        match err {
            Error::PartialWrite { lost, streams, .. } => {
                assert_eq!(lost, 1);
                assert_eq!(streams, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(history_len(&store, "good").await, 2);
    }

    #[tokio::test]
    async fn test_latest_records() {
        let store = store().await;
        let records: Vec<_> = (1..=5)
            .map(|i| record("gate", i * 1_000, ProbeOutcome::Success))
            .collect();
        store.append_batch(&records).await.unwrap();

        let latest = store.latest_records("gate", 2).await.unwrap();
        let times: Vec<i64> = latest.iter().map(|r| r.observed_at_ms()).collect();
        assert_eq!(times, vec![4_000, 5_000]);
    }

    #[tokio::test]
    async fn test_unknown_stream_is_empty() {
        let store = store().await;
        assert!(store
            .query_history("nobody", &HistoryQuery::default())
            .await
            .unwrap()
            .is_empty());
        assert!(store.latest_records("nobody", 10).await.unwrap().is_empty());
    }
}
