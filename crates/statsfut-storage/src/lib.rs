//! Match table access for StatsFut: the `MatchStore` seam, its Postgres
//! implementation and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use statsfut_core::{is_active, FixtureKey, MatchRecord, MatchStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "statsfut-storage";

pub const DEFAULT_MATCH_TABLE: &str = "matches_match";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Every record whose (home, away, date) key is shared with at least one
    /// other record.
    async fn duplicate_candidates(&self) -> Result<Vec<MatchRecord>, StoreError>;

    /// Deletes the given ids and returns how many rows went away.
    async fn delete_matches(&self, ids: &[i64]) -> Result<u64, StoreError>;

    /// Whether any fixture is in play, or scheduled to kick off before
    /// `now + upcoming_buffer`.
    async fn has_active_matches(
        &self,
        now: DateTime<Utc>,
        upcoming_buffer: Duration,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
    table: String,
}

impl PgMatchStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if !is_plain_identifier(&table) {
            return Err(StoreError::InvalidTableName(table));
        }
        Ok(Self { pool, table })
    }

    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Self::new(pool, table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Applies the bundled schema. Only needed when the table is not already
    /// managed by the web application.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn duplicate_candidates(&self) -> Result<Vec<MatchRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, home_team, away_team, date, status, api_id
              FROM (
                SELECT id::bigint AS id,
                       home_team,
                       away_team,
                       date,
                       status,
                       api_id::text AS api_id,
                       COUNT(*) OVER (PARTITION BY home_team, away_team, date) AS group_size
                  FROM {table}
              ) AS grouped
             WHERE group_size > 1
             ORDER BY home_team, away_team, date, id
            "#,
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .instrument(info_span!("duplicate_candidates", table = %self.table))
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(MatchRecord {
                id: row.try_get("id")?,
                home_team: row.try_get("home_team")?,
                away_team: row.try_get("away_team")?,
                date: row.try_get("date")?,
                status: MatchStatus::from(status),
                api_id: row.try_get("api_id")?,
            });
        }
        debug!(rows = out.len(), "loaded duplicate candidates");
        Ok(out)
    }

    async fn delete_matches(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", self.table);
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn has_active_matches(
        &self,
        now: DateTime<Utc>,
        upcoming_buffer: Duration,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM {table}
                 WHERE status = ANY($1)
                    OR (status = $2 AND date <= $3)
            ) AS active
            "#,
            table = self.table
        );
        let in_play = MatchStatus::IN_PLAY
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        let row = sqlx::query(&sql)
            .bind(in_play)
            .bind(MatchStatus::Scheduled.as_str())
            .bind(
                now.checked_add_signed(upcoming_buffer)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("active")?)
    }
}

/// Keeps match rows in a vector. Used in tests.
#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    records: Mutex<Vec<MatchRecord>>,
}

impl MemoryMatchStore {
    pub fn new(records: Vec<MatchRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn insert(&self, record: MatchRecord) {
        self.records.lock().await.push(record);
    }

    pub async fn records(&self) -> Vec<MatchRecord> {
        let mut records = self.records.lock().await.clone();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn duplicate_candidates(&self) -> Result<Vec<MatchRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut sizes: HashMap<FixtureKey, usize> = HashMap::new();
        for record in records.iter() {
            *sizes.entry(record.fixture_key()).or_default() += 1;
        }
        let mut out = records
            .iter()
            .filter(|r| sizes.get(&r.fixture_key()).copied().unwrap_or(0) > 1)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.fixture_key().cmp(&b.fixture_key()).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete_matches(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        Ok((before - records.len()) as u64)
    }

    async fn has_active_matches(
        &self,
        now: DateTime<Utc>,
        upcoming_buffer: Duration,
    ) -> Result<bool, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().any(|r| is_active(r, now, upcoming_buffer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, hour, 0, 0).single().unwrap()
    }

    fn mk(id: i64, home: &str, away: &str, hour: u32, status: MatchStatus) -> MatchRecord {
        MatchRecord {
            id,
            home_team: home.into(),
            away_team: away.into(),
            date: at(hour),
            status,
            api_id: None,
        }
    }

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(is_plain_identifier("matches_match"));
        assert!(is_plain_identifier("_tmp2"));
        assert!(!is_plain_identifier("2matches"));
        assert!(!is_plain_identifier("matches; DROP TABLE x"));
        assert!(!is_plain_identifier(""));
    }

    #[tokio::test]
    async fn memory_store_returns_only_shared_keys() {
        let store = MemoryMatchStore::new(vec![
            mk(1, "Flamengo", "Vasco", 18, MatchStatus::Scheduled),
            mk(2, "Flamengo", "Vasco", 18, MatchStatus::Finished),
            mk(3, "Flamengo", "Vasco", 20, MatchStatus::Scheduled),
            mk(4, "Vasco", "Flamengo", 18, MatchStatus::Scheduled),
        ]);
        let ids = store
            .duplicate_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn memory_store_delete_reports_removed_rows() {
        let store = MemoryMatchStore::new(vec![
            mk(1, "Bahia", "Vitoria", 18, MatchStatus::Scheduled),
            mk(2, "Bahia", "Vitoria", 18, MatchStatus::Scheduled),
        ]);
        assert_eq!(store.delete_matches(&[2, 99]).await.unwrap(), 1);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_activity_follows_core_predicate() {
        let store = MemoryMatchStore::new(vec![mk(1, "Gremio", "Inter", 20, MatchStatus::Scheduled)]);
        assert!(!store.has_active_matches(at(18), Duration::minutes(30)).await.unwrap());
        assert!(store
            .has_active_matches(at(19) + Duration::minutes(30), Duration::minutes(30))
            .await
            .unwrap());

        store.insert(mk(2, "Ceara", "Fortaleza", 23, MatchStatus::HalfTime)).await;
        assert!(store.has_active_matches(at(18), Duration::minutes(30)).await.unwrap());
    }
}
