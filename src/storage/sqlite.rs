use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::{MarketStore, StorageError};
use crate::markets::types::{create_table_sql, Market, MarketId, MarketStatus};

const SELECT_COLUMNS: &str = "id, title, description, category, tags, status, created_at, \
     start_time, end_time, resolution_time, yes_count, no_count, \
     current_yes_probability, current_no_probability, resolution_source, external_id, extra";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the relational store lives, resolved from a connection string or
/// the configured default path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Memory,
    File(PathBuf),
}

impl ConnectionTarget {
    /// Accepts `sqlite::memory:`, `:memory:`, `sqlite://path`, `sqlite:path`,
    /// `file:path` and bare paths.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StorageError::Init("empty connection string".to_string()));
        }

        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);

        if rest == ":memory:" || (rest.is_empty() && url.starts_with("sqlite")) {
            return Ok(ConnectionTarget::Memory);
        }
        if let Some((scheme, _)) = rest.split_once("://") {
            return Err(StorageError::Init(format!(
                "unsupported connection scheme: {}",
                scheme
            )));
        }

        // Query parameters (`?mode=rwc`) are not meaningful here.
        let path = rest.split('?').next().unwrap_or(rest);
        Ok(ConnectionTarget::File(PathBuf::from(path)))
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Memory => write!(f, ":memory:"),
            ConnectionTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One row per market in the `prediction_markets` table.
///
/// rusqlite is synchronous, so every statement runs on the blocking pool
/// rather than on a runtime worker.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn connect(target: &ConnectionTarget) -> Result<Self, StorageError> {
        let conn = match target {
            ConnectionTarget::Memory => Connection::open_in_memory(),
            ConnectionTarget::File(path) => Connection::open(path),
        }
        .map_err(|e| StorageError::Init(format!("cannot open {}: {}", target, e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::Init(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool. `err` wraps any
    /// failure that happens before `op` gets the connection.
    async fn with_conn<T, F>(
        &self,
        err: fn(String) -> StorageError,
        op: F,
    ) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| err("connection lock poisoned".to_string()))?;
            op(&mut *conn)
        })
        .await
        .map_err(|e| err(format!("database task failed: {}", e)))?
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e))
        })
        .transpose()
}

fn parse_count(idx: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|e| conversion_error(idx, e))
}

fn row_to_market(row: &Row<'_>) -> rusqlite::Result<Market> {
    let id: String = row.get(0)?;

    let tags: String = row.get(4)?;
    let tags: Vec<String> = serde_json::from_str(&tags).map_err(|e| conversion_error(4, e))?;

    let status: String = row.get(5)?;
    let status = MarketStatus::parse(&status);

    let created_at = parse_ts(6, Some(row.get(6)?))?
        .ok_or(rusqlite::Error::InvalidColumnType(6, "created_at".to_string(), Type::Null))?;

    let extra: String = row.get(16)?;
    let extra: Map<String, Value> =
        serde_json::from_str(&extra).map_err(|e| conversion_error(16, e))?;

    Ok(Market {
        id: MarketId::new(id),
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        tags,
        status,
        created_at,
        start_time: parse_ts(7, row.get(7)?)?,
        end_time: parse_ts(8, row.get(8)?)?,
        resolution_time: parse_ts(9, row.get(9)?)?,
        yes_count: parse_count(10, row.get(10)?)?,
        no_count: parse_count(11, row.get(11)?)?,
        current_yes_probability: row.get(12)?,
        current_no_probability: row.get(13)?,
        resolution_source: row.get(14)?,
        external_id: row.get(15)?,
        extra,
    })
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn insert_market(conn: &mut Connection, market: Market) -> Result<Market, StorageError> {
    let write_err = |e: rusqlite::Error| StorageError::Write(e.to_string());

    let tags =
        serde_json::to_string(&market.tags).map_err(|e| StorageError::Write(e.to_string()))?;
    let extra =
        serde_json::to_string(&market.extra).map_err(|e| StorageError::Write(e.to_string()))?;
    // Callers validate counts first; this only guards direct store use.
    let yes_count = i64::try_from(market.yes_count)
        .map_err(|_| StorageError::Write("yesCount out of range".to_string()))?;
    let no_count = i64::try_from(market.no_count)
        .map_err(|_| StorageError::Write("noCount out of range".to_string()))?;

    let tx = conn.transaction().map_err(write_err)?;

    let inserted = tx.execute(
        "INSERT INTO prediction_markets (id, title, description, category, tags, status, created_at,
             start_time, end_time, resolution_time, yes_count, no_count,
             current_yes_probability, current_no_probability, resolution_source, external_id, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            market.id.as_str(),
            market.title,
            market.description,
            market.category,
            tags,
            market.status.as_str(),
            format_ts(&market.created_at),
            market.start_time.as_ref().map(format_ts),
            market.end_time.as_ref().map(format_ts),
            market.resolution_time.as_ref().map(format_ts),
            yes_count,
            no_count,
            market.current_yes_probability,
            market.current_no_probability,
            market.resolution_source,
            market.external_id,
            extra,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(e) if is_primary_key_violation(&e) => {
            return Err(StorageError::DuplicateId(market.id));
        }
        Err(e) => return Err(write_err(e)),
    }

    // Read back what the insert materialized.
    let stored = tx
        .query_row(
            &format!("SELECT {} FROM prediction_markets WHERE id = ?1", SELECT_COLUMNS),
            params![market.id.as_str()],
            row_to_market,
        )
        .map_err(write_err)?;

    tx.commit().map_err(write_err)?;
    Ok(stored)
}

#[async_trait]
impl MarketStore for SqliteStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.with_conn(StorageError::Init, |conn| {
            conn.execute_batch(&create_table_sql())
                .map_err(|e| StorageError::Init(format!("cannot create schema: {}", e)))
        })
        .await?;
        info!("prediction_markets table ready");
        Ok(())
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StorageError> {
        self.with_conn(StorageError::Read, |conn| {
            let read_err = |e: rusqlite::Error| StorageError::Read(e.to_string());
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM prediction_markets ORDER BY created_at DESC, rowid DESC",
                    SELECT_COLUMNS
                ))
                .map_err(read_err)?;

            let markets = stmt.query_map([], row_to_market).map_err(read_err)?;
            markets.collect::<Result<Vec<_>, _>>().map_err(read_err)
        })
        .await
    }

    async fn get_market(&self, id: &MarketId) -> Result<Option<Market>, StorageError> {
        let id = id.clone();
        self.with_conn(StorageError::Read, move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM prediction_markets WHERE id = ?1", SELECT_COLUMNS),
                params![id.as_str()],
                row_to_market,
            )
            .optional()
            .map_err(|e| StorageError::Read(e.to_string()))
        })
        .await
    }

    async fn create_market(&self, market: Market) -> Result<Market, StorageError> {
        self.with_conn(StorageError::Write, move |conn| insert_market(conn, market))
            .await
    }

    async fn count_markets(&self) -> Result<usize, StorageError> {
        self.with_conn(StorageError::Read, |conn| {
            conn.query_row("SELECT COUNT(*) FROM prediction_markets", [], |row| row.get(0))
                .map_err(|e| StorageError::Read(e.to_string()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::market;
    use serde_json::json;
    use tempfile::tempdir;

    async fn memory_store() -> SqliteStore {
        let store = SqliteStore::connect(&ConnectionTarget::Memory).unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[test]
    fn test_parse_connection_strings() {
        assert_eq!(ConnectionTarget::parse("sqlite::memory:").unwrap(), ConnectionTarget::Memory);
        assert_eq!(ConnectionTarget::parse(":memory:").unwrap(), ConnectionTarget::Memory);
        assert_eq!(
            ConnectionTarget::parse("sqlite:///var/lib/markets.db").unwrap(),
            ConnectionTarget::File(PathBuf::from("/var/lib/markets.db"))
        );
        assert_eq!(
            ConnectionTarget::parse("sqlite:markets.db?mode=rwc").unwrap(),
            ConnectionTarget::File(PathBuf::from("markets.db"))
        );
        assert_eq!(
            ConnectionTarget::parse("data/markets.db").unwrap(),
            ConnectionTarget::File(PathBuf::from("data/markets.db"))
        );
        assert!(ConnectionTarget::parse("postgres://user:pw@localhost/markets").is_err());
        assert!(ConnectionTarget::parse("  ").is_err());
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let store = memory_store().await;

        let mut input = market("m1", "Will it rain?", "2024-05-01T12:00:00.123Z");
        input.tags = vec!["weather".to_string(), "london".to_string()];
        input.description = Some("Rain in London tomorrow".to_string());
        input.end_time = Some(Utc::now());
        input.yes_count = 7;
        input.extra.insert("creator".to_string(), json!("alice"));

        let created = store.create_market(input.clone()).await.unwrap();
        assert_eq!(created, input);

        let fetched = store.get_market(&MarketId::new("m1")).await.unwrap();
        assert_eq!(fetched, Some(created));
    }

    #[tokio::test]
    async fn test_get_unknown_returns_none() {
        let store = memory_store().await;
        assert_eq!(store.get_market(&MarketId::new("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = memory_store().await;
        store
            .create_market(market("old", "Old", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .create_market(market("new", "New", "2024-06-01T00:00:00Z"))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_markets()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(store.count_markets().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = memory_store().await;
        store
            .create_market(market("m1", "First", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let err = store
            .create_market(market("m1", "Again", "2024-01-01T00:00:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId(_)));
        assert_eq!(store.count_markets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_on_disk() {
        let dir = tempdir().unwrap();
        let target = ConnectionTarget::File(dir.path().join("markets.db"));

        let store = SqliteStore::connect(&target).unwrap();
        store.initialize().await.unwrap();
        store
            .create_market(market("m1", "First", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store.initialize().await.unwrap();
        drop(store);

        let reopened = SqliteStore::connect(&target).unwrap();
        reopened.initialize().await.unwrap();
        assert_eq!(reopened.count_markets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_table_defaults_fill_missing_columns() {
        let store = memory_store().await;
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO prediction_markets (id, title) VALUES ('raw', 'Inserted directly')",
                [],
            )
            .unwrap();
        }

        let market = store.get_market(&MarketId::new("raw")).await.unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.yes_count, 0);
        assert_eq!(market.current_no_probability, 0.5);
        assert!(market.tags.is_empty());
        assert!(market.extra.is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_status_round_trips() {
        let store = memory_store().await;

        let mut input = market("m1", "Suspended market", "2024-01-01T00:00:00Z");
        input.status = MarketStatus::Other("suspended".to_string());
        store.create_market(input.clone()).await.unwrap();

        let fetched = store.get_market(&MarketId::new("m1")).await.unwrap().unwrap();
        assert_eq!(fetched.status, input.status);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_creates_all_stored() {
        let store = Arc::new(memory_store().await);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .create_market(market(&format!("m{}", i), "Q", "2024-01-01T00:00:00Z"))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.count_markets().await.unwrap(), 20);
    }
}
