pub mod snapshot;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::markets::types::{Market, MarketId};

pub use snapshot::SnapshotStore;
pub use sqlite::{ConnectionTarget, SqliteStore};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage initialization failed: {0}")]
    Init(String),

    #[error("Storage read failed: {0}")]
    Read(String),

    #[error("Storage write failed: {0}")]
    Write(String),

    #[error("Market already exists: {0}")]
    DuplicateId(MarketId),
}

/// Durable home of prediction markets.
///
/// Implementations must make `create_market` all-or-nothing: when it returns an
/// error, the record is not visible to later reads.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Prepare the medium (file, table). Safe to call on every start.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// All markets, newest first.
    async fn list_markets(&self) -> Result<Vec<Market>, StorageError>;

    async fn get_market(&self, id: &MarketId) -> Result<Option<Market>, StorageError>;

    /// Persist a fully defaulted record and return it as stored.
    async fn create_market(&self, market: Market) -> Result<Market, StorageError>;

    async fn count_markets(&self) -> Result<usize, StorageError>;

    fn name(&self) -> &'static str;
}

/// Build the backend selected by configuration. Nothing is touched on disk
/// until `initialize` runs, except that the relational backend opens its connection.
pub fn open(config: &StorageConfig, database_url: Option<&str>) -> Result<Arc<dyn MarketStore>, StorageError> {
    match config.backend {
        StorageBackend::Snapshot => {
            info!("Using snapshot storage: {}", config.snapshot_path);
            Ok(Arc::new(SnapshotStore::new(&config.snapshot_path)))
        }
        StorageBackend::Sqlite => {
            let target = match database_url {
                Some(url) => ConnectionTarget::parse(url)?,
                None => ConnectionTarget::File(config.sqlite_path.clone().into()),
            };
            info!("Using sqlite storage: {}", target);
            Ok(Arc::new(SqliteStore::connect(&target)?))
        }
    }
}

/// Newest `created_at` first; equal timestamps keep the later insert first.
/// `markets` must be in insertion order.
pub(crate) fn newest_first(markets: &[Market]) -> Vec<Market> {
    let mut ordered: Vec<Market> = markets.iter().rev().cloned().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    ordered
}


#[cfg(test)]
mod tests {
    use super::test_support::market;
    use super::*;

    #[test]
    fn test_newest_first_orders_by_created_at() {
        let markets = vec![
            market("a", "A", "2024-01-01T00:00:00Z"),
            market("b", "B", "2024-03-01T00:00:00Z"),
            market("c", "C", "2024-02-01T00:00:00Z"),
        ];

        let ids: Vec<_> = newest_first(&markets)
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_newest_first_ties_keep_latest_insert_first() {
        let markets = vec![
            market("a", "A", "2024-01-01T00:00:00Z"),
            market("b", "B", "2024-01-01T00:00:00Z"),
        ];

        let ids: Vec<_> = newest_first(&markets)
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_open_rejects_unknown_scheme() {
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            ..StorageConfig::default()
        };

        let result = open(&config, Some("postgres://localhost/markets"));
        assert!(matches!(result, Err(StorageError::Init(_))));
    }
}
