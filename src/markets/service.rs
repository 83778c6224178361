use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use crate::markets::types::{Market, MarketId, NewMarket, MAX_COUNT};
use crate::storage::{MarketStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("No market data provided")]
    MissingPayload,

    #[error("Invalid JSON body")]
    InvalidJson,

    #[error("Market data must be an object")]
    NotAnObject,

    #[error("Invalid market data: {0}")]
    Malformed(String),

    #[error("Market title is required")]
    MissingTitle,

    #[error("{field} must be between 0 and 1, got {value}")]
    ProbabilityOutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be at most {max}, got {value}", max = MAX_COUNT)]
    CountOutOfRange { field: &'static str, value: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Prediction market not found: {0}")]
    NotFound(MarketId),

    #[error("Prediction market already exists: {0}")]
    Conflict(MarketId),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateId(id) => ServiceError::Conflict(id),
            other => ServiceError::Storage(other),
        }
    }
}

/// Validates creation requests, fills defaults and hands records to the store.
#[derive(Clone)]
pub struct MarketService {
    store: Arc<dyn MarketStore>,
}

impl MarketService {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    pub async fn list_all(&self) -> Result<Vec<Market>, ServiceError> {
        self.store.list_markets().await.map_err(|e| {
            error!("Error fetching prediction markets: {}", e);
            e.into()
        })
    }

    pub async fn get_one(&self, id: &MarketId) -> Result<Market, ServiceError> {
        match self.store.get_market(id).await {
            Ok(Some(market)) => Ok(market),
            Ok(None) => Err(ServiceError::NotFound(id.clone())),
            Err(e) => {
                error!("Error fetching prediction market {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    pub async fn count(&self) -> Result<usize, ServiceError> {
        self.store.count_markets().await.map_err(|e| {
            error!("Error counting prediction markets: {}", e);
            e.into()
        })
    }

    /// Create a market from a raw payload. `None` and JSON `null` both mean
    /// "no data".
    pub async fn create(&self, input: Option<Value>) -> Result<Market, ServiceError> {
        let market = normalize(input)?;

        match self.store.create_market(market).await {
            Ok(stored) => {
                info!("Created prediction market {} ({})", stored.id, stored.title);
                Ok(stored)
            }
            Err(StorageError::DuplicateId(id)) => {
                info!("Rejected duplicate prediction market {}", id);
                Err(ServiceError::Conflict(id))
            }
            Err(e) => {
                error!("Error creating prediction market: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Turn a raw payload into a complete record, applying schema defaults for
/// anything the client left out.
pub fn normalize(input: Option<Value>) -> Result<Market, ValidationError> {
    let value = match input {
        None | Some(Value::Null) => return Err(ValidationError::MissingPayload),
        Some(v @ Value::Object(_)) => v,
        Some(_) => return Err(ValidationError::NotAnObject),
    };

    let new: NewMarket =
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let title = new
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or(ValidationError::MissingTitle)?;

    check_probability("currentYesProbability", new.current_yes_probability)?;
    check_probability("currentNoProbability", new.current_no_probability)?;
    check_count("yesCount", new.yes_count)?;
    check_count("noCount", new.no_count)?;

    Ok(new.with_defaults(title))
}

// The two probabilities are not required to sum to 1.
fn check_probability(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(p) if !(0.0..=1.0).contains(&p) => {
            Err(ValidationError::ProbabilityOutOfRange { field, value: p })
        }
        _ => Ok(()),
    }
}

fn check_count(field: &'static str, value: Option<u64>) -> Result<(), ValidationError> {
    match value {
        Some(n) if n > MAX_COUNT => Err(ValidationError::CountOutOfRange { field, value: n }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::types::MarketStatus;
    use crate::storage::{ConnectionTarget, SnapshotStore, SqliteStore};
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    async fn snapshot_service() -> (MarketService, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("data.json"));
        store.initialize().await.unwrap();
        (MarketService::new(Arc::new(store)), dir)
    }

    async fn sqlite_service() -> MarketService {
        let store = SqliteStore::connect(&ConnectionTarget::Memory).unwrap();
        store.initialize().await.unwrap();
        MarketService::new(Arc::new(store))
    }

    #[test]
    fn test_normalize_applies_defaults() {
        let market = normalize(Some(json!({"title": "Will it rain?"}))).unwrap();

        assert!(!market.id.is_empty());
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.yes_count, 0);
        assert_eq!(market.no_count, 0);
        assert_eq!(market.current_yes_probability, 0.5);
        assert_eq!(market.current_no_probability, 0.5);
        assert!(market.tags.is_empty());
    }

    #[test]
    fn test_normalize_keeps_supplied_values() {
        let market = normalize(Some(json!({
            "id": 17,
            "title": "Closed already",
            "status": "closed",
            "createdAt": "2024-02-01T10:00:00.000Z",
            "yesCount": 4,
            "currentYesProbability": 0.8,
            "currentNoProbability": 0.8,
            "source": "import"
        })))
        .unwrap();

        assert_eq!(market.id.as_str(), "17");
        assert_eq!(market.status, MarketStatus::Closed);
        assert_eq!(market.created_at.to_rfc3339(), "2024-02-01T10:00:00+00:00");
        assert_eq!(market.yes_count, 4);
        // Probabilities that do not sum to 1 are accepted.
        assert_eq!(market.current_yes_probability, 0.8);
        assert_eq!(market.current_no_probability, 0.8);
        assert_eq!(market.extra.get("source"), Some(&json!("import")));
    }

    #[test]
    fn test_normalize_replaces_empty_id() {
        let market = normalize(Some(json!({"id": "", "title": "T"}))).unwrap();
        assert!(market.id.as_str().starts_with("market_"));
    }

    #[test]
    fn test_normalize_rejects_missing_payload() {
        assert!(matches!(normalize(None), Err(ValidationError::MissingPayload)));
        assert!(matches!(
            normalize(Some(Value::Null)),
            Err(ValidationError::MissingPayload)
        ));
    }

    #[test]
    fn test_normalize_rejects_bad_shapes() {
        assert!(matches!(
            normalize(Some(json!("title"))),
            Err(ValidationError::NotAnObject)
        ));
        assert!(matches!(
            normalize(Some(json!({"description": "no title"}))),
            Err(ValidationError::MissingTitle)
        ));
        assert!(matches!(
            normalize(Some(json!({"title": "   "}))),
            Err(ValidationError::MissingTitle)
        ));
        assert!(matches!(
            normalize(Some(json!({"title": "T", "yesCount": -1}))),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_probability_out_of_range() {
        let err = normalize(Some(json!({"title": "T", "currentNoProbability": 1.5}))).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ProbabilityOutOfRange { field: "currentNoProbability", .. }
        ));
    }

    #[test]
    fn test_normalize_keeps_unlisted_status() {
        let market = normalize(Some(json!({"title": "T", "status": "suspended"}))).unwrap();
        assert_eq!(market.status, MarketStatus::Other("suspended".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_count_rejected_on_every_backend() {
        let (snapshot, _dir) = snapshot_service().await;
        let sqlite = sqlite_service().await;

        for service in [snapshot, sqlite] {
            let err = service
                .create(Some(json!({"title": "T", "yesCount": u64::MAX})))
                .await
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    ServiceError::Validation(ValidationError::CountOutOfRange { field: "yesCount", .. })
                ),
                "{} accepted an oversized count",
                service.backend()
            );
            assert_eq!(service.count().await.unwrap(), 0);

            let largest = service
                .create(Some(json!({"title": "T", "noCount": MAX_COUNT})))
                .await
                .unwrap();
            assert_eq!(largest.no_count, MAX_COUNT);
        }
    }

    #[tokio::test]
    async fn test_create_assigns_unique_ids() {
        let (service, _dir) = snapshot_service().await;

        let mut ids = HashSet::new();
        for _ in 0..20 {
            let market = service
                .create(Some(json!({"title": "Will it rain?"})))
                .await
                .unwrap();
            assert!(ids.insert(market.id));
        }
    }

    #[tokio::test]
    async fn test_created_market_found_in_list() {
        let (service, _dir) = snapshot_service().await;

        let created = service
            .create(Some(json!({"title": "Will it rain?", "tags": ["weather"]})))
            .await
            .unwrap();

        let all = service.list_all().await.unwrap();
        assert!(all.contains(&created));
        assert_eq!(service.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_created_market_equals_fetched_sqlite() {
        let service = sqlite_service().await;

        let created = service
            .create(Some(json!({
                "title": "Will it rain?",
                "category": "weather",
                "tags": ["london"],
                "endTime": "2025-01-01T00:00:00Z"
            })))
            .await
            .unwrap();

        let fetched = service.get_one(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let service = sqlite_service().await;

        let err = service.get_one(&MarketId::new("nope")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_payload_persists_nothing() {
        let (service, _dir) = snapshot_service().await;

        let err = service.create(None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::MissingPayload)
        ));
        assert_eq!(service.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let service = sqlite_service().await;

        service
            .create(Some(json!({"id": "m1", "title": "First"})))
            .await
            .unwrap();
        let err = service
            .create(Some(json!({"id": "m1", "title": "Second"})))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
