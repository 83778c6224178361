use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Status assigned when a payload does not carry one.
pub const DEFAULT_STATUS: MarketStatus = MarketStatus::Open;
/// Starting value for `yesCount` / `noCount`.
pub const DEFAULT_COUNT: u64 = 0;
/// Starting value for both outcome probabilities.
pub const DEFAULT_PROBABILITY: f64 = 0.5;
/// Largest counter value every backend can hold (SQLite INTEGER is signed 64-bit).
pub const MAX_COUNT: u64 = i64::MAX as u64;

/// Prefix of server-generated market ids.
pub const ID_PREFIX: &str = "market_";

/// Opaque market identifier.
///
/// Clients may send either a string or an integer; both are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MarketId(String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh time-ordered id (`market_<uuid v7>`).
    pub fn generate() -> Self {
        Self(format!("{}{}", ID_PREFIX, uuid::Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MarketId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Int(i64),
            Uint(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => MarketId(s),
            RawId::Int(n) => MarketId(n.to_string()),
            RawId::Uint(n) => MarketId(n.to_string()),
        })
    }
}

/// Lifecycle label of a market. Values outside the known set are kept as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
    Cancelled,
    Other(String),
}

impl MarketStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Cancelled => "cancelled",
            MarketStatus::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => MarketStatus::Open,
            "closed" => MarketStatus::Closed,
            "resolved" => MarketStatus::Resolved,
            "cancelled" => MarketStatus::Cancelled,
            other => MarketStatus::Other(other.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl Serialize for MarketStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MarketStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MarketStatus::parse(&s))
    }
}

impl Default for MarketStatus {
    fn default() -> Self {
        DEFAULT_STATUS
    }
}

/// A stored prediction market.
///
/// Every field the schema knows about is typed; anything else the client sent
/// travels along in `extra` and is returned untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: MarketId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: MarketStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub yes_count: u64,
    #[serde(default)]
    pub no_count: u64,
    #[serde(default = "default_probability")]
    pub current_yes_probability: f64,
    #[serde(default = "default_probability")]
    pub current_no_probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_probability() -> f64 {
    DEFAULT_PROBABILITY
}

/// Creation payload as received from a client. Nothing is required at this
/// level; the service decides what is missing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMarket {
    #[serde(default)]
    pub id: Option<MarketId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<MarketStatus>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub yes_count: Option<u64>,
    #[serde(default)]
    pub no_count: Option<u64>,
    #[serde(default)]
    pub current_yes_probability: Option<f64>,
    #[serde(default)]
    pub current_no_probability: Option<f64>,
    #[serde(default)]
    pub resolution_source: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewMarket {
    /// Fill every field the payload left out with its schema default.
    /// Values that are present are taken as-is.
    pub fn with_defaults(self, title: String) -> Market {
        Market {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(MarketId::generate),
            title,
            description: self.description,
            category: self.category,
            tags: self.tags.unwrap_or_default(),
            status: self.status.filter(|s| !s.is_blank()).unwrap_or(DEFAULT_STATUS),
            created_at: self.created_at.unwrap_or_else(|| Utc::now().trunc_subsecs(3)),
            start_time: self.start_time,
            end_time: self.end_time,
            resolution_time: self.resolution_time,
            yes_count: self.yes_count.unwrap_or(DEFAULT_COUNT),
            no_count: self.no_count.unwrap_or(DEFAULT_COUNT),
            current_yes_probability: self.current_yes_probability.unwrap_or(DEFAULT_PROBABILITY),
            current_no_probability: self.current_no_probability.unwrap_or(DEFAULT_PROBABILITY),
            resolution_source: self.resolution_source,
            external_id: self.external_id,
            extra: self.extra,
        }
    }
}

/// Relational layout of the `prediction_markets` table. Defaults come from the
/// constants above so rows and in-memory records agree.
pub fn create_table_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS prediction_markets (
            id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT '{status}',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            start_time TEXT,
            end_time TEXT,
            resolution_time TEXT,
            yes_count INTEGER NOT NULL DEFAULT {count},
            no_count INTEGER NOT NULL DEFAULT {count},
            current_yes_probability REAL NOT NULL DEFAULT {prob},
            current_no_probability REAL NOT NULL DEFAULT {prob},
            resolution_source TEXT,
            external_id TEXT,
            extra TEXT NOT NULL DEFAULT '{{}}'
        );

        CREATE INDEX IF NOT EXISTS idx_prediction_markets_created_at ON prediction_markets(created_at);
        "#,
        status = DEFAULT_STATUS.as_str(),
        count = DEFAULT_COUNT,
        prob = DEFAULT_PROBABILITY,
    )
}
