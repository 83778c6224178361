use async_trait::async_trait;
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{newest_first, MarketStore, StorageError};
use crate::markets::types::{Market, MarketId, NewMarket};

/// In-memory market list backed by a JSON array file.
///
/// The list and the file only change together, under one lock: every insert
/// rewrites the whole file before the lock is released.
pub struct SnapshotStore {
    path: PathBuf,
    state: Mutex<SnapshotState>,
}

#[derive(Default)]
struct SnapshotState {
    /// Insertion order, as written to the file.
    markets: Vec<Market>,
    loaded: bool,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// Read the snapshot record by record. Only a file that is not a JSON
    /// array at all is an error; single bad records are reported in the result.
    async fn load(&self) -> anyhow::Result<Loaded> {
        let contents = fs::read_to_string(&self.path).await?;
        let records: Vec<Value> = serde_json::from_str(&contents)?;

        let mut loaded = Loaded::default();
        for (index, record) in records.into_iter().enumerate() {
            match restore(record) {
                Ok((market, repaired)) => {
                    if repaired {
                        warn!("Filled in defaults for snapshot record {} ({})", index, market.id);
                        loaded.repaired += 1;
                    }
                    loaded.markets.push(market);
                }
                Err(e) => {
                    error!("Skipping unreadable snapshot record {}: {}", index, e);
                    loaded.skipped += 1;
                }
            }
        }
        Ok(loaded)
    }

    /// Write the full collection to a sibling temp file, then rename it over
    /// the snapshot so readers never see a half-written file.
    async fn persist(&self, markets: &[Market]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(markets)?;
        let tmp = sibling(&self.path, ".tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!("Saved {} prediction markets to {}", markets.len(), self.path.display());
        Ok(())
    }

    /// Move an unreadable snapshot out of the way so the next write cannot
    /// overwrite it.
    async fn set_aside_unreadable(&self) -> Result<(), StorageError> {
        let target = sibling(&self.path, ".corrupt");
        fs::rename(&self.path, &target).await.map_err(|e| {
            StorageError::Init(format!(
                "cannot move unreadable snapshot to {}: {}",
                target.display(),
                e
            ))
        })?;
        warn!("Moved unreadable snapshot to {}", target.display());
        Ok(())
    }

    /// Keep a copy of a snapshot whose records were partly skipped before the
    /// cleaned-up list replaces it.
    async fn back_up_partial(&self) -> Result<(), StorageError> {
        let target = sibling(&self.path, ".corrupt");
        fs::copy(&self.path, &target).await.map_err(|e| {
            StorageError::Init(format!("cannot back up snapshot to {}: {}", target.display(), e))
        })?;
        warn!("Copied original snapshot to {}", target.display());
        Ok(())
    }
}

#[derive(Default)]
struct Loaded {
    markets: Vec<Market>,
    repaired: usize,
    skipped: usize,
}

/// Turn one stored record back into a market. Records written by older
/// deployments may lack fields a market now requires; those get the same
/// defaults a new market would. The flag reports whether that happened.
fn restore(record: Value) -> Result<(Market, bool), serde_json::Error> {
    if let Ok(market) = serde_json::from_value::<Market>(record.clone()) {
        return Ok((market, false));
    }

    let legacy: NewMarket = serde_json::from_value(record)?;
    let title = legacy.title.clone().unwrap_or_default();
    Ok((legacy.with_defaults(title), true))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl MarketStore for SnapshotStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.loaded {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Init(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| StorageError::Init(format!("cannot access {}: {}", self.path.display(), e)))?;

        if exists {
            match self.load().await {
                Ok(loaded) => {
                    info!(
                        "Loaded {} prediction markets from {}",
                        loaded.markets.len(),
                        self.path.display()
                    );
                    if loaded.skipped > 0 {
                        self.back_up_partial().await?;
                    }
                    // Rewrite so repaired records keep the ids given to them now.
                    if loaded.skipped > 0 || loaded.repaired > 0 {
                        self.persist(&loaded.markets).await.map_err(|e| {
                            StorageError::Init(format!(
                                "cannot rewrite {}: {:#}",
                                self.path.display(),
                                e
                            ))
                        })?;
                    }
                    state.markets = loaded.markets;
                }
                Err(e) => {
                    error!("Error loading snapshot {}: {:#}", self.path.display(), e);
                    self.set_aside_unreadable().await?;
                    state.markets.clear();
                }
            }
        }

        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            self.persist(&state.markets).await.map_err(|e| {
                StorageError::Init(format!("cannot create {}: {:#}", self.path.display(), e))
            })?;
        }

        state.loaded = true;
        Ok(())
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StorageError> {
        let state = self.state.lock().await;
        if !state.loaded {
            return Err(StorageError::Read("snapshot store not initialized".to_string()));
        }
        Ok(newest_first(&state.markets))
    }

    async fn get_market(&self, id: &MarketId) -> Result<Option<Market>, StorageError> {
        let state = self.state.lock().await;
        if !state.loaded {
            return Err(StorageError::Read("snapshot store not initialized".to_string()));
        }
        Ok(state.markets.iter().find(|m| &m.id == id).cloned())
    }

    async fn create_market(&self, market: Market) -> Result<Market, StorageError> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            return Err(StorageError::Write("snapshot store not initialized".to_string()));
        }
        if state.markets.iter().any(|m| m.id == market.id) {
            return Err(StorageError::DuplicateId(market.id));
        }

        state.markets.push(market.clone());
        if let Err(e) = self.persist(&state.markets).await {
            state.markets.pop();
            return Err(StorageError::Write(format!(
                "snapshot {} not saved: {:#}",
                self.path.display(),
                e
            )));
        }

        Ok(market)
    }

    async fn count_markets(&self) -> Result<usize, StorageError> {
        let state = self.state.lock().await;
        if !state.loaded {
            return Err(StorageError::Read("snapshot store not initialized".to_string()));
        }
        Ok(state.markets.len())
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}
