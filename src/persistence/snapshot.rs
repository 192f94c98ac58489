//! Snapshot persistence
//!
//! One versioned JSON document per symbol. Writes go to a temp file in
//! the same directory, get flushed to disk, then rename over the
//! destination — the on-disk file is always either the previous or the
//! new complete snapshot, even under kill. Every snapshot is restored on
//! startup before normal event processing begins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::domain::SymbolState;
use crate::error::{PylonError, Result};

/// Bumped whenever the snapshot layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Self-contained on-disk document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDoc {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: SymbolState,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Deterministic snapshot path for a symbol
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_symbol(symbol)))
    }

    /// Persist the state atomically: temp file, fsync, rename.
    pub async fn save(&self, state: &SymbolState) -> Result<()> {
        let doc = SnapshotDoc {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let dest = self.path_for(state.symbol());
        let tmp = self
            .dir
            .join(format!(".{}.json.tmp", sanitize_symbol(state.symbol())));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &dest).await?;
        debug!("{}: snapshot saved ({} bytes)", state.symbol(), bytes.len());
        Ok(())
    }

    /// Load one symbol's snapshot, if present.
    pub async fn load(&self, symbol: &str) -> Result<Option<SymbolState>> {
        let path = self.path_for(symbol);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(parse_doc(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every snapshot in the directory. A file that fails to parse
    /// is logged and skipped so one bad symbol cannot block recovery of
    /// the rest; it is left on disk for inspection.
    pub async fn load_all(&self) -> Result<Vec<SymbolState>> {
        let mut states = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Leftover temp files are not snapshots
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
            {
                continue;
            }

            match fs::read(&path).await {
                Ok(bytes) => match parse_doc(&bytes) {
                    Ok(state) => {
                        info!("{}: snapshot restored ({})", state.symbol(), state.phase());
                        states.push(state);
                    }
                    Err(e) => {
                        error!("skipping unreadable snapshot {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    warn!("could not read snapshot {:?}: {}", path, e);
                }
            }
        }

        Ok(states)
    }

    /// Remove a symbol's snapshot (shutdown of a decommissioned symbol).
    pub async fn remove(&self, symbol: &str) -> Result<()> {
        let path = self.path_for(symbol);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_doc(bytes: &[u8]) -> Result<SymbolState> {
    let doc: SnapshotDoc = serde_json::from_slice(bytes)?;
    if doc.version != SNAPSHOT_VERSION {
        return Err(PylonError::SnapshotVersion {
            found: doc.version,
            expected: SNAPSHOT_VERSION,
        });
    }
    Ok(doc.state)
}

/// Symbols like "BTC/USD" must map to safe file names
fn sanitize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderContext, OrderSide, Phase, PositionInfo, ProtectionKind, ProtectionState};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn temp_store_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pylon-snap-test-{}", Uuid::new_v4()))
    }

    fn full_state() -> SymbolState {
        let mut state = SymbolState::new("BTC/USD");
        state.set_phase(Phase::WaitFill);
        let mut ctx = OrderContext::new("coid-1", OrderSide::Buy, dec!(2));
        ctx.order_id = Some("o-1".into());
        ctx.cumulative_filled_qty = dec!(0.5);
        ctx.avg_fill_price = Some(dec!(100));
        state.buy_order = Some(ctx);
        state.position = Some(PositionInfo {
            qty: dec!(0.5),
            avg_entry_price: dec!(100),
            entry_fees: dec!(0.05),
            opened_at: Utc::now(),
        });
        state.protection = Some(ProtectionState::Active {
            kind: ProtectionKind::StopLoss,
            order_id: "prot-1".into(),
            trigger_price: dec!(98),
        });
        state.transition_seq = 17;
        state
    }

    #[tokio::test]
    async fn round_trip_preserves_state() {
        let dir = temp_store_dir();
        let store = SnapshotStore::new(&dir).await.unwrap();
        let state = full_state();

        store.save(&state).await.unwrap();
        let restored = store.load("BTC/USD").await.unwrap().unwrap();

        assert_eq!(restored.phase(), state.phase());
        assert_eq!(restored.symbol(), state.symbol());
        assert_eq!(restored.transition_seq, state.transition_seq);
        assert_eq!(
            restored.buy_order.as_ref().unwrap().order_id,
            state.buy_order.as_ref().unwrap().order_id
        );
        assert_eq!(restored.position, state.position);
        assert_eq!(restored.protection, state.protection);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let dir = temp_store_dir();
        let store = SnapshotStore::new(&dir).await.unwrap();
        assert!(store.load("ETH-USD").await.unwrap().is_none());
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn save_overwrites_atomically() {
        let dir = temp_store_dir();
        let store = SnapshotStore::new(&dir).await.unwrap();

        let mut state = full_state();
        store.save(&state).await.unwrap();
        state.set_phase(Phase::Position);
        store.save(&state).await.unwrap();

        let restored = store.load("BTC/USD").await.unwrap().unwrap();
        assert_eq!(restored.phase(), Phase::Position);

        // No temp file remains
        let mut entries = fs::read_dir(&dir).await.unwrap();
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
            count += 1;
        }
        assert_eq!(count, 1);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn load_all_skips_corrupt_files() {
        let dir = temp_store_dir();
        let store = SnapshotStore::new(&dir).await.unwrap();
        store.save(&full_state()).await.unwrap();

        fs::write(dir.join("corrupt.json"), b"{not json").await.unwrap();

        let states = store.load_all().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].symbol(), "BTC/USD");

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let dir = temp_store_dir();
        let store = SnapshotStore::new(&dir).await.unwrap();
        store.save(&full_state()).await.unwrap();

        let path = store.path_for("BTC/USD");
        let text = fs::read_to_string(&path).await.unwrap();
        let bumped = text.replace("\"version\": 1", "\"version\": 99");
        fs::write(&path, bumped).await.unwrap();

        assert!(store.load("BTC/USD").await.is_err());
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn symbol_sanitization() {
        assert_eq!(sanitize_symbol("BTC/USD"), "BTC_USD");
        assert_eq!(sanitize_symbol("BTC-USD"), "BTC-USD");
        assert_eq!(sanitize_symbol("btc..usd"), "btc__usd");
    }
}
