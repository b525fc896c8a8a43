use async_trait::async_trait;
use shadowy_core::state::LedgerSnapshot;
use shadowy_core::{Block, Hash32};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("chain store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt chain store: {0}")]
    Corrupt(String),
}

/// Persistence seam for the chain: block kv store keyed by hash, a
/// height -> hash index describing the canonical chain, the tip row, and
/// the latest ledger snapshot. Only the chain-writer task mutates it.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn put_block(&self, block: &Block) -> Result<(), StorageError>;
    async fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StorageError>;
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError>;
    async fn set_canonical(&self, height: u64, hash: &Hash32) -> Result<(), StorageError>;
    async fn canonical_hash(&self, height: u64) -> Result<Option<Hash32>, StorageError>;
    async fn canonical_heights(&self) -> Result<Vec<u64>, StorageError>;
    async fn all_blocks(&self) -> Result<Vec<(Hash32, u64)>, StorageError>;
    async fn tip(&self) -> Result<Option<(u64, Hash32)>, StorageError>;
    async fn set_tip(&self, height: u64, hash: &Hash32) -> Result<(), StorageError>;
    async fn save_snapshot(
        &self,
        height: u64,
        snapshot: &LedgerSnapshot,
    ) -> Result<(), StorageError>;
    async fn load_snapshot(&self) -> Result<Option<(u64, LedgerSnapshot)>, StorageError>;
}

/// Retries an operation on transient database errors (lock contention,
/// pool exhaustion, interrupted i/o) with a short exponential backoff.
/// Anything else surfaces immediately.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    const MAX_RETRIES: u32 = 3;
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let transient = matches!(&error, StorageError::Database(db) if is_transient(db));
                if !transient || attempt >= MAX_RETRIES {
                    return Err(error);
                }
                attempt += 1;
                warn!(attempt, error = %error, "transient storage error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// SQLite-backed store living inside the configured blockchain directory.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(blockchain_directory: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(blockchain_directory)?;
        let db_path = blockchain_directory.join("chain.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path = %db_path.display(), "chain store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        // Schema kept in code; the store owns a single-file database.
        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks(
                hash TEXT PRIMARY KEY,
                height INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS blocks_by_height ON blocks(height)",
            "CREATE TABLE IF NOT EXISTS chain_index(
                height INTEGER PRIMARY KEY,
                hash TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS tip(
                id INTEGER PRIMARY KEY CHECK (id = 0),
                height INTEGER NOT NULL,
                hash TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ledger_snapshot(
                id INTEGER PRIMARY KEY CHECK (id = 0),
                height INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChainStore for SqliteStore {
    async fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO blocks(hash, height, data) VALUES ($1, $2, $3)
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(block.hash().to_hex())
        .bind(block.height() as i64)
        .bind(serde_json::to_string(block)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StorageError> {
        let row = sqlx::query("SELECT data FROM blocks WHERE hash = $1")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        let row = sqlx::query(
            "SELECT b.data FROM chain_index c JOIN blocks b ON b.hash = c.hash
             WHERE c.height = $1",
        )
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn set_canonical(&self, height: u64, hash: &Hash32) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO chain_index(height, hash) VALUES ($1, $2)
             ON CONFLICT (height) DO UPDATE SET hash = EXCLUDED.hash",
        )
        .bind(height as i64)
        .bind(hash.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn canonical_hash(&self, height: u64) -> Result<Option<Hash32>, StorageError> {
        let row = sqlx::query("SELECT hash FROM chain_index WHERE height = $1")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let hash: String = row.try_get("hash")?;
                Ok(Some(Hash32::from_str(&hash).map_err(|e| {
                    StorageError::Corrupt(format!("bad hash in chain index: {e}"))
                })?))
            }
            None => Ok(None),
        }
    }

    async fn canonical_heights(&self) -> Result<Vec<u64>, StorageError> {
        let rows = sqlx::query("SELECT height FROM chain_index ORDER BY height ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let h: i64 = row.try_get("height")?;
                Ok(h as u64)
            })
            .collect()
    }

    async fn all_blocks(&self) -> Result<Vec<(Hash32, u64)>, StorageError> {
        let rows = sqlx::query("SELECT hash, height FROM blocks ORDER BY height ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let hash: String = row.try_get("hash")?;
                let height: i64 = row.try_get("height")?;
                let hash = Hash32::from_str(&hash)
                    .map_err(|e| StorageError::Corrupt(format!("bad block key: {e}")))?;
                Ok((hash, height as u64))
            })
            .collect()
    }

    async fn tip(&self) -> Result<Option<(u64, Hash32)>, StorageError> {
        let row = sqlx::query("SELECT height, hash FROM tip WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let height: i64 = row.try_get("height")?;
                let hash: String = row.try_get("hash")?;
                let hash = Hash32::from_str(&hash)
                    .map_err(|e| StorageError::Corrupt(format!("bad tip hash: {e}")))?;
                Ok(Some((height as u64, hash)))
            }
            None => Ok(None),
        }
    }

    async fn set_tip(&self, height: u64, hash: &Hash32) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO tip(id, height, hash) VALUES (0, $1, $2)
             ON CONFLICT (id) DO UPDATE SET height = EXCLUDED.height, hash = EXCLUDED.hash",
        )
        .bind(height as i64)
        .bind(hash.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_snapshot(
        &self,
        height: u64,
        snapshot: &LedgerSnapshot,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ledger_snapshot(id, height, data) VALUES (0, $1, $2)
             ON CONFLICT (id) DO UPDATE SET height = EXCLUDED.height, data = EXCLUDED.data",
        )
        .bind(height as i64)
        .bind(serde_json::to_string(snapshot)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<(u64, LedgerSnapshot)>, StorageError> {
        let row = sqlx::query("SELECT height, data FROM ledger_snapshot WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let height: i64 = row.try_get("height")?;
                let data: String = row.try_get("data")?;
                Ok(Some((height as u64, serde_json::from_str(&data)?)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shadowy_core::{identifier_from_public_key, Address, LedgerState};

    fn genesis() -> Block {
        Block::genesis(
            "storage-test",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Address::from_identifier(&identifier_from_public_key(b"treasury")),
        )
    }

    #[tokio::test]
    async fn block_kv_and_index_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).await.unwrap();
        let block = genesis();
        let hash = block.hash();

        store.put_block(&block).await.unwrap();
        store.set_canonical(0, &hash).await.unwrap();
        store.set_tip(0, &hash).await.unwrap();

        assert_eq!(store.block_by_hash(&hash).await.unwrap().unwrap(), block);
        assert_eq!(store.block_by_height(0).await.unwrap().unwrap(), block);
        assert_eq!(store.canonical_hash(0).await.unwrap(), Some(hash));
        assert_eq!(store.tip().await.unwrap(), Some((0, hash)));
        assert!(store.block_by_height(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_block_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).await.unwrap();
        let block = genesis();
        store.put_block(&block).await.unwrap();
        store.put_block(&block).await.unwrap();
        assert_eq!(store.all_blocks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).await.unwrap();
        assert!(store.load_snapshot().await.unwrap().is_none());

        let state = LedgerState::default();
        store.save_snapshot(5, &state.snapshot()).await.unwrap();
        let (height, snap) = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(height, 5);
        assert_eq!(
            LedgerState::from_snapshot(snap).state_hash(),
            state.state_hash()
        );
    }

    #[tokio::test]
    async fn backoff_retries_transient_then_succeeds() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_backoff(|| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                    Err(StorageError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_surfaces_persistent_errors() {
        let result: Result<(), _> = with_backoff(|| async {
            Err(StorageError::Corrupt("wedged".into()))
        })
        .await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let block = genesis();
        {
            let store = SqliteStore::open(dir.path()).await.unwrap();
            store.put_block(&block).await.unwrap();
            store.set_tip(0, &block.hash()).await.unwrap();
        }
        let store = SqliteStore::open(dir.path()).await.unwrap();
        assert_eq!(store.tip().await.unwrap(), Some((0, block.hash())));
    }
}
