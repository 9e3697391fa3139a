use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions, sqlite::SqliteRow};
use thiserror::Error;
use tokio::sync::Mutex;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMapping {
    pub relative_path: String,
    pub remote_folder_id: String,
}

/// Last known local attributes of a file that was uploaded successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedItem {
    pub relative_path: String,
    pub remote_id: Option<String>,
    pub local_size: u64,
    pub local_modified_time: f64,
    pub remote_checksum: Option<String>,
}

impl ProcessedItem {
    /// Unchanged means identical size and bit-identical modification time.
    pub fn matches(&self, size: u64, modified_time: f64) -> bool {
        self.local_size == size && self.local_modified_time.to_bits() == modified_time.to_bits()
    }
}

/// Durable record of folder mappings and processed files, keyed by relative path.
///
/// Writes are upserts: a second write for the same path replaces the first.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_folder_mapping(
        &self,
        relative_path: &str,
    ) -> Result<Option<FolderMapping>, StateError>;

    async fn put_folder_mapping(&self, mapping: &FolderMapping) -> Result<(), StateError>;

    async fn get_processed_item(
        &self,
        relative_path: &str,
    ) -> Result<Option<ProcessedItem>, StateError>;

    async fn put_processed_item(&self, item: &ProcessedItem) -> Result<(), StateError>;

    async fn delete_processed_item(&self, relative_path: &str) -> Result<(), StateError>;

    async fn list_all_processed_items(&self) -> Result<Vec<ProcessedItem>, StateError>;

    async fn list_all_folder_mappings(&self) -> Result<Vec<FolderMapping>, StateError>;
}

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn processed_item_from_row(row: &SqliteRow) -> Result<ProcessedItem, StateError> {
    let local_size: i64 = row.try_get("local_size")?;
    Ok(ProcessedItem {
        relative_path: row.try_get("relative_path")?,
        remote_id: row.try_get("remote_id")?,
        local_size: u64::try_from(local_size).unwrap_or_default(),
        local_modified_time: row.try_get("local_modified_time")?,
        remote_checksum: row.try_get("remote_checksum")?,
    })
}

fn folder_mapping_from_row(row: &SqliteRow) -> Result<FolderMapping, StateError> {
    Ok(FolderMapping {
        relative_path: row.try_get("relative_path")?,
        remote_folder_id: row.try_get("remote_folder_id")?,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_folder_mapping(
        &self,
        relative_path: &str,
    ) -> Result<Option<FolderMapping>, StateError> {
        let row = sqlx::query(
            "SELECT relative_path, remote_folder_id FROM folder_mappings WHERE relative_path = ?1",
        )
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_mapping_from_row).transpose()
    }

    async fn put_folder_mapping(&self, mapping: &FolderMapping) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO folder_mappings (relative_path, remote_folder_id)
             VALUES (?1, ?2)
             ON CONFLICT(relative_path) DO UPDATE SET
                 remote_folder_id = excluded.remote_folder_id",
        )
        .bind(&mapping.relative_path)
        .bind(&mapping.remote_folder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_processed_item(
        &self,
        relative_path: &str,
    ) -> Result<Option<ProcessedItem>, StateError> {
        let row = sqlx::query(
            "SELECT relative_path, remote_id, local_size, local_modified_time, remote_checksum
             FROM processed_items WHERE relative_path = ?1",
        )
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(processed_item_from_row).transpose()
    }

    async fn put_processed_item(&self, item: &ProcessedItem) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO processed_items
                 (relative_path, remote_id, local_size, local_modified_time, remote_checksum)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(relative_path) DO UPDATE SET
                 remote_id = excluded.remote_id,
                 local_size = excluded.local_size,
                 local_modified_time = excluded.local_modified_time,
                 remote_checksum = excluded.remote_checksum",
        )
        .bind(&item.relative_path)
        .bind(&item.remote_id)
        .bind(i64::try_from(item.local_size).unwrap_or(i64::MAX))
        .bind(item.local_modified_time)
        .bind(&item.remote_checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_processed_item(&self, relative_path: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM processed_items WHERE relative_path = ?1")
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_all_processed_items(&self) -> Result<Vec<ProcessedItem>, StateError> {
        let rows = sqlx::query(
            "SELECT relative_path, remote_id, local_size, local_modified_time, remote_checksum
             FROM processed_items ORDER BY relative_path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(processed_item_from_row).collect()
    }

    async fn list_all_folder_mappings(&self) -> Result<Vec<FolderMapping>, StateError> {
        let rows = sqlx::query(
            "SELECT relative_path, remote_folder_id FROM folder_mappings ORDER BY relative_path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_mapping_from_row).collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryTables {
    pub folder_mappings: BTreeMap<String, FolderMapping>,
    pub processed_items: BTreeMap<String, ProcessedItem>,
}

/// Non-durable store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_folder_mapping(
        &self,
        relative_path: &str,
    ) -> Result<Option<FolderMapping>, StateError> {
        Ok(self
            .tables
            .lock()
            .await
            .folder_mappings
            .get(relative_path)
            .cloned())
    }

    async fn put_folder_mapping(&self, mapping: &FolderMapping) -> Result<(), StateError> {
        self.tables
            .lock()
            .await
            .folder_mappings
            .insert(mapping.relative_path.clone(), mapping.clone());
        Ok(())
    }

    async fn get_processed_item(
        &self,
        relative_path: &str,
    ) -> Result<Option<ProcessedItem>, StateError> {
        Ok(self
            .tables
            .lock()
            .await
            .processed_items
            .get(relative_path)
            .cloned())
    }

    async fn put_processed_item(&self, item: &ProcessedItem) -> Result<(), StateError> {
        self.tables
            .lock()
            .await
            .processed_items
            .insert(item.relative_path.clone(), item.clone());
        Ok(())
    }

    async fn delete_processed_item(&self, relative_path: &str) -> Result<(), StateError> {
        self.tables
            .lock()
            .await
            .processed_items
            .remove(relative_path);
        Ok(())
    }

    async fn list_all_processed_items(&self) -> Result<Vec<ProcessedItem>, StateError> {
        Ok(self
            .tables
            .lock()
            .await
            .processed_items
            .values()
            .cloned()
            .collect())
    }

    async fn list_all_folder_mappings(&self) -> Result<Vec<FolderMapping>, StateError> {
        Ok(self
            .tables
            .lock()
            .await
            .folder_mappings
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
