use crate::errors::{Result, SyncError};
use crate::models::EntityKey;
use crate::service::BlobStore;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// One asset recorded in the side-cache.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryEntry {
    pub type_name: String,
    pub qualified_name: String,
    pub connection_qualified_name: Option<String>,
    pub name: Option<String>,
    pub order_hint: Option<i64>,
    pub tenant: String,
}

impl InventoryEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.type_name, &self.qualified_name)
    }
}

/// Local SQLite file remembering which assets a container has published.
pub struct AssetInventory {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl AssetInventory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let inventory = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };
        inventory.initialize_schema()?;
        Ok(inventory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Other(anyhow::anyhow!("side-cache connection poisoned")))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS assets (
                type_name TEXT NOT NULL,
                qualified_name TEXT NOT NULL,
                connection_qualified_name TEXT,
                name TEXT,
                order_hint INTEGER,
                tenant TEXT NOT NULL,
                PRIMARY KEY (type_name, qualified_name)
            );
            CREATE INDEX IF NOT EXISTS idx_assets_connection
                ON assets (connection_qualified_name);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn upsert(&self, entries: &[InventoryEntry]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO assets
                    (type_name, qualified_name, connection_qualified_name, name, order_hint, tenant)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.type_name,
                    entry.qualified_name,
                    entry.connection_qualified_name,
                    entry.name,
                    entry.order_hint,
                    entry.tenant,
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Returns the number of rows actually removed.
    pub fn delete(&self, keys: &[EntityKey]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt =
                tx.prepare("DELETE FROM assets WHERE type_name = ?1 AND qualified_name = ?2")?;
            for key in keys {
                removed += stmt.execute(params![key.type_name, key.qualified_name])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn get(&self, key: &EntityKey) -> Result<Option<InventoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT type_name, qualified_name, connection_qualified_name, name, order_hint, tenant
             FROM assets WHERE type_name = ?1 AND qualified_name = ?2",
        )?;
        let mut rows = stmt.query(params![key.type_name, key.qualified_name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(entry_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_all(&self) -> Result<Vec<InventoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT type_name, qualified_name, connection_qualified_name, name, order_hint, tenant
             FROM assets ORDER BY type_name, qualified_name",
        )?;
        let entries = stmt
            .query_map([], |row| entry_from_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn list_by_connection(&self, connection_qualified_name: &str) -> Result<Vec<InventoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT type_name, qualified_name, connection_qualified_name, name, order_hint, tenant
             FROM assets WHERE connection_qualified_name = ?1 ORDER BY type_name, qualified_name",
        )?;
        let entries = stmt
            .query_map(params![connection_qualified_name], |row| entry_from_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Downloads the shared copy, applies the changes and uploads it again.
    ///
    /// A missing remote copy starts an empty inventory at `local_path`.
    pub async fn sync_with_blob(
        store: &dyn BlobStore,
        remote_key: &str,
        local_path: &Path,
        adds: &[InventoryEntry],
        removes: &[EntityKey],
    ) -> Result<AssetInventory> {
        if !store.download(remote_key, local_path).await? {
            log::info!("No side-cache at '{}' yet, starting empty", remote_key);
            if local_path.exists() {
                tokio::fs::remove_file(local_path).await?;
            }
        }
        let inventory = AssetInventory::open(local_path)?;
        let removed = inventory.delete(removes)?;
        let added = inventory.upsert(adds)?;
        store.upload(local_path, remote_key).await?;
        log::info!(
            "Side-cache '{}': {} upserted, {} removed, {} total",
            remote_key,
            added,
            removed,
            inventory.len()?
        );
        Ok(inventory)
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryEntry> {
    Ok(InventoryEntry {
        type_name: row.get(0)?,
        qualified_name: row.get(1)?,
        connection_qualified_name: row.get(2)?,
        name: row.get(3)?,
        order_hint: row.get(4)?,
        tenant: row.get(5)?,
    })
}
