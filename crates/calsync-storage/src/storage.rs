use crate::StorageError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use calsync_core::IdMap;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

const KEY_LAST_SYNC_TIME: &str = "last_sync_time";
const KEY_OBFUSCATION_SALT: &str = "obfuscation_salt";
const KEY_ENCRYPTED_REFRESH_TOKEN: &str = "encrypted_refresh_token";
const SALT_LEN: usize = 16;

/// Owns the sqlite-backed persisted state named in spec.md §6: the
/// `IdMap`, `lastSyncTime`, the per-install obfuscation salt, and the
/// encrypted refresh token blob. Settings (the non-secret toggles) are
/// `calsync-config`'s concern; this crate holds only what the sync run
/// itself writes, matching the teacher's `Storage` (sqlx pool + migrations)
/// shape reduced to this system's much smaller persisted surface.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Loads the full `IdMap` (spec.md §3). Returns an empty map on a
    /// fresh install.
    pub async fn load_id_map(&self) -> Result<IdMap, StorageError> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT task_id, event_id FROM id_map")
            .fetch_all(&self.pool)
            .await?;

        let mut id_map = IdMap::new();
        for (task_id, event_id) in rows {
            id_map.insert(task_id, event_id);
        }
        Ok(id_map)
    }

    /// Replaces the persisted `IdMap` wholesale with the result processor's
    /// updated copy at the end of a run (spec.md §5: "IdMap ... persisted
    /// only at run end").
    pub async fn save_id_map(&self, id_map: &IdMap) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM id_map").execute(&mut *tx).await?;
        for (task_id, event_id) in id_map.iter() {
            sqlx::query("INSERT INTO id_map (task_id, event_id) VALUES (?1, ?2)")
                .bind(task_id)
                .bind(event_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `force-reset-sync` (spec.md §6): clears the `IdMap` and
    /// `lastSyncTime` without touching credentials.
    pub async fn clear_id_map(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM id_map").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn load_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let value = self.load_state_value(KEY_LAST_SYNC_TIME).await?;
        Ok(value.and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok().map(|dt| dt.with_timezone(&Utc))))
    }

    pub async fn save_last_sync_time(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.save_state_value(KEY_LAST_SYNC_TIME, &at.to_rfc3339()).await
    }

    pub async fn clear_last_sync_time(&self) -> Result<(), StorageError> {
        self.delete_state_value(KEY_LAST_SYNC_TIME).await
    }

    /// Returns the per-install salt used by `calsync-security::token_store`
    /// (spec.md §4.8), generating and persisting a fresh one on first use.
    pub async fn obfuscation_salt(&self) -> Result<Vec<u8>, StorageError> {
        if let Some(encoded) = self.load_state_value(KEY_OBFUSCATION_SALT).await? {
            return BASE64
                .decode(encoded)
                .map_err(|err| StorageError::Data(format!("corrupt obfuscation salt: {err}")));
        }

        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        self.save_state_value(KEY_OBFUSCATION_SALT, &BASE64.encode(&salt)).await?;
        Ok(salt)
    }

    /// The only persisted secret (spec.md §3): the refresh token, already
    /// encrypted by `calsync-security::token_store` before it reaches this
    /// layer. `None` clears the stored value (used by `revoke`).
    pub async fn load_encrypted_refresh_token(&self) -> Result<Option<String>, StorageError> {
        self.load_state_value(KEY_ENCRYPTED_REFRESH_TOKEN).await
    }

    pub async fn save_encrypted_refresh_token(&self, encoded: Option<&str>) -> Result<(), StorageError> {
        match encoded {
            Some(encoded) => self.save_state_value(KEY_ENCRYPTED_REFRESH_TOKEN, encoded).await,
            None => self.delete_state_value(KEY_ENCRYPTED_REFRESH_TOKEN).await,
        }
    }

    async fn load_state_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn save_state_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_state_value(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::connect(&dir.path().join("calsync.sqlite3"))
            .await
            .expect("connects");
        (dir, storage)
    }

    #[tokio::test]
    async fn id_map_round_trips() {
        let (_dir, storage) = storage().await;
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        id_map.insert("t2", "e2");
        storage.save_id_map(&id_map).await.expect("saves");

        let loaded = storage.load_id_map().await.expect("loads");
        assert_eq!(loaded.get("t1"), Some("e1"));
        assert_eq!(loaded.get("t2"), Some("e2"));
    }

    #[tokio::test]
    async fn save_id_map_replaces_prior_contents() {
        let (_dir, storage) = storage().await;
        let mut first = IdMap::new();
        first.insert("t1", "e1");
        storage.save_id_map(&first).await.expect("saves first");

        let mut second = IdMap::new();
        second.insert("t2", "e2");
        storage.save_id_map(&second).await.expect("saves second");

        let loaded = storage.load_id_map().await.expect("loads");
        assert_eq!(loaded.get("t1"), None);
        assert_eq!(loaded.get("t2"), Some("e2"));
    }

    #[tokio::test]
    async fn force_reset_clears_id_map_and_last_sync_time() {
        let (_dir, storage) = storage().await;
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        storage.save_id_map(&id_map).await.expect("saves");
        storage.save_last_sync_time(Utc::now()).await.expect("saves time");

        storage.clear_id_map().await.expect("clears map");
        storage.clear_last_sync_time().await.expect("clears time");

        assert!(storage.load_id_map().await.expect("loads").iter().next().is_none());
        assert!(storage.load_last_sync_time().await.expect("loads").is_none());
    }

    #[tokio::test]
    async fn obfuscation_salt_is_generated_once_and_persists() {
        let (_dir, storage) = storage().await;
        let first = storage.obfuscation_salt().await.expect("generates");
        let second = storage.obfuscation_salt().await.expect("reloads");
        assert_eq!(first, second);
        assert_eq!(first.len(), SALT_LEN);
    }

    #[tokio::test]
    async fn encrypted_refresh_token_clears_on_none() {
        let (_dir, storage) = storage().await;
        storage
            .save_encrypted_refresh_token(Some("obf1:abc"))
            .await
            .expect("saves");
        assert_eq!(
            storage.load_encrypted_refresh_token().await.expect("loads").as_deref(),
            Some("obf1:abc")
        );

        storage.save_encrypted_refresh_token(None).await.expect("clears");
        assert_eq!(storage.load_encrypted_refresh_token().await.expect("loads"), None);
    }
}
