use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;

use super::KeyValueStore;
use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageResult,
};
use super::feed::{ChangeFeed, StoreChange};

/// SQLite-backed key-value store. One row per key in `kv_entries`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
    feed: ChangeFeed,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite store opened");

        Ok(Self {
            pool,
            database_url,
            feed: ChangeFeed::default(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // The store trait is sync, so each call runs on its own worker thread and
        // current-thread runtime; blocking inside the caller's runtime would panic.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-kv-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-kv-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-kv-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let database_url = self.database_url.clone();
        let key = key.to_string();
        self.run_db_call("kv-get", async move {
            let mut connection = connect_store_connection(&database_url, "kv-get-connect").await?;
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "kv-get-select",
                })
        })
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let owned_key = key.to_string();
        let value = value.to_string();
        self.run_db_call("kv-set", async move {
            let mut connection = connect_store_connection(&database_url, "kv-set-connect").await?;
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(owned_key)
            .bind(value)
            .bind(unix_timestamp_seconds())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "kv-set-upsert",
            })?;
            Ok(())
        })?;

        self.feed.publish(StoreChange::written(key));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let owned_key = key.to_string();
        let removed_rows = self.run_db_call("kv-remove", async move {
            let mut connection =
                connect_store_connection(&database_url, "kv-remove-connect").await?;
            let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(owned_key)
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "kv-remove-delete",
                })?;
            Ok(result.rows_affected())
        })?;

        if removed_rows > 0 {
            self.feed.publish(StoreChange::removed(key));
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let database_url = self.database_url.clone();
        self.run_db_call("kv-keys", async move {
            let mut connection = connect_store_connection(&database_url, "kv-keys-connect").await?;
            sqlx::query_scalar::<_, String>("SELECT key FROM kv_entries ORDER BY key")
                .fetch_all(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "kv-keys-select",
                })
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.feed.subscribe()
    }
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-kv-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeKind, JsonStoreExt};

    async fn open_temp_store() -> (tempfile::TempDir, SqliteStore) {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested").join("store.db");
        let store = SqliteStore::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open sqlite store");
        (directory, store)
    }

    #[tokio::test]
    async fn set_get_overwrite_and_remove() {
        let (_directory, store) = open_temp_store().await;

        assert_eq!(store.get("threads").expect("get"), None);

        store.set("threads", "[]").expect("set");
        store.set("threads", "[1]").expect("overwrite");
        assert_eq!(store.get("threads").expect("get"), Some("[1]".to_string()));

        store.remove("threads").expect("remove");
        assert_eq!(store.get("threads").expect("get"), None);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("store.db");
        let location = path.to_str().expect("utf-8 path");

        {
            let store = SqliteStore::open(location).await.expect("open");
            store.save_json("numbers", &vec![1, 2, 3]).expect("save");
        }

        let reopened = SqliteStore::open(location).await.expect("reopen");
        let numbers: Option<Vec<u32>> = reopened.load_json("numbers").expect("load");
        assert_eq!(numbers, Some(vec![1, 2, 3]));
        assert_eq!(reopened.keys().expect("keys"), vec!["numbers"]);
    }

    #[tokio::test]
    async fn only_effective_removals_are_published() {
        let (_directory, store) = open_temp_store().await;
        let mut changes = store.subscribe();

        store.remove("absent").expect("remove absent");
        store.set("present", "1").expect("set");
        store.remove("present").expect("remove present");

        let kinds = [
            changes.try_recv().expect("first").kind,
            changes.try_recv().expect("second").kind,
        ];
        assert_eq!(kinds, [ChangeKind::Written, ChangeKind::Removed]);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url("data/store.db"), "sqlite://data/store.db");
        assert_eq!(
            normalize_database_url("sqlite::memory:"),
            "sqlite::memory:"
        );
    }
}
