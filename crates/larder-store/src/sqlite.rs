// ABOUTME: SQLite storage engine: collections live as JSON rows in one table, indexes as JSON expression indexes.
// ABOUTME: Schema upgrades run in an immediate transaction so concurrent openers migrate exactly once.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use crate::engine::{
    CollectionSpec, IndexSpec, ListOptions, Mutation, SchemaEditor, StorageEngine, StoreError,
    StoreHandle, is_safe_name,
};
use crate::migration::Migrator;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// A storage engine backed by a single SQLite database file.
#[derive(Clone)]
pub struct SqliteEngine {
    path: PathBuf,
    migrator: Arc<Migrator>,
}

impl SqliteEngine {
    pub fn new(path: impl Into<PathBuf>, migrator: Migrator) -> Self {
        Self {
            path: path.into(),
            migrator: Arc::new(migrator),
        }
    }

    /// An engine at `path` that migrates to the current larder schema on open.
    pub fn with_default_schema(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Migrator::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> StoreError {
        StoreError::EngineUnavailable(format!("{}: {}", self.path.display(), err))
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| self.unavailable(err))?;
        }

        let conn = Connection::open(&self.path).map_err(|err| self.unavailable(err))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|err| self.unavailable(err))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|err| self.unavailable(err))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS larder_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS larder_collections (
                name TEXT PRIMARY KEY,
                key_path TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS larder_indexes (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                key_path TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            );

            CREATE TABLE IF NOT EXISTS larder_records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )
        .map_err(|err| self.unavailable(err))?;

        Ok(conn)
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    async fn open(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        let mut conn = self.connect()?;
        let target = self.migrator.current_version();
        let mut version = read_version(&conn)?;

        if version < target {
            // Take the write lock first, then re-read: another opener may
            // have finished the upgrade while we waited.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let old_version = read_version(&tx)?;
            if old_version < target {
                let applied = self
                    .migrator
                    .upgrade(&mut SqliteEditor { conn: &tx }, old_version)?;
                tx.execute(
                    "INSERT INTO larder_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![SCHEMA_VERSION_KEY, applied.to_string()],
                )?;
                tx.commit()?;
                tracing::info!(
                    path = %self.path.display(),
                    from = old_version,
                    to = applied,
                    "sqlite store upgraded"
                );
                version = applied;
            } else {
                version = old_version;
            }
        } else if version > target {
            tracing::warn!(
                path = %self.path.display(),
                stored = version,
                known = target,
                "store was written by a newer build"
            );
        }

        Ok(Box::new(SqliteHandle {
            conn: Mutex::new(conn),
            version,
        }))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

fn read_version(conn: &Connection) -> Result<u32, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM larder_meta WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Ok(0),
        Some(text) => text.parse().map_err(|_| {
            StoreError::TransactionFailed(format!("corrupt schema version: {}", text))
        }),
    }
}

fn check_name(name: &str) -> Result<(), StoreError> {
    if is_safe_name(name) {
        Ok(())
    } else {
        Err(StoreError::TransactionFailed(format!(
            "invalid collection or index name: {}",
            name
        )))
    }
}

fn sql_index_name(collection: &str, index: &str) -> String {
    format!("idx_{}_{}", collection, index).replace('.', "_")
}

fn collection_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM larder_collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn require_collection(conn: &Connection, name: &str) -> Result<(), StoreError> {
    if collection_exists(conn, name)? {
        Ok(())
    } else {
        Err(StoreError::UnknownCollection(name.to_string()))
    }
}

fn index_key_path(conn: &Connection, collection: &str, index: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT key_path FROM larder_indexes WHERE collection = ?1 AND name = ?2",
            params![collection, index],
            |row| row.get(0),
        )
        .optional()?)
}

fn get_row(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
    let text: Option<String> = conn
        .query_row(
            "SELECT value FROM larder_records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(text.map(|text| serde_json::from_str(&text)).transpose()?)
}

fn put_row(conn: &Connection, collection: &str, id: &str, value: &Value) -> Result<(), StoreError> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO larder_records (collection, id, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET value = excluded.value",
        params![collection, id, text],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, collection: &str, id: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM larder_records WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    Ok(())
}

fn query_values(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Value>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let texts = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    texts
        .iter()
        .map(|text| serde_json::from_str(text).map_err(StoreError::from))
        .collect()
}

struct SqliteEditor<'a> {
    conn: &'a Connection,
}

impl SchemaEditor for SqliteEditor<'_> {
    fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        collection_exists(self.conn, name)
    }

    fn create_collection(&mut self, spec: &CollectionSpec) -> Result<(), StoreError> {
        check_name(&spec.name)?;
        self.conn.execute(
            "INSERT INTO larder_collections (name, key_path) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![spec.name, spec.key_path],
        )?;
        for index in &spec.indexes {
            self.create_index(&spec.name, index)?;
        }
        Ok(())
    }

    fn has_index(&self, collection: &str, index: &str) -> Result<bool, StoreError> {
        Ok(index_key_path(self.conn, collection, index)?.is_some())
    }

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        require_collection(self.conn, collection)?;
        check_name(&index.name)?;
        check_name(&index.key_path)?;

        self.conn.execute(
            "INSERT INTO larder_indexes (collection, name, key_path) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, name) DO UPDATE SET key_path = excluded.key_path",
            params![collection, index.name, index.key_path],
        )?;
        self.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"{}\"
             ON larder_records (collection, json_extract(value, '$.{}'))",
            sql_index_name(collection, &index.name),
            index.key_path
        ))?;
        Ok(())
    }

    fn delete_collection(&mut self, name: &str) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM larder_indexes WHERE collection = ?1")?;
        let indexes = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        drop(stmt);
        for index in indexes {
            self.conn.execute_batch(&format!(
                "DROP INDEX IF EXISTS \"{}\"",
                sql_index_name(name, &index)
            ))?;
        }

        self.conn
            .execute("DELETE FROM larder_records WHERE collection = ?1", params![name])?;
        self.conn
            .execute("DELETE FROM larder_indexes WHERE collection = ?1", params![name])?;
        self.conn
            .execute("DELETE FROM larder_collections WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        require_collection(self.conn, collection)?;
        query_values(
            self.conn,
            "SELECT value FROM larder_records WHERE collection = ?1 ORDER BY id",
            params![collection],
        )
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        require_collection(self.conn, collection)?;
        get_row(self.conn, collection, id)
    }

    fn put(&mut self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        require_collection(self.conn, collection)?;
        put_row(self.conn, collection, id, &value)
    }
}

struct SqliteHandle {
    conn: Mutex<Connection>,
    version: u32,
}

impl SqliteHandle {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StoreHandle for SqliteHandle {
    fn schema_version(&self) -> u32 {
        self.version
    }

    async fn collections(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name FROM larder_collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock();
        require_collection(&conn, collection)?;
        get_row(&conn, collection, id)
    }

    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        let conn = self.lock();
        require_collection(&conn, collection)?;
        put_row(&conn, collection, id, &value)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        require_collection(&conn, collection)?;
        delete_row(&conn, collection, id)
    }

    async fn list(&self, collection: &str, options: &ListOptions) -> Result<Vec<Value>, StoreError> {
        let conn = self.lock();
        require_collection(&conn, collection)?;

        let key_path = match options.index.as_deref() {
            Some(index) => {
                let path = index_key_path(&conn, collection, index)?;
                if path.is_none() {
                    tracing::debug!(collection, index, "no such index, listing by primary key");
                }
                path
            }
            None => None,
        };

        let direction = if options.reverse { "DESC" } else { "ASC" };
        let order = match key_path {
            Some(path) => {
                check_name(&path)?;
                format!(
                    "json_extract(value, '$.{}') {dir}, id {dir}",
                    path,
                    dir = direction
                )
            }
            None => format!("id {}", direction),
        };
        let limit = options
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        query_values(
            &conn,
            &format!(
                "SELECT value FROM larder_records WHERE collection = ?1 ORDER BY {} LIMIT ?2",
                order
            ),
            params![collection, limit],
        )
    }

    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for mutation in &batch {
            require_collection(&tx, mutation.collection())?;
            match mutation {
                Mutation::Put { collection, id, value } => put_row(&tx, collection, id, value)?,
                Mutation::Delete { collection, id } => delete_row(&tx, collection, id)?,
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationStep, SCHEMA_VERSION};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn engine_in(dir: &TempDir) -> SqliteEngine {
        SqliteEngine::with_default_schema(dir.path().join("larder.db"))
    }

    fn ids(rows: &[Value]) -> Vec<&str> {
        rows.iter().map(|row| row["id"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn open_creates_schema_and_stores_version() {
        let dir = TempDir::new().unwrap();
        let handle = engine_in(&dir).open().await.unwrap();
        assert_eq!(handle.schema_version(), SCHEMA_VERSION);
        assert_eq!(
            handle.collections().await.unwrap(),
            vec!["profiles", "projects", "settings"]
        );
        handle.close().await.unwrap();

        let conn = Connection::open(dir.path().join("larder.db")).unwrap();
        assert_eq!(read_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let handle = engine_in(&dir).open().await.unwrap();
        handle
            .put("settings", "theme", json!({"id": "theme", "data": {"value": "dark"}}))
            .await
            .unwrap();
        handle.close().await.unwrap();

        let reopened = engine_in(&dir).open().await.unwrap();
        let value = reopened.get("settings", "theme").await.unwrap().unwrap();
        assert_eq!(value["data"]["value"], "dark");
    }

    #[tokio::test]
    async fn list_orders_by_json_index() {
        let dir = TempDir::new().unwrap();
        let handle = engine_in(&dir).open().await.unwrap();
        for (id, at) in [
            ("b", "2024-01-02T00:00:00.000Z"),
            ("a", "2024-01-03T00:00:00.000Z"),
            ("c", "2024-01-01T00:00:00.000Z"),
        ] {
            handle
                .put("projects", id, json!({"id": id, "updatedAt": at}))
                .await
                .unwrap();
        }

        let by_time = handle
            .list("projects", &ListOptions::by_index("updatedAt"))
            .await
            .unwrap();
        assert_eq!(ids(&by_time), vec!["c", "b", "a"]);

        let newest = handle
            .list("projects", &ListOptions::by_index("updatedAt").reverse().limit(1))
            .await
            .unwrap();
        assert_eq!(ids(&newest), vec!["a"]);

        let fallback = handle
            .list("projects", &ListOptions::by_index("nope"))
            .await
            .unwrap();
        assert_eq!(ids(&fallback), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn commit_rolls_back_on_unknown_collection() {
        let dir = TempDir::new().unwrap();
        let handle = engine_in(&dir).open().await.unwrap();
        let err = handle
            .commit(vec![
                Mutation::Put {
                    collection: "projects".to_string(),
                    id: "p1".to_string(),
                    value: json!({"id": "p1"}),
                },
                Mutation::Delete {
                    collection: "widgets".to_string(),
                    id: "w1".to_string(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
        assert_eq!(handle.get("projects", "p1").await.unwrap(), None);
    }

    fn failing_step(_: &mut dyn SchemaEditor, _: DateTime<Utc>) -> Result<(), StoreError> {
        Err(StoreError::TransactionFailed("simulated".to_string()))
    }

    fn drop_projects(editor: &mut dyn SchemaEditor, _: DateTime<Utc>) -> Result<(), StoreError> {
        editor.delete_collection("projects")
    }

    #[tokio::test]
    async fn failed_upgrade_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("larder.db");
        engine_in(&dir)
            .open()
            .await
            .unwrap()
            .put("projects", "p1", json!({"id": "p1"}))
            .await
            .unwrap();

        // Step 4 drops a collection, step 5 fails: neither may stick.
        let mut steps = Migrator::default().steps().to_vec();
        steps.push(MigrationStep {
            version: 4,
            description: "drop projects",
            apply: drop_projects,
        });
        steps.push(MigrationStep {
            version: 5,
            description: "broken",
            apply: failing_step,
        });
        let broken = SqliteEngine::new(&path, Migrator::new(steps));
        let err = broken.open().await.err().unwrap();
        assert!(matches!(err, StoreError::MigrationFailed { version: 5, .. }));

        let handle = engine_in(&dir).open().await.unwrap();
        assert_eq!(handle.schema_version(), SCHEMA_VERSION);
        assert!(handle.get("projects", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unusable_path_is_engine_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let engine = SqliteEngine::with_default_schema(blocker.join("larder.db"));
        let err = engine.open().await.err().unwrap();
        assert!(
            matches!(err, StoreError::EngineUnavailable(_)),
            "expected EngineUnavailable, got: {}",
            err
        );
    }
}
