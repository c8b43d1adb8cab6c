//! SQLite-backed VM record store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use cubicle_core::{OwnerId, Vm, VmId, VmName, VmStatus};

use crate::{StoreError, VmStore};

type Row = (i64, i64, String, String, String);

const SELECT_COLUMNS: &str = "SELECT id, user_id, name, status, created_at FROM virtual_machines";

/// Record store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteVmStore {
    pool: SqlitePool,
}

impl SqliteVmStore {
    /// Connect to `url` (e.g. `sqlite://cubicle.db?mode=rwc`) and create the
    /// schema if it is missing.
    ///
    /// # Errors
    /// Returns [`StoreError::Database`] if the connection or schema setup fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect to a private in-memory database. Mainly useful in tests.
    ///
    /// # Errors
    /// Returns [`StoreError::Database`] if the connection or schema setup fails.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Each in-memory connection is its own database, so the pool must hold exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS virtual_machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_virtual_machines_user ON virtual_machines (user_id);
            ",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

fn decode((id, user_id, name, status, created_at): Row) -> Result<Vm, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let vm_id = u32::try_from(id).map_err(|_| corrupt(format!("id {id} out of range")))?;
    let name = VmName::parse(&name).map_err(|e| corrupt(e.to_string()))?;
    let status = status.parse::<VmStatus>().map_err(|e| corrupt(e.to_string()))?;
    let created_at = parse_created_at(&created_at).map_err(|e| corrupt(format!("created_at: {e}")))?;

    let mut vm = Vm::new(VmId::new(vm_id), OwnerId::new(user_id), name, created_at);
    vm.status = status;
    Ok(vm)
}

/// Rows written here carry RFC 3339; rows written by SQLite's
/// `CURRENT_TIMESTAMP` carry `YYYY-MM-DD HH:MM:SS` in UTC.
fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(rfc3339) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map(|t| t.and_utc())
            .map_err(|_| rfc3339),
    }
}

#[async_trait]
impl VmStore for SqliteVmStore {
    async fn insert(&self, owner: OwnerId, name: &VmName) -> Result<Vm, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO virtual_machines (user_id, name, status, created_at) VALUES (?, ?, 'stopped', ?)",
        )
        .bind(owner.0)
        .bind(name.as_str())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = u32::try_from(result.last_insert_rowid()).map_err(|_| StoreError::IdsExhausted)?;
        Ok(Vm::new(VmId::new(id), owner, name.clone(), created_at))
    }

    async fn get(&self, id: VmId) -> Result<Option<Vm>, StoreError> {
        let row: Option<Row> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(i64::from(id.get()))
            .fetch_optional(&self.pool)
            .await?;
        row.map(decode).transpose()
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<Vm>, StoreError> {
        let rows: Vec<Row> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE user_id = ? ORDER BY id"))
            .bind(owner.0)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(decode).collect()
    }

    async fn count_by_owner(&self, owner: OwnerId) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM virtual_machines WHERE user_id = ?")
            .bind(owner.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn update_status(&self, id: VmId, status: VmStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE virtual_machines SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(i64::from(id.get()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_name(&self, id: VmId, name: &VmName) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE virtual_machines SET name = ? WHERE id = ?")
            .bind(name.as_str())
            .bind(i64::from(id.get()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: VmId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
            .bind(i64::from(id.get()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteVmStore {
        match SqliteVmStore::in_memory().await {
            Ok(s) => s,
            Err(e) => panic!("in-memory sqlite failed: {e}"),
        }
    }

    fn name(raw: &str) -> VmName {
        match VmName::parse(raw) {
            Ok(n) => n,
            Err(e) => panic!("invalid test name: {e}"),
        }
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips_record() {
        let store = store().await;
        let inserted = match store.insert(OwnerId::new(11), &name("box1")).await {
            Ok(vm) => vm,
            Err(e) => panic!("insert failed: {e}"),
        };
        let fetched = match store.get(inserted.id).await {
            Ok(Some(vm)) => vm,
            other => panic!("get failed: {other:?}"),
        };
        assert_eq!(fetched.id, inserted.id);
        assert_eq!(fetched.owner_id, OwnerId::new(11));
        assert_eq!(fetched.name.as_str(), "box1");
        assert_eq!(fetched.status, VmStatus::Stopped);
        assert_eq!(fetched.created_at.timestamp(), inserted.created_at.timestamp());
    }

    #[tokio::test]
    async fn autoincrement_never_reuses_deleted_ids() {
        let store = store().await;
        let first = match store.insert(OwnerId::new(1), &name("a")).await {
            Ok(vm) => vm,
            Err(e) => panic!("insert failed: {e}"),
        };
        assert!(matches!(store.delete(first.id).await, Ok(true)));
        let second = match store.insert(OwnerId::new(1), &name("b")).await {
            Ok(vm) => vm,
            Err(e) => panic!("insert failed: {e}"),
        };
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn owner_scoped_queries_and_updates() {
        let store = store().await;
        let mut ids = Vec::new();
        for (owner, n) in [(1, "a"), (2, "b"), (1, "c")] {
            match store.insert(OwnerId::new(owner), &name(n)).await {
                Ok(vm) => ids.push(vm.id),
                Err(e) => panic!("insert failed: {e}"),
            }
        }

        assert!(matches!(store.count_by_owner(OwnerId::new(1)).await, Ok(2)));
        assert!(matches!(store.update_status(ids[2], VmStatus::Running).await, Ok(true)));
        assert!(matches!(store.update_name(ids[0], &name("first")).await, Ok(true)));

        let listed = match store.list_by_owner(OwnerId::new(1)).await {
            Ok(v) => v,
            Err(e) => panic!("list failed: {e}"),
        };
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name.as_str(), "first");
        assert_eq!(listed[1].status, VmStatus::Running);
    }

    #[tokio::test]
    async fn rows_stamped_by_sqlite_default_are_readable() {
        let store = store().await;
        let inserted = sqlx::query(
            "INSERT INTO virtual_machines (user_id, name, status, created_at) \
             VALUES (5, 'legacy', 'running', '2024-01-02 03:04:05'), \
                    (5, 'fresh', 'stopped', CURRENT_TIMESTAMP)",
        )
        .execute(&store.pool)
        .await;
        if let Err(e) = inserted {
            panic!("raw insert failed: {e}");
        }

        let listed = match store.list_by_owner(OwnerId::new(5)).await {
            Ok(v) => v,
            Err(e) => panic!("list failed: {e}"),
        };
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name.as_str(), "legacy");
        assert_eq!(listed[0].status, VmStatus::Running);
        assert_eq!(listed[0].created_at.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert!(listed[1].created_at.timestamp() > 0);

        match store.get(listed[0].id).await {
            Ok(Some(vm)) => assert_eq!(vm.created_at, listed[0].created_at),
            other => panic!("get failed: {other:?}"),
        }
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        assert!(parse_created_at("2024-01-02T03:04:05Z").is_ok());
        assert!(parse_created_at("2024-01-02 03:04:05.250").is_ok());
        assert!(parse_created_at("yesterday").is_err());
        assert!(parse_created_at("2024-01-02").is_err());
    }

    #[tokio::test]
    async fn missing_rows_report_false() {
        let store = store().await;
        assert!(matches!(store.get(VmId::new(42)).await, Ok(None)));
        assert!(matches!(store.update_status(VmId::new(42), VmStatus::Running).await, Ok(false)));
        assert!(matches!(store.delete(VmId::new(42)).await, Ok(false)));
    }
}
