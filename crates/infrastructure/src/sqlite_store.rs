use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use pipeline_core::{Offset, OffsetStore, PipelineError, PipelineResult, ProcessState};

/// 基于SQLite的偏移存储，适用于嵌入式部署
///
/// 时间戳以微秒整数列存储，time_updated 在 UPDATE 的 WHERE 条件中充当
/// 乐观并发版本号：存储副本比内存副本新时影响行数为 0，写入被拒绝。
pub struct SqliteOffsetStore {
    pool: SqlitePool,
}

impl SqliteOffsetStore {
    /// 创建嵌入式SQLite存储，数据库文件不存在时自动创建
    pub async fn new_embedded(database_path: &Path) -> PipelineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite偏移存储初始化完成: {}", database_path.display());
        Ok(store)
    }

    /// 从连接字符串创建存储
    pub async fn new(database_url: &str) -> PipelineResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PipelineError::Configuration(format!("无效的数据库连接串: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> PipelineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_state (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                instance TEXT NOT NULL,
                time_created INTEGER NOT NULL,
                time_updated INTEGER NOT NULL,
                position INTEGER NOT NULL,
                error TEXT,
                PRIMARY KEY (namespace, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("process_state表迁移完成");
        Ok(())
    }

    fn map_row(row: &SqliteRow) -> PipelineResult<ProcessState> {
        let time_created: i64 = row.try_get("time_created")?;
        let time_updated: i64 = row.try_get("time_updated")?;
        let position: i64 = row.try_get("position")?;
        Ok(ProcessState {
            namespace: row.try_get("namespace")?,
            name: row.try_get("name")?,
            instance: row.try_get("instance")?,
            time_created: micros_to_datetime(time_created)?,
            time_updated: micros_to_datetime(time_updated)?,
            offset: Offset(position),
            error: row.try_get("error")?,
        })
    }
}

fn micros_to_datetime(micros: i64) -> PipelineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| PipelineError::Internal(format!("无效的时间戳: {micros}")))
}

#[async_trait]
impl OffsetStore for SqliteOffsetStore {
    async fn get(&self, namespace: &str, name: &str) -> PipelineResult<Option<ProcessState>> {
        let row = sqlx::query(
            "SELECT namespace, name, instance, time_created, time_updated, position, error
             FROM process_state WHERE namespace = ?1 AND name = ?2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::map_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, state: &ProcessState) -> PipelineResult<ProcessState> {
        let result = sqlx::query(
            "INSERT INTO process_state
             (namespace, name, instance, time_created, time_updated, position, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&state.namespace)
        .bind(&state.name)
        .bind(&state.instance)
        .bind(state.time_created.timestamp_micros())
        .bind(state.time_updated.timestamp_micros())
        .bind(state.offset.value())
        .bind(&state.error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("创建处理状态: {}", state.key());
                Ok(state.clone())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(PipelineError::StateExists {
                    namespace: state.namespace.clone(),
                    name: state.name.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, state: &ProcessState) -> PipelineResult<ProcessState> {
        let mut refreshed = state.clone();
        refreshed.time_updated = Utc::now();

        let result = sqlx::query(
            "UPDATE process_state
             SET instance = ?1, time_updated = ?2, position = ?3, error = ?4
             WHERE namespace = ?5 AND name = ?6 AND time_updated <= ?7",
        )
        .bind(&refreshed.instance)
        .bind(refreshed.time_updated.timestamp_micros())
        .bind(refreshed.offset.value())
        .bind(&refreshed.error)
        .bind(&state.namespace)
        .bind(&state.name)
        .bind(state.time_updated.timestamp_micros())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(&state.namespace, &state.name).await? {
                Some(stored) => Err(PipelineError::StateConflict {
                    stored: stored.time_updated.to_rfc3339(),
                    current: state.time_updated.to_rfc3339(),
                }),
                None => Err(PipelineError::StateNotFound {
                    namespace: state.namespace.clone(),
                    name: state.name.clone(),
                }),
            };
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn temp_store() -> (SqliteOffsetStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteOffsetStore::new_embedded(&dir.path().join("pipeline.db"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let (store, _dir) = temp_store().await;
        let mut state = ProcessState::new("replicator", "orders", "host-1");
        state.offset = Offset(42);
        state.error = Some("上次失败".to_string());

        store.create(&state).await.unwrap();
        let loaded = store.get("replicator", "orders").await.unwrap().unwrap();
        assert_eq!(loaded.offset, Offset(42));
        assert_eq!(loaded.instance, "host-1");
        assert_eq!(loaded.error, Some("上次失败".to_string()));
        // 微秒精度内时间戳不变
        assert_eq!(
            loaded.time_updated.timestamp_micros(),
            state.time_updated.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (store, _dir) = temp_store().await;
        assert!(store.get("replicator", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let (store, _dir) = temp_store().await;
        let state = ProcessState::new("replicator", "orders", "host-1");
        store.create(&state).await.unwrap();

        let err = store.create(&state).await.unwrap_err();
        assert!(matches!(err, PipelineError::StateExists { .. }));
    }

    #[tokio::test]
    async fn test_optimistic_conflict() {
        let (store, _dir) = temp_store().await;
        let state = ProcessState::new("replicator", "orders", "host-1");
        store.create(&state).await.unwrap();

        let mut copy_a = store.get("replicator", "orders").await.unwrap().unwrap();
        let mut copy_b = store.get("replicator", "orders").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        copy_a.advance(Offset(10), "host-a");
        store.update(&copy_a).await.unwrap();

        copy_b.offset = Offset(3);
        let err = store.update(&copy_b).await.unwrap_err();
        assert!(matches!(err, PipelineError::StateConflict { .. }));

        let stored = store.get("replicator", "orders").await.unwrap().unwrap();
        assert_eq!(stored.offset, Offset(10));
    }

    #[tokio::test]
    async fn test_update_missing_state() {
        let (store, _dir) = temp_store().await;
        let state = ProcessState::new("replicator", "orders", "host-1");
        let err = store.update(&state).await.unwrap_err();
        assert!(matches!(err, PipelineError::StateNotFound { .. }));
    }
}
