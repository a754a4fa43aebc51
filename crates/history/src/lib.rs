use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

/// Recorded sensor values, one row per sensor per snapshot.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: "cerbo-history.sqlite".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub value: f64,
    pub collected_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl HistoryStore {
    pub async fn new(path: &str) -> Result<Self, HistoryError> {
        Self::with_config(HistoryConfig {
            path: path.to_string(),
            ..HistoryConfig::default()
        })
        .await
    }

    pub async fn with_config(config: HistoryConfig) -> Result<Self, HistoryError> {
        let url = sqlite_url(&config.path);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensor_readings (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                sensor_key TEXT NOT NULL,\
                value REAL NOT NULL,\
                collected_at INTEGER NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sensor_time ON sensor_readings(sensor_key, collected_at)",
        )
        .execute(&pool)
        .await?;

        info!(path = %config.path, "history initialized");

        Ok(Self { pool })
    }

    /// Stores every value of one snapshot atomically.
    pub async fn record(
        &self,
        collected_at_ms: i64,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), HistoryError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (key, value) in values {
            sqlx::query(
                "INSERT INTO sensor_readings (sensor_key, value, collected_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(collected_at_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = values.len(), collected_at_ms, "snapshot recorded");

        Ok(())
    }

    /// Newest first.
    pub async fn recent(&self, key: &str, limit: i64) -> Result<Vec<HistoryPoint>, HistoryError> {
        let rows = sqlx::query(
            "SELECT value, collected_at FROM sensor_readings \
             WHERE sensor_key = ? ORDER BY collected_at DESC, id DESC LIMIT ?",
        )
        .bind(key)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HistoryPoint {
                value: row.get::<f64, _>("value"),
                collected_at_ms: row.get::<i64, _>("collected_at"),
            })
            .collect())
    }

    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE collected_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn reading_count(&self) -> Result<i64, HistoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sensor_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}?mode=rwc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_get_create_mode() {
        assert_eq!(
            sqlite_url("/var/lib/cerbo.sqlite"),
            "sqlite:///var/lib/cerbo.sqlite?mode=rwc"
        );
        assert_eq!(sqlite_url("sqlite::memory:"), "sqlite::memory:");
    }
}
