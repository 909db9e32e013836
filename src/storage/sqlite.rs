//! SQLite implementation of StateStore.

use crate::domain::{CooldownRecord, HistoryEntry, RiskProfile, SystemEmergency, UserEmergency};
use crate::storage::{StateStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

const PROFILES: &str = "risk_profiles";
const COOLDOWNS: &str = "cooldowns";
const USER_EMERGENCIES: &str = "user_emergencies";

/// SqliteStore implements StateStore using SQLite.
///
/// Per-user records live in keyed tables holding a JSON payload. The system
/// stop is a single row with id 1; its history is an append-only table.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

/// SqliteStoreConfig holds SQLite storage configuration.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Path to the SQLite database file.
    pub path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: "fire_gate.db".to_string(),
            max_connections: 5,
        }
    }
}

impl SqliteStore {
    /// Creates a new SQLite store instance.
    pub async fn new(config: SqliteStoreConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };

        store.migrate().await?;

        info!(path = %config.path, "SQLite store initialized");
        Ok(store)
    }

    /// Runs database migrations to create the schema.
    async fn migrate(&self) -> Result<(), StorageError> {
        for table in [PROFILES, COOLDOWNS, USER_EMERGENCIES] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    user_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_emergency (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_emergency_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_system_history_event ON system_emergency_history(event_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_keyed<T: DeserializeOwned>(
        &self,
        table: &str,
        user_id: &str,
    ) -> Result<Option<T>, StorageError> {
        let row = sqlx::query(&format!("SELECT payload FROM {table} WHERE user_id = ?"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| parse_payload(&row)).transpose()
    }

    async fn save_keyed<T: Serialize>(
        &self,
        table: &str,
        user_id: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(value)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (user_id, payload, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            "#
        ))
        .bind(user_id)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(table, user = %user_id, "Record saved");
        Ok(())
    }

    async fn list_keyed<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, StorageError> {
        let rows = sqlx::query(&format!("SELECT payload FROM {table} ORDER BY user_id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(parse_payload).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<RiskProfile>, StorageError> {
        self.load_keyed(PROFILES, user_id).await
    }

    async fn save_profile(&self, profile: &RiskProfile) -> Result<(), StorageError> {
        self.save_keyed(PROFILES, &profile.user_id, profile).await
    }

    async fn load_cooldown(&self, user_id: &str) -> Result<Option<CooldownRecord>, StorageError> {
        self.load_keyed(COOLDOWNS, user_id).await
    }

    async fn save_cooldown(&self, record: &CooldownRecord) -> Result<(), StorageError> {
        self.save_keyed(COOLDOWNS, &record.user_id, record).await
    }

    async fn delete_cooldown(&self, user_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM cooldowns WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, StorageError> {
        self.list_keyed(COOLDOWNS).await
    }

    async fn load_user_emergency(
        &self,
        user_id: &str,
    ) -> Result<Option<UserEmergency>, StorageError> {
        self.load_keyed(USER_EMERGENCIES, user_id).await
    }

    async fn save_user_emergency(&self, state: &UserEmergency) -> Result<(), StorageError> {
        self.save_keyed(USER_EMERGENCIES, &state.user_id, state).await
    }

    async fn list_user_emergencies(&self) -> Result<Vec<UserEmergency>, StorageError> {
        self.list_keyed(USER_EMERGENCIES).await
    }

    async fn load_system_emergency(&self) -> Result<Option<SystemEmergency>, StorageError> {
        let row = sqlx::query("SELECT payload FROM system_emergency WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| parse_payload(&row)).transpose()
    }

    async fn save_system_emergency(&self, state: &SystemEmergency) -> Result<(), StorageError> {
        let payload = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT INTO system_emergency (id, payload, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            "#,
        )
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(event = state.event_id, active = state.active, "System emergency saved");
        Ok(())
    }

    async fn append_system_history(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&entry.event)?;
        let action = serde_json::to_value(entry.action)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidData("history action is not a string".into()))?;

        sqlx::query(
            r#"
            INSERT INTO system_emergency_history (action, event_id, payload, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&action)
        .bind(entry.event.event_id as i64)
        .bind(&payload)
        .bind(entry.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn system_history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT action, payload, recorded_at FROM system_emergency_history ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_history_row).collect()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Parses the JSON payload column of a row.
fn parse_payload<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, StorageError> {
    let payload: String = row.try_get("payload")?;
    Ok(serde_json::from_str(&payload)?)
}

/// Parses a system history entry from a database row.
fn parse_history_row(row: &sqlx::sqlite::SqliteRow) -> Result<HistoryEntry, StorageError> {
    let action_str: String = row.try_get("action")?;
    let action = serde_json::from_value(serde_json::Value::String(action_str.clone()))
        .map_err(|_| StorageError::InvalidData(format!("Invalid action: {}", action_str)))?;

    let event: SystemEmergency = parse_payload(row)?;

    let recorded_at_str: String = row.try_get("recorded_at")?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
        .map_err(|e| StorageError::InvalidData(format!("Invalid recorded_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(HistoryEntry {
        action,
        event,
        recorded_at,
    })
}
