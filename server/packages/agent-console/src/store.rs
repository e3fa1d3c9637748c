//! sqlite persistence for users, sessions, message logs and session logs.

use std::str::FromStr;
use std::time::Duration;

use agent_console_error::ConsoleError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

pub const LIST_LIMIT: i64 = 500;
pub const SESSION_STATUS_ACTIVE: &str = "active";
pub const SESSION_STATUS_ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {column} value `{value}`")]
    Decode { column: &'static str, value: String },
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(err) => err
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation()),
            _ => false,
        }
    }
}

impl From<StoreError> for ConsoleError {
    fn from(value: StoreError) -> Self {
        ConsoleError::Storage {
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub status: String,
    pub model: String,
    pub permission_mode: String,
    pub system_prompt: Option<String>,
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub message_type: String,
    pub payload: Value,
    pub raw_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionLogRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub event_type: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub title: String,
    pub model: String,
    pub permission_mode: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub role: String,
    pub message_type: String,
    pub payload: Value,
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at `database_url`. Connections
    /// are established lazily; call [`Store::wait_until_available`] and
    /// [`Store::migrate`] before serving.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to `:memory:` is its own database; keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn wait_until_available(&self, attempts: u32, delay: Duration) -> Result<(), StoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sqlx::query("SELECT 1").execute(&self.pool).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt >= attempts => {
                    return Err(StoreError::Unavailable {
                        attempts,
                        source: err,
                    })
                }
                Err(err) => {
                    tracing::warn!(attempt, attempts, error = %err, "store: database not ready");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(include_str!("../migrations/0001_init.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, username, display_name, created_at
               FROM users
               ORDER BY created_at ASC, rowid ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at FROM users WHERE id = ?1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at FROM users WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserRecord, StoreError> {
        let user = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO users (id, username, display_name, created_at)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(format_timestamp(user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        let session = SessionRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            title: new.title,
            status: SESSION_STATUS_ACTIVE.to_string(),
            model: new.model,
            permission_mode: new.permission_mode,
            system_prompt: new.system_prompt,
            claude_session_id: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            r#"INSERT INTO agent_sessions (
                id, user_id, title, status, model, permission_mode, system_prompt,
                claude_session_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?8)"#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.title)
        .bind(&session.status)
        .bind(&session.model)
        .bind(&session.permission_mode)
        .bind(&session.system_prompt)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn list_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, title, status, model, permission_mode, system_prompt,
                      claude_session_id, created_at, updated_at
               FROM agent_sessions
               WHERE user_id = ?1
               ORDER BY updated_at DESC, created_at DESC, rowid DESC"#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, user_id, title, status, model, permission_mode, system_prompt,
                      claude_session_id, created_at, updated_at
               FROM agent_sessions
               WHERE id = ?1"#,
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn update_session_status(&self, session_id: Uuid, status: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE agent_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(format_timestamp(Utc::now()))
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_claude_session_id(&self, session_id: Uuid, handle: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE agent_sessions SET claude_session_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(handle)
        .bind(format_timestamp(Utc::now()))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE agent_sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(format_timestamp(Utc::now()))
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes the session with its messages and logs. Returns whether a row
    /// was removed.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agent_sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_message(&self, new: NewMessage) -> Result<MessageRecord, StoreError> {
        let message = MessageRecord {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            role: new.role,
            message_type: new.message_type,
            payload: new.payload,
            raw_text: new.raw_text,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO message_logs (id, session_id, role, message_type, payload_json, raw_text, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(&message.role)
        .bind(&message.message_type)
        .bind(serde_json::to_string(&message.payload)?)
        .bind(&message.raw_text)
        .bind(format_timestamp(message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(message)
    }

    pub async fn list_messages(&self, session_id: Uuid) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, session_id, role, message_type, payload_json, raw_text, created_at
               FROM message_logs
               WHERE session_id = ?1
               ORDER BY created_at ASC, rowid ASC
               LIMIT ?2"#,
        )
        .bind(session_id.to_string())
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn create_log(
        &self,
        session_id: Uuid,
        event_type: &str,
        details: Value,
    ) -> Result<SessionLogRecord, StoreError> {
        let log = SessionLogRecord {
            id: Uuid::new_v4(),
            session_id,
            event_type: event_type.to_string(),
            details,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO session_logs (id, session_id, event_type, details_json, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(log.id.to_string())
        .bind(log.session_id.to_string())
        .bind(&log.event_type)
        .bind(serde_json::to_string(&log.details)?)
        .bind(format_timestamp(log.created_at))
        .execute(&self.pool)
        .await?;
        Ok(log)
    }

    pub async fn list_logs(&self, session_id: Uuid) -> Result<Vec<SessionLogRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, session_id, event_type, details_json, created_at
               FROM session_logs
               WHERE session_id = ?1
               ORDER BY created_at ASC, rowid ASC
               LIMIT ?2"#,
        )
        .bind(session_id.to_string())
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn uuid_column(row: &SqliteRow, column: &'static str) -> Result<Uuid, StoreError> {
    let value: String = row.try_get(column)?;
    Uuid::parse_str(&value).map_err(|_| StoreError::Decode { column, value })
}

fn timestamp_column(row: &SqliteRow, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    let value: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::Decode { column, value })
}

fn json_column(row: &SqliteRow, column: &'static str) -> Result<Value, StoreError> {
    let value: String = row.try_get(column)?;
    Ok(serde_json::from_str(&value)?)
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        id: uuid_column(row, "id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    Ok(SessionRecord {
        id: uuid_column(row, "id")?,
        user_id: uuid_column(row, "user_id")?,
        title: row.try_get("title")?,
        status: row.try_get("status")?,
        model: row.try_get("model")?,
        permission_mode: row.try_get("permission_mode")?,
        system_prompt: row.try_get("system_prompt")?,
        claude_session_id: row.try_get("claude_session_id")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord, StoreError> {
    Ok(MessageRecord {
        id: uuid_column(row, "id")?,
        session_id: uuid_column(row, "session_id")?,
        role: row.try_get("role")?,
        message_type: row.try_get("message_type")?,
        payload: json_column(row, "payload_json")?,
        raw_text: row.try_get("raw_text")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<SessionLogRecord, StoreError> {
    Ok(SessionLogRecord {
        id: uuid_column(row, "id")?,
        session_id: uuid_column(row, "session_id")?,
        event_type: row.try_get("event_type")?,
        details: json_column(row, "details_json")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store_with_session() -> (Store, SessionRecord) {
        let store = Store::in_memory().await.expect("store");
        let user = store.create_user("demo", "Demo User").await.expect("user");
        let session = store
            .create_session(NewSession {
                user_id: user.id,
                title: "New Session".to_string(),
                model: "claude-sonnet-4-5".to_string(),
                permission_mode: "bypassPermissions".to_string(),
                system_prompt: None,
            })
            .await
            .expect("session");
        (store, session)
    }

    #[tokio::test]
    async fn users_round_trip_and_reject_duplicates() {
        let store = Store::in_memory().await.expect("store");
        let created = store.create_user("demo", "Demo User").await.expect("user");
        assert_eq!(store.get_user(created.id).await.expect("get"), Some(created.clone()));
        assert_eq!(
            store.get_user_by_username("demo").await.expect("by name"),
            Some(created)
        );

        let err = store
            .create_user("demo", "Other")
            .await
            .expect_err("duplicate");
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn session_updates_are_persisted() {
        let (store, session) = store_with_session().await;
        assert_eq!(session.status, SESSION_STATUS_ACTIVE);

        store
            .update_claude_session_id(session.id, "ext-1")
            .await
            .expect("handle");
        store
            .update_session_status(session.id, SESSION_STATUS_ERROR)
            .await
            .expect("status");
        store.touch_session(session.id).await.expect("touch");

        let reloaded = store
            .get_session(session.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(reloaded.claude_session_id.as_deref(), Some("ext-1"));
        assert_eq!(reloaded.status, SESSION_STATUS_ERROR);
        assert!(reloaded.updated_at >= session.updated_at);

        let listed = store
            .list_sessions_for_user(session.user_id)
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let (store, session) = store_with_session().await;
        for index in 0..5 {
            store
                .create_message(NewMessage {
                    session_id: session.id,
                    role: "assistant".to_string(),
                    message_type: "AssistantMessage".to_string(),
                    payload: json!({ "index": index }),
                    raw_text: Some(format!("m{index}")),
                })
                .await
                .expect("message");
        }

        let messages = store.list_messages(session.id).await.expect("list");
        let texts: Vec<_> = messages
            .iter()
            .map(|m| m.raw_text.clone().unwrap_or_default())
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(messages[3].payload, json!({ "index": 3 }));
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
    }

    #[tokio::test]
    async fn deleting_a_session_cascades() {
        let (store, session) = store_with_session().await;
        store
            .create_log(session.id, "SESSION_CREATED", json!({}))
            .await
            .expect("log");
        store
            .create_message(NewMessage {
                session_id: session.id,
                role: "user".to_string(),
                message_type: "prompt".to_string(),
                payload: json!({ "prompt": "hi" }),
                raw_text: Some("hi".to_string()),
            })
            .await
            .expect("message");

        assert!(store.delete_session(session.id).await.expect("delete"));
        assert!(!store.delete_session(session.id).await.expect("delete again"));
        assert!(store.list_logs(session.id).await.expect("logs").is_empty());
        assert!(store.list_messages(session.id).await.expect("messages").is_empty());
    }

    #[tokio::test]
    async fn file_database_is_created_on_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("console.db");
        let store = Store::connect(&format!("sqlite://{}", path.display())).expect("connect");
        store
            .wait_until_available(3, Duration::from_millis(10))
            .await
            .expect("available");
        store.migrate().await.expect("migrate");
        store.migrate().await.expect("migrations are idempotent");
        assert!(path.exists());
        store.close().await;
    }
}
