//! Local replica store.
//!
//! A SQLite mirror of the caller's chats and the configured models, plus the
//! table of requests this client currently has in flight.

use crate::error::ClientError;
use chrono::{DateTime, Utc};
use service_core::protocol::{Chat, Message, ModelInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{info, instrument};

/// A request the client believes is running on the server.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ActiveRequest {
    pub request_id: String,
    pub chat_id: String,
}

#[derive(FromRow)]
struct ChatRow {
    id: String,
    title: String,
    messages: Json<Vec<Message>>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        Chat {
            id: row.id,
            title: row.title,
            messages: row.messages.0,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct Replica {
    pool: SqlitePool,
}

impl Replica {
    /// Open (creating if needed) the database at `url` and migrate it.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let replica = Self { pool };
        replica.run_migrations().await?;
        info!("Replica store ready");
        Ok(replica)
    }

    /// A private in-memory replica.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self, ClientError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let replica = Self { pool };
        replica.run_migrations().await?;
        Ok(replica)
    }

    async fn run_migrations(&self) -> Result<(), ClientError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_chat(&self, chat: &Chat) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, title, messages, created_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                messages = excluded.messages,
                created_by = excluded.created_by,
                created_at = excluded.created_at
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.title)
        .bind(Json(&chat.messages))
        .bind(&chat.created_by)
        .bind(chat.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace a chat's messages. Returns false if the chat is unknown.
    pub async fn update_chat_messages(
        &self,
        chat_id: &str,
        messages: &[Message],
    ) -> Result<bool, ClientError> {
        let result = sqlx::query("UPDATE chats SET messages = ? WHERE id = ?")
            .bind(Json(messages))
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<bool, ClientError> {
        let result = sqlx::query("UPDATE chats SET title = ? WHERE id = ?")
            .bind(title)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a chat from the replica. Active request rows are left alone.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<bool, ClientError> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, ClientError> {
        let row = sqlx::query_as::<_, ChatRow>(
            "SELECT id, title, messages, created_by, created_at FROM chats WHERE id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Chat::from))
    }

    /// The chat containing the message with this id.
    pub async fn find_chat_by_message(&self, message_id: &str) -> Result<Option<Chat>, ClientError> {
        let row = sqlx::query_as::<_, ChatRow>(
            r#"
            SELECT c.id, c.title, c.messages, c.created_by, c.created_at
            FROM chats c, json_each(c.messages) m
            WHERE json_extract(m.value, '$.id') = ?
            LIMIT 1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Chat::from))
    }

    /// Newest first.
    pub async fn list_chats(&self) -> Result<Vec<Chat>, ClientError> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, title, messages, created_by, created_at FROM chats ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Chat::from).collect())
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ClientError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id, model, provider FROM models ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, model, provider)| ModelInfo {
                id,
                model,
                provider,
            })
            .collect())
    }

    /// Swap in a full server snapshot of chats and models atomically.
    #[instrument(skip_all, fields(chats = chats.len(), models = models.len()))]
    pub async fn replace_all(&self, chats: &[Chat], models: &[ModelInfo]) -> Result<(), ClientError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM models").execute(&mut *tx).await?;

        for chat in chats {
            sqlx::query(
                "INSERT INTO chats (id, title, messages, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chat.id)
            .bind(&chat.title)
            .bind(Json(&chat.messages))
            .bind(&chat.created_by)
            .bind(chat.created_at)
            .execute(&mut *tx)
            .await?;
        }
        for model in models {
            sqlx::query("INSERT INTO models (id, model, provider) VALUES (?, ?, ?)")
                .bind(&model.id)
                .bind(&model.model)
                .bind(&model.provider)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Record an in-flight request. Fails with `AlreadyActive` if the chat
    /// already has one.
    pub async fn add_active_request(&self, request: &ActiveRequest) -> Result<(), ClientError> {
        sqlx::query("INSERT INTO active_requests (request_id, chat_id) VALUES (?, ?)")
            .bind(&request.request_id)
            .bind(&request.chat_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    ClientError::AlreadyActive(request.chat_id.clone())
                }
                _ => ClientError::Storage(e),
            })?;
        Ok(())
    }

    pub async fn remove_active_request(&self, request_id: &str) -> Result<bool, ClientError> {
        let result = sqlx::query("DELETE FROM active_requests WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_active_requests(&self) -> Result<Vec<ActiveRequest>, ClientError> {
        let rows = sqlx::query_as::<_, ActiveRequest>(
            "SELECT request_id, chat_id FROM active_requests",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn active_request_for_chat(
        &self,
        chat_id: &str,
    ) -> Result<Option<ActiveRequest>, ClientError> {
        let row = sqlx::query_as::<_, ActiveRequest>(
            "SELECT request_id, chat_id FROM active_requests WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Drop every recorded request. Returns how many were removed.
    pub async fn clear_active_requests(&self) -> Result<u64, ClientError> {
        let result = sqlx::query("DELETE FROM active_requests")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
