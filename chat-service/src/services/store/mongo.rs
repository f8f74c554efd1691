//! MongoDB-backed chat store.

use super::ChatStore;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Document},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;
use service_core::protocol::{Chat, Message, SENTINEL_TITLE};

const CHATS_COLLECTION: &str = "chats";

fn db_error(context: &str, e: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %e, "{}", context);
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

#[derive(Clone)]
pub struct MongoChatStore {
    db: Database,
}

impl MongoChatStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri)
            .await
            .map_err(|e| db_error("Failed to connect to MongoDB", e))?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { db })
    }

    fn chats(&self) -> Collection<Chat> {
        self.db.collection(CHATS_COLLECTION)
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for chat-service");

        let id_index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(
                IndexOptions::builder()
                    .name("chat_id_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let owner_index = IndexModel::builder()
            .keys(doc! { "createdBy": 1, "createdAt": -1 })
            .options(
                IndexOptions::builder()
                    .name("created_by_idx".to_string())
                    .build(),
            )
            .build();

        self.chats()
            .create_indexes(vec![id_index, owner_index], None)
            .await
            .map_err(|e| db_error("Failed to create chat indexes", e))?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MongoChatStore {
    async fn get_or_create(&self, chat_id: &str, user_id: &str) -> Result<Chat, AppError> {
        let mut on_insert: Document = bson::to_document(&Chat::new(chat_id, user_id))
            .map_err(|e| db_error("Failed to serialize chat", e))?;
        // `id` comes from the filter on upsert.
        on_insert.remove("id");

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        self.chats()
            .find_one_and_update(doc! { "id": chat_id }, doc! { "$setOnInsert": on_insert }, options)
            .await
            .map_err(|e| db_error("Failed to get or create chat", e))?
            .ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("Upsert returned no chat for {}", chat_id))
            })
    }

    async fn get(&self, chat_id: &str) -> Result<Option<Chat>, AppError> {
        self.chats()
            .find_one(doc! { "id": chat_id }, None)
            .await
            .map_err(|e| db_error("Failed to load chat", e))
    }

    async fn save_messages(&self, chat_id: &str, messages: &[Message]) -> Result<(), AppError> {
        let messages =
            bson::to_bson(messages).map_err(|e| db_error("Failed to serialize messages", e))?;

        let result = self
            .chats()
            .update_one(doc! { "id": chat_id }, doc! { "$set": { "messages": messages } }, None)
            .await
            .map_err(|e| db_error("Failed to save messages", e))?;

        if result.matched_count == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Chat {} not found", chat_id)));
        }
        Ok(())
    }

    async fn set_title_if_sentinel(&self, chat_id: &str, title: &str) -> Result<bool, AppError> {
        let result = self
            .chats()
            .update_one(
                doc! { "id": chat_id, "title": SENTINEL_TITLE },
                doc! { "$set": { "title": title } },
                None,
            )
            .await
            .map_err(|e| db_error("Failed to set chat title", e))?;

        Ok(result.matched_count == 1)
    }

    async fn rename(&self, chat_id: &str, user_id: &str, title: &str) -> Result<bool, AppError> {
        let result = self
            .chats()
            .update_one(
                doc! { "id": chat_id, "createdBy": user_id },
                doc! { "$set": { "title": title } },
                None,
            )
            .await
            .map_err(|e| db_error("Failed to rename chat", e))?;

        Ok(result.matched_count == 1)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>, AppError> {
        let options = FindOptions::builder().sort(doc! { "createdAt": -1 }).build();

        self.chats()
            .find(doc! { "createdBy": user_id }, options)
            .await
            .map_err(|e| db_error("Failed to list chats", e))?
            .try_collect()
            .await
            .map_err(|e| db_error("Failed to read chats", e))
    }

    async fn delete(&self, chat_id: &str, user_id: &str) -> Result<bool, AppError> {
        let result = self
            .chats()
            .delete_one(doc! { "id": chat_id, "createdBy": user_id }, None)
            .await
            .map_err(|e| db_error("Failed to delete chat", e))?;

        Ok(result.deleted_count == 1)
    }

    async fn delete_all_for_user(&self, user_id: &str) -> Result<u64, AppError> {
        let result = self
            .chats()
            .delete_many(doc! { "createdBy": user_id }, None)
            .await
            .map_err(|e| db_error("Failed to delete chats", e))?;

        Ok(result.deleted_count)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| db_error("MongoDB ping failed", e))?;
        Ok(())
    }
}
