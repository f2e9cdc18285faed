//! `MessageRepo`: template storage for §4.6 `SELECT_MESSAGE` — a random
//! active message per group, with `usage_count` bookkeeping for `status`
//! reporting.

use crate::db::postgres::PostgresPool;
use crate::db::Pool;
use crate::error::RepoError;
use crate::model::{GroupId, Message, MessageId};
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Picks one active message for the group uniformly at random. `None`
    /// means the group has no usable template — the Worker treats this the
    /// same as an empty task queue (§4.6 `EMPTY` exit).
    async fn pick_random_active(&self, group_id: GroupId) -> Result<Option<Message>, RepoError>;

    async fn record_usage(&self, message_id: MessageId) -> Result<(), RepoError>;
}

pub struct DbMessageRepo<DB> {
    db: DB,
}

impl<DB: Pool> DbMessageRepo<DB> {
    pub fn new(db: DB) -> Self {
        Self { db }
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message, RepoError> {
    Ok(Message {
        id: MessageId(row.try_get("id").map_err(RepoError::Internal)?),
        group_id: GroupId(row.try_get("group_id").map_err(RepoError::Internal)?),
        text: row.try_get("text").map_err(RepoError::Internal)?,
        is_active: row.try_get("is_active").map_err(RepoError::Internal)?,
        usage_count: row.try_get("usage_count").map_err(RepoError::Internal)?,
    })
}

#[async_trait]
impl MessageRepo for DbMessageRepo<PostgresPool> {
    #[instrument(skip(self), fields(repo = "message", op = "pick_random_active"))]
    async fn pick_random_active(&self, group_id: GroupId) -> Result<Option<Message>, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT id, group_id, text, is_active, usage_count
            FROM messages
            WHERE group_id = $1 AND is_active
            ORDER BY random()
            LIMIT 1
            "#,
        )
        .bind(group_id.0)
        .fetch_optional(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        row.as_ref().map(row_to_message).transpose()
    }

    #[instrument(skip(self), fields(repo = "message", op = "record_usage"))]
    async fn record_usage(&self, message_id: MessageId) -> Result<(), RepoError> {
        sqlx::query("UPDATE messages SET usage_count = usage_count + 1 WHERE id = $1")
            .bind(message_id.0)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }
}
