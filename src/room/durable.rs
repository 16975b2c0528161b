use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::shared::StoreError;

/// Durable record of one room lifetime (`room_info` table)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RoomSession {
    pub id: i64,
    pub room_id: String,
    pub room_sid: String,
    pub is_running: bool,
    pub joined_participants: i32,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durable-storage client used by the room store and the scheduler
#[async_trait]
pub trait RoomInfoRepository: Send + Sync {
    /// The running session of a room, if any
    async fn active_session(&self, room_id: &str) -> Result<Option<RoomSession>, StoreError>;

    async fn insert_session(&self, room_id: &str, room_sid: &str)
        -> Result<RoomSession, StoreError>;

    /// Marks a session ended. Ending an already ended session is a no-op.
    async fn mark_ended(&self, room_sid: &str) -> Result<(), StoreError>;

    async fn active_sessions(&self) -> Result<Vec<RoomSession>, StoreError>;

    async fn update_participants(&self, room_sid: &str, count: i32) -> Result<(), StoreError>;
}

/// In-memory implementation for development and testing
pub struct InMemoryRoomInfoRepository {
    sessions: Mutex<BTreeMap<i64, RoomSession>>,
}

impl Default for InMemoryRoomInfoRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRoomInfoRepository {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every session ever recorded, running or not
    pub async fn all_sessions(&self) -> Vec<RoomSession> {
        self.sessions.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl RoomInfoRepository for InMemoryRoomInfoRepository {
    async fn active_session(&self, room_id: &str) -> Result<Option<RoomSession>, StoreError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .rev()
            .find(|s| s.room_id == room_id && s.is_running)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn insert_session(
        &self,
        room_id: &str,
        room_sid: &str,
    ) -> Result<RoomSession, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let id = sessions.keys().next_back().copied().unwrap_or(0) + 1;
        let session = RoomSession {
            id,
            room_id: room_id.to_string(),
            room_sid: room_sid.to_string(),
            is_running: true,
            joined_participants: 0,
            created_at: Utc::now(),
            ended_at: None,
        };
        sessions.insert(id, session.clone());

        debug!(room_id = %room_id, db_table_id = id, "Room session recorded in memory");
        Ok(session)
    }

    async fn mark_ended(&self, room_sid: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.room_sid == room_sid && session.is_running {
                session.is_running = false;
                session.ended_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<RoomSession>, StoreError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.values().filter(|s| s.is_running).cloned().collect())
    }

    async fn update_participants(&self, room_sid: &str, count: i32) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut().filter(|s| s.room_sid == room_sid) {
            session.joined_participants = count;
        }
        Ok(())
    }
}

/// PostgreSQL implementation of the room info repository
pub struct PostgresRoomInfoRepository {
    pool: PgPool,
}

impl PostgresRoomInfoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `room_info` table when it does not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS room_info (
                id BIGSERIAL PRIMARY KEY,
                room_id TEXT NOT NULL,
                room_sid TEXT NOT NULL UNIQUE,
                is_running BOOLEAN NOT NULL DEFAULT TRUE,
                joined_participants INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(durable_error)?;
        Ok(())
    }
}

const SESSION_COLUMNS: &str =
    "id, room_id, room_sid, is_running, joined_participants, created_at, ended_at";

fn durable_error(e: sqlx::Error) -> StoreError {
    warn!(error = %e, "Room info query failed");
    StoreError::Durable(e.to_string())
}

#[async_trait]
impl RoomInfoRepository for PostgresRoomInfoRepository {
    #[instrument(skip(self))]
    async fn active_session(&self, room_id: &str) -> Result<Option<RoomSession>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM room_info WHERE room_id = $1 AND is_running = TRUE ORDER BY id DESC LIMIT 1"
        );
        sqlx::query_as::<_, RoomSession>(&query)
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(durable_error)
    }

    #[instrument(skip(self))]
    async fn insert_session(
        &self,
        room_id: &str,
        room_sid: &str,
    ) -> Result<RoomSession, StoreError> {
        let query = format!(
            "INSERT INTO room_info (room_id, room_sid, is_running, joined_participants, created_at) VALUES ($1, $2, TRUE, 0, $3) RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, RoomSession>(&query)
            .bind(room_id)
            .bind(room_sid)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(durable_error)?;

        debug!(room_id = %room_id, db_table_id = session.id, "Room session recorded");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn mark_ended(&self, room_sid: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE room_info SET is_running = FALSE, ended_at = $2 WHERE room_sid = $1 AND is_running = TRUE",
        )
        .bind(room_sid)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(durable_error)?;
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<RoomSession>, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM room_info WHERE is_running = TRUE");
        sqlx::query_as::<_, RoomSession>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(durable_error)
    }

    async fn update_participants(&self, room_sid: &str, count: i32) -> Result<(), StoreError> {
        sqlx::query("UPDATE room_info SET joined_participants = $2 WHERE room_sid = $1")
            .bind(room_sid)
            .bind(count)
            .execute(&self.pool)
            .await
            .map_err(durable_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_session_lifecycle() {
        let repo = InMemoryRoomInfoRepository::new();
        let first = repo.insert_session("r1", "sid-1").await.unwrap();
        assert_eq!(first.id, 1);

        let active = repo.active_session("r1").await.unwrap().unwrap();
        assert_eq!(active.room_sid, "sid-1");

        repo.update_participants("sid-1", 3).await.unwrap();
        repo.mark_ended("sid-1").await.unwrap();
        repo.mark_ended("sid-1").await.unwrap();

        assert!(repo.active_session("r1").await.unwrap().is_none());
        assert!(repo.active_sessions().await.unwrap().is_empty());

        let all = repo.all_sessions().await;
        assert_eq!(all[0].joined_participants, 3);
        assert!(all[0].ended_at.is_some());
    }
}
