//! Conversation repository

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// A conversation owned by the voice loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One side of an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Who spoke a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Persistence for conversations and their turns
pub trait ConversationStore: Send + Sync {
    /// # Errors
    ///
    /// Returns error if the database operation fails
    fn create_conversation(&self, title: Option<&str>) -> Result<Conversation>;

    /// # Errors
    ///
    /// Returns error if the database operation fails
    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Append a turn; the conversation must exist
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is unknown or the write fails
    fn append_turn(&self, conversation_id: &str, role: TurnRole, content: &str) -> Result<Turn>;

    /// Most recent `limit` turns, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    fn recent_turns(&self, conversation_id: &str, limit: usize) -> Result<Vec<Turn>>;
}

/// SQLite-backed conversation store
#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: DbPool,
}

impl SqliteConversationStore {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }
}

impl ConversationStore for SqliteConversationStore {
    fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let conn = self.conn()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        conn.execute(
            "INSERT INTO conversations (id, title, source, created_at, updated_at)
             VALUES (?1, ?2, 'voice', ?3, ?3)",
            rusqlite::params![&id, title, &now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(conversation_id = %id, "conversation created");

        Ok(Conversation {
            id,
            title: title.map(String::from),
            source: "voice".to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;

        let result = conn.query_row(
            "SELECT id, title, source, created_at, updated_at FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    source: row.get(2)?,
                    created_at: parse_datetime(&row.get::<_, String>(3)?),
                    updated_at: parse_datetime(&row.get::<_, String>(4)?),
                })
            },
        );

        match result {
            Ok(conversation) => Ok(Some(conversation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    fn append_turn(&self, conversation_id: &str, role: TurnRole, content: &str) -> Result<Turn> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let updated = tx
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                [&now_str, conversation_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if updated == 0 {
            return Err(Error::Database(format!(
                "unknown conversation: {conversation_id}"
            )));
        }

        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO turns (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![&id, conversation_id, role.as_str(), content, &now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(Turn {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    fn recent_turns(&self, conversation_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, created_at
                 FROM turns WHERE conversation_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let turns = stmt
            .query_map(rusqlite::params![conversation_id, limit as i64], |row| {
                Ok(Turn {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: TurnRole::parse(&row.get::<_, String>(2)?).unwrap_or(TurnRole::User),
                    content: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect::<Vec<_>>();

        // Chronological order
        Ok(turns.into_iter().rev().collect())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
