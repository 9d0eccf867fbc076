//! Persistent disambiguation sessions.
//!
//! Turns live in the `conversation_turns` table of the application database
//! (see [`crate::migrate`]). A turn that asked for clarification stores the
//! [`AmbiguityReport`] as JSON; the user's reply is recorded on that same
//! turn. Sessions are never expired here; callers delete them.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::{AmbiguityReport, ConversationState, ConversationTurn};

pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the application database. Migrations must have run.
    pub async fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// All turns of a session, oldest first. Unknown sessions are empty.
    pub async fn load(&self, session_id: &str) -> Result<ConversationState> {
        let rows = sqlx::query(
            "SELECT question, clarification_json, answer, created_at FROM conversation_turns WHERE session_id = ? ORDER BY turn_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            let clarification_json: Option<String> = row.get("clarification_json");
            let clarification = clarification_json
                .map(|json| serde_json::from_str::<AmbiguityReport>(&json))
                .transpose()
                .with_context(|| format!("Corrupt clarification in session {}", session_id))?;

            turns.push(ConversationTurn {
                question: row.get("question"),
                clarification,
                answer: row.get("answer"),
                created_at: row.get("created_at"),
            });
        }

        Ok(ConversationState {
            session_id: session_id.to_string(),
            turns,
        })
    }

    /// Append a turn and return its index.
    pub async fn append(
        &self,
        session_id: &str,
        question: &str,
        clarification: Option<&AmbiguityReport>,
    ) -> Result<i64> {
        let clarification_json = clarification.map(serde_json::to_string).transpose()?;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(turn_index) + 1, 0) AS next FROM conversation_turns WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?
        .get("next");

        sqlx::query(
            "INSERT INTO conversation_turns (session_id, turn_index, question, clarification_json, answer, created_at) VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(session_id)
        .bind(next)
        .bind(question)
        .bind(clarification_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(next)
    }

    /// Record the user's reply to the clarification asked at `turn_index`.
    pub async fn record_answer(&self, session_id: &str, turn_index: i64, answer: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversation_turns SET answer = ? WHERE session_id = ? AND turn_index = ?",
        )
        .bind(answer)
        .bind(session_id)
        .bind(turn_index)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no turn {} in session {}", turn_index, session_id);
        }
        Ok(())
    }

    /// Delete a session. Returns the number of turns removed.
    pub async fn delete(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversation_turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
