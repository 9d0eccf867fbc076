use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // One row per conversation turn; a pending clarification has
    // clarification_json set and answer NULL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            session_id TEXT NOT NULL,
            turn_index INTEGER NOT NULL,
            question TEXT NOT NULL,
            clarification_json TEXT,
            answer TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, turn_index)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversation_turns_created_at ON conversation_turns(created_at DESC)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
