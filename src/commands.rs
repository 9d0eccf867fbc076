//! CLI command implementations for the `din` binary.
//!
//! Each `run_*` function loads what it needs from the config, prints its
//! result to stdout, and closes its connections.

use anyhow::Result;
use std::sync::Arc;

use crate::catalog::{SqliteStore, Store};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::oracle::create_oracle;
use crate::pipeline::{AmbiguityCheck, Outcome, Pipeline};

/// Open the store read-only and wire a pipeline to the configured oracle.
pub async fn open_pipeline(config: &Config) -> Result<(Pipeline, Arc<SqliteStore>)> {
    let store = Arc::new(
        SqliteStore::open(&config.store.path)
            .await?
            .with_dialect(config.store.dialect.clone()),
    );
    let oracle = Arc::from(create_oracle(&config.oracle)?);
    let pipeline = Pipeline::with_options(
        oracle,
        store.clone() as Arc<dyn Store>,
        &config.pipeline,
        &config.store.db_schema,
        config.oracle.max_tokens,
    );
    Ok((pipeline, store))
}

pub async fn run_describe(config: &Config, tables: &[String]) -> Result<()> {
    let (pipeline, store) = open_pipeline(config).await?;
    let sources = pipeline.describe(tables).await;
    store.close().await;

    for source in sources? {
        println!("{}.{}", source.db_schema, source.table_name);
        for column in &source.columns {
            println!("  {:<24} {}", column.name, column.declared_type);
        }
    }
    Ok(())
}

pub async fn run_link(config: &Config, question: &str, tables: &[String]) -> Result<()> {
    let (pipeline, store) = open_pipeline(config).await?;
    let result = async {
        let question = pipeline.question(question, tables).await?;
        pipeline.schema_links(&question).await
    }
    .await;
    store.close().await;

    println!("{}", result?);
    Ok(())
}

pub async fn run_check(
    config: &Config,
    question: &str,
    tables: &[String],
    session: Option<&str>,
) -> Result<()> {
    if let Some(session_id) = session {
        return run_session_turn(config, session_id, question, tables).await;
    }

    let (pipeline, store) = open_pipeline(config).await?;
    let result = async {
        let question = pipeline.question(question, tables).await?;
        pipeline.check_ambiguous_columns(&question, None).await
    }
    .await;
    store.close().await;

    match result? {
        AmbiguityCheck::Ambiguous(report) => println!("{}", report.clarification_statement),
        AmbiguityCheck::Resolved(text) => println!("Resolved: {}", text),
    }
    Ok(())
}

/// Feed one message into a session: a new question, or the answer to the
/// session's pending clarification.
async fn run_session_turn(
    config: &Config,
    session_id: &str,
    message: &str,
    tables: &[String],
) -> Result<()> {
    let (pipeline, store) = open_pipeline(config).await?;
    let conversations = ConversationStore::open(config).await?;

    let result = async {
        let sources = pipeline.describe(tables).await?;
        pipeline
            .converse(&conversations, session_id, message, sources)
            .await
    }
    .await;
    conversations.close().await;
    store.close().await;

    print_outcome(result?, false);
    Ok(())
}

pub async fn run_sql(
    config: &Config,
    question: &str,
    tables: &[String],
    show_rows: bool,
) -> Result<()> {
    let (pipeline, store) = open_pipeline(config).await?;
    let result = async {
        let question = pipeline.question(question, tables).await?;
        pipeline.run(&question).await
    }
    .await;
    store.close().await;

    print_outcome(result?, show_rows);
    Ok(())
}

fn print_outcome(outcome: Outcome, show_rows: bool) {
    match outcome {
        Outcome::Sql(answer) => {
            println!("{}", answer.sql.sql);
            if show_rows {
                match serde_json::to_string_pretty(&answer.result) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("Could not render rows: {}", e),
                }
            }
        }
        Outcome::NeedsClarification(report) => {
            println!("Clarification needed: {}", report.clarification_statement);
        }
    }
}

pub async fn run_history(config: &Config, session_id: &str) -> Result<()> {
    let conversations = ConversationStore::open(config).await?;
    let state = conversations.load(session_id).await;
    conversations.close().await;
    let state = state?;

    if state.turns.is_empty() {
        println!("No turns in session {}.", session_id);
        return Ok(());
    }

    for (idx, turn) in state.turns.iter().enumerate() {
        let when = chrono::DateTime::<chrono::Utc>::from_timestamp(turn.created_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| turn.created_at.to_string());
        println!("[{}] {}  {}", idx, when, turn.question);
        if let Some(report) = &turn.clarification {
            println!("    clarification: {}", report.clarification_statement);
        }
        if let Some(answer) = &turn.answer {
            println!("    answer: {}", answer);
        }
    }
    Ok(())
}
