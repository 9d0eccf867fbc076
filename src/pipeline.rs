//! End-to-end orchestration.
//!
//! ```text
//! Question ─▶ SchemaLinker ─▶ AmbiguityResolver ─▶ ComplexityClassifier
//!                                  │                        │
//!                            (clarification)                ▼
//!                                  ▼              SqlSynthesizer ─▶ ExecutionRepairLoop ─▶ SQL
//!                           AmbiguityReport
//! ```
//!
//! Stages run strictly in sequence. A [`CancelToken`] is checked between
//! stages, never during an oracle call. A [`Pipeline`] holds no per-request
//! state, so independent questions may share one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ambiguity::AmbiguityResolver;
use crate::catalog::{ResultSet, SchemaCatalog, Store};
use crate::classifier::ComplexityClassifier;
use crate::config::PipelineConfig;
use crate::conversation::ConversationStore;
use crate::error::{PipelineError, Result};
use crate::linker::SchemaLinker;
use crate::models::{
    AmbiguityReport, Classification, DataSourceSchema, GeneratedSql, Question, SchemaLink,
};
use crate::oracle::Oracle;
use crate::repair::ExecutionRepairLoop;
use crate::synth::SqlSynthesizer;

const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Cooperative cancellation shared between a caller and a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, next_stage: &str) -> Result<()> {
        if self.is_cancelled() {
            info!(stage = next_stage, "pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// A verified statement and how it was reached.
#[derive(Debug, Clone)]
pub struct SqlAnswer {
    /// The question text the statement answers, after any rewrite.
    pub question: String,
    pub link: SchemaLink,
    pub classification: Classification,
    pub sql: GeneratedSql,
    pub result: ResultSet,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Sql(SqlAnswer),
    NeedsClarification(AmbiguityReport),
}

/// Result of [`Pipeline::check_ambiguous_columns`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmbiguityCheck {
    Ambiguous(AmbiguityReport),
    /// The question, rewritten if a prior answer was applied.
    Resolved(String),
}

pub struct Pipeline {
    catalog: SchemaCatalog,
    linker: SchemaLinker,
    resolver: AmbiguityResolver,
    classifier: ComplexityClassifier,
    synthesizer: SqlSynthesizer,
    repair: ExecutionRepairLoop,
}

impl Pipeline {
    pub fn new(oracle: Arc<dyn Oracle>, store: Arc<dyn Store>, config: &PipelineConfig) -> Self {
        Self::with_options(oracle, store, config, "main", DEFAULT_MAX_TOKENS)
    }

    pub fn with_options(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn Store>,
        config: &PipelineConfig,
        db_schema: &str,
        max_tokens: u32,
    ) -> Self {
        Self {
            catalog: SchemaCatalog::new(store.clone(), db_schema),
            linker: SchemaLinker::new(oracle.clone(), max_tokens),
            resolver: AmbiguityResolver::new(
                oracle.clone(),
                max_tokens,
                config.suggestion_threshold,
            ),
            classifier: ComplexityClassifier::new(oracle.clone(), max_tokens),
            synthesizer: SqlSynthesizer::new(oracle.clone(), max_tokens),
            repair: ExecutionRepairLoop::new(oracle, store, max_tokens, config.max_repair_attempts)
                .with_empty_result_repair(config.repair_empty_results),
        }
    }

    /// Build a question over the named tables of the store.
    pub async fn question(&self, text: &str, tables: &[String]) -> Result<Question> {
        Ok(Question::new(text, self.describe(tables).await?))
    }

    pub async fn describe(&self, tables: &[String]) -> Result<Vec<DataSourceSchema>> {
        self.catalog.load(tables).await.map_err(PipelineError::Catalog)
    }

    /// The rendered schema link, `[t.a,t.b = u.b,50]`.
    pub async fn schema_links(&self, question: &Question) -> Result<String> {
        Ok(self.linker.link(question).await?.render())
    }

    /// Check a question for ambiguity. With a prior report and answer, the
    /// question is rewritten first and the rewrite is checked.
    pub async fn check_ambiguous_columns(
        &self,
        question: &Question,
        prior: Option<(&AmbiguityReport, &str)>,
    ) -> Result<AmbiguityCheck> {
        let question = match prior {
            Some((report, answer)) => {
                self.resolver
                    .update_question(question, report, answer)
                    .await?
            }
            None => question.clone(),
        };

        Ok(match self.resolver.check(&question).await? {
            Some(report) => AmbiguityCheck::Ambiguous(report),
            None => AmbiguityCheck::Resolved(question.text),
        })
    }

    /// Verified SQL for the question. An ambiguous question is an error
    /// carrying the report.
    pub async fn din_sql(&self, question: &Question) -> Result<String> {
        match self.run(question).await? {
            Outcome::Sql(answer) => Ok(answer.sql.sql),
            Outcome::NeedsClarification(report) => {
                Err(PipelineError::ClarificationRequired(Box::new(report)))
            }
        }
    }

    pub async fn run(&self, question: &Question) -> Result<Outcome> {
        self.run_with_cancel(question, &CancelToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        question: &Question,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        info!(
            question = %question.text,
            sources = question.data_sources.len(),
            "pipeline started"
        );

        cancel.check("link")?;
        // An unresolved reference may stem from an ambiguous term, so it is
        // only raised once the ambiguity check has passed.
        let linked = match self.linker.link(question).await {
            Ok(link) => Ok(link),
            Err(e @ PipelineError::UnresolvedReference { .. }) => Err(e),
            Err(e) => return Err(e),
        };

        cancel.check("ambiguity")?;
        if let Some(report) = self.resolver.check(question).await? {
            if let Err(e) = &linked {
                debug!(error = %e, "link error superseded by clarification");
            }
            return Ok(Outcome::NeedsClarification(report));
        }
        let link = linked?;
        if link.is_empty() {
            warn!("schema link is empty; the synthesized SQL may be unreliable");
        }

        cancel.check("classify")?;
        let classification = self.classifier.classify(question, &link).await?;

        cancel.check("synthesize")?;
        let candidate = self
            .synthesizer
            .synthesize(question, &link, &classification)
            .await?;

        cancel.check("repair")?;
        let verified = self.repair.repair(question, candidate).await?;

        info!(
            class = %verified.sql.class,
            attempts = verified.sql.attempts,
            "pipeline finished"
        );
        Ok(Outcome::Sql(SqlAnswer {
            question: question.text.clone(),
            link,
            classification,
            sql: verified.sql,
            result: verified.result,
        }))
    }

    /// One turn of a disambiguation session.
    ///
    /// If the session's last turn is waiting for clarification, `message` is
    /// the answer: the original question is rewritten with it and the
    /// pipeline restarts from linking. Otherwise `message` is a new question.
    pub async fn converse(
        &self,
        conversations: &ConversationStore,
        session_id: &str,
        message: &str,
        data_sources: Vec<DataSourceSchema>,
    ) -> Result<Outcome> {
        let state = conversations
            .load(session_id)
            .await
            .map_err(PipelineError::Session)?;

        let question = match state.pending_clarification() {
            Some((turn_index, _, report)) => {
                let original = Question::new(report.original_question.clone(), data_sources);
                let rewritten = self
                    .resolver
                    .update_question(&original, report, message)
                    .await?;
                conversations
                    .record_answer(session_id, turn_index as i64, message)
                    .await
                    .map_err(PipelineError::Session)?;
                debug!(session = session_id, question = %rewritten.text, "clarification applied");
                rewritten
            }
            None => Question::new(message, data_sources),
        };

        let outcome = self.run(&question).await;
        let clarification = match &outcome {
            Ok(Outcome::NeedsClarification(report)) => Some(report),
            _ => None,
        };
        conversations
            .append(session_id, &question.text, clarification)
            .await
            .map_err(PipelineError::Session)?;

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check("link").is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check("link"), Err(PipelineError::Cancelled)));
    }
}
