//! Failure taxonomy of the pipeline.
//!
//! Oracle faults (a completion missing its marker) never show up here: each
//! stage substitutes its fallback and keeps going. What remains are the
//! conditions a caller has to act on.

use thiserror::Error;

use crate::models::AmbiguityReport;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("question has no data sources")]
    EmptyDataSources,

    #[error("schema link references unknown column or table: {reference}")]
    UnresolvedReference { reference: String },

    #[error("oracle call failed: {0:#}")]
    Oracle(anyhow::Error),

    #[error("schema catalog error: {0:#}")]
    Catalog(anyhow::Error),

    #[error("conversation store error: {0:#}")]
    Session(anyhow::Error),

    #[error("clarification required: {}", .0.clarification_statement)]
    ClarificationRequired(Box<AmbiguityReport>),

    #[error("SQL still failing after {attempts} repair attempts: {last_error} (last SQL: {last_sql})")]
    RepairExhausted {
        attempts: u32,
        last_sql: String,
        last_error: String,
    },

    #[error("pipeline cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
