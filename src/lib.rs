//! # din-sql
//!
//! Translates a free-text analytical question over one or more tables into
//! a verified SQL statement.
//!
//! A question passes through schema linking, an ambiguity check that may
//! halt for clarification, complexity classification, strategy-dispatched
//! synthesis, and an execution-guided repair loop. Every stage but the last
//! is driven by a text-completion [`oracle`]; the last runs the statement
//! against a read-only [`catalog::Store`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌────────┐
//! │ Question │──▶│ Linker │──▶│ Ambiguity │──▶│ Classify │──▶│ Synthesize│──▶│ Repair │──▶ SQL
//! └──────────┘   └────────┘   └─────┬─────┘   └──────────┘   └───────────┘   └───┬────┘
//!                                   ▼                                            │
//!                           AmbiguityReport                              SQLite (read-only)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! din init
//! din describe facebook_ads google_ads
//! din check "What are the clicks for each date?" -t facebook_ads -t google_ads --session s1
//! din check "both" -t facebook_ads -t google_ads --session s1
//! din sql "Find the buildings with capacity over 50" -t classroom
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`catalog`] | Store trait, SQLite store, schema catalog |
//! | [`oracle`] | Text-completion oracle abstraction |
//! | [`parse`] | Marker contract for oracle completions |
//! | [`prompt`] | Prompt builders |
//! | [`linker`] | Schema linking |
//! | [`ambiguity`] | Ambiguity detection and question rewrite |
//! | [`classifier`] | Complexity classification |
//! | [`synth`] | SQL synthesis strategies |
//! | [`repair`] | Execution-guided repair |
//! | [`pipeline`] | End-to-end orchestration |
//! | [`conversation`] | Persistent disambiguation sessions |
//! | [`db`] | Database connections |
//! | [`migrate`] | Schema migrations |

pub mod ambiguity;
pub mod catalog;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod linker;
pub mod migrate;
pub mod models;
pub mod oracle;
pub mod parse;
pub mod pipeline;
pub mod prompt;
pub mod repair;
pub mod synth;

pub use error::{PipelineError, Result};
pub use pipeline::{AmbiguityCheck, CancelToken, Outcome, Pipeline};
