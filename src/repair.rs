//! Execution-guided repair.
//!
//! A candidate is executed against the store; on failure the verbatim error
//! goes back to the oracle with the question and the failing statement, and
//! the corrected statement is tried next. The loop stops on the first
//! success or when the budget of repair rounds is spent, which is fatal.

use chrono::Local;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{ResultSet, Store};
use crate::error::{PipelineError, Result};
use crate::models::{GeneratedSql, Question};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::prompt;
use crate::synth;

/// Failure text used when an empty result is treated as an error.
pub const EMPTY_RESULT_ERROR: &str = "query returned no rows";

pub struct ExecutionRepairLoop {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn Store>,
    max_tokens: u32,
    max_attempts: u32,
    repair_empty_results: bool,
}

/// A statement that ran, and what it returned.
#[derive(Debug, Clone)]
pub struct Verified {
    pub sql: GeneratedSql,
    pub result: ResultSet,
}

impl ExecutionRepairLoop {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn Store>,
        max_tokens: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            oracle,
            store,
            max_tokens,
            max_attempts,
            repair_empty_results: false,
        }
    }

    /// Treat an empty result from a joined query as a failure.
    pub fn with_empty_result_repair(mut self, enabled: bool) -> Self {
        self.repair_empty_results = enabled;
        self
    }

    /// Execute `candidate`, repairing it until it runs.
    ///
    /// At most `max_attempts` repair rounds follow the first execution.
    pub async fn repair(&self, question: &Question, candidate: GeneratedSql) -> Result<Verified> {
        let mut current = candidate;

        loop {
            let error = match self.store.execute(&current.sql).await {
                Ok(result) if self.rejects_empty(&current, &result) => {
                    debug!(sql = %current.sql, "joined query returned no rows");
                    EMPTY_RESULT_ERROR.to_string()
                }
                Ok(result) => {
                    info!(
                        attempts = current.attempts,
                        rows = result.rows.len(),
                        "SQL verified"
                    );
                    return Ok(Verified {
                        sql: current,
                        result,
                    });
                }
                Err(e) => e.message,
            };

            if current.attempts >= self.max_attempts {
                warn!(attempts = current.attempts, error = %error, "repair budget exhausted");
                return Err(PipelineError::RepairExhausted {
                    attempts: current.attempts,
                    last_sql: current.sql,
                    last_error: error,
                });
            }

            info!(
                attempt = current.attempts + 1,
                error = %error,
                "repairing SQL"
            );
            let prompt = prompt::repair_prompt(
                question,
                &current.sql,
                &error,
                self.store.dialect(),
                Local::now().date_naive(),
            );
            let completion =
                oracle::ask(self.oracle.as_ref(), "repair", &prompt, self.max_tokens).await?;

            current = match parse_repaired_sql(&completion) {
                Some(sql) => current.revised(sql),
                None => {
                    warn!(
                        marker = parse::SQL.field,
                        "no SQL in repair completion, using sentinel statement"
                    );
                    current.revised(crate::models::SENTINEL_SQL)
                }
            };
        }
    }

    fn rejects_empty(&self, candidate: &GeneratedSql, result: &ResultSet) -> bool {
        self.repair_empty_results
            && result.is_empty()
            && has_join(&candidate.sql)
    }
}

fn has_join(sql: &str) -> bool {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case("JOIN"))
}

/// Corrected statement: after `SQL: ` when present, otherwise the whole text.
fn parse_repaired_sql(completion: &str) -> Option<String> {
    synth::parse_direct_sql(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatabaseError;
    use crate::models::{Column, ComplexityClass};
    use crate::oracle::ScriptedOracle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts exactly one statement; everything else fails.
    struct OneGoodStatement {
        good: &'static str,
        rows: usize,
        executed: Mutex<Vec<String>>,
    }

    impl OneGoodStatement {
        fn new(good: &'static str, rows: usize) -> Self {
            Self {
                good,
                rows,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Store for OneGoodStatement {
        async fn describe_schema(&self, _t: &str, _s: &str) -> anyhow::Result<Vec<Column>> {
            Ok(Vec::new())
        }

        async fn execute(&self, sql: &str) -> std::result::Result<ResultSet, DatabaseError> {
            self.executed.lock().unwrap().push(sql.to_string());
            if sql == self.good {
                Ok(ResultSet {
                    columns: vec!["x".into()],
                    rows: vec![vec![serde_json::json!(1)]; self.rows],
                })
            } else {
                Err(DatabaseError::new(format!("near \"{}\": syntax error", sql)))
            }
        }

        fn dialect(&self) -> &str {
            "SQLite"
        }
    }

    fn question() -> Question {
        Question::new("How many?", Vec::new())
    }

    #[tokio::test]
    async fn test_success_first_attempt_makes_no_oracle_call() {
        let oracle = Arc::new(ScriptedOracle::new(Vec::<String>::new()));
        let store = Arc::new(OneGoodStatement::new("SELECT 1", 1));
        let repair = ExecutionRepairLoop::new(oracle.clone(), store, 100, 3);

        let verified = repair
            .repair(&question(), GeneratedSql::new("SELECT 1", ComplexityClass::Easy))
            .await
            .unwrap();
        assert_eq!(verified.sql.attempts, 0);
        assert!(oracle.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_is_repaired() {
        let oracle = Arc::new(ScriptedOracle::new(["SQL: SELECT 1"]));
        let store = Arc::new(OneGoodStatement::new("SELECT 1", 1));
        let repair = ExecutionRepairLoop::new(oracle.clone(), store, 100, 3);

        let verified = repair
            .repair(&question(), GeneratedSql::sentinel(ComplexityClass::Nested))
            .await
            .unwrap();
        assert_eq!(verified.sql.sql, "SELECT 1");
        assert_eq!(verified.sql.attempts, 1);

        let prompts = oracle.prompts();
        assert!(prompts[0].contains("Failing SQL: SELECT\n"));
        assert!(prompts[0].contains("Database error: near \"SELECT\": syntax error"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_fatal() {
        let oracle = Arc::new(ScriptedOracle::new(["SQL: SELECT a", "SQL: SELECT b"]));
        let store = Arc::new(OneGoodStatement::new("SELECT 1", 1));
        let repair = ExecutionRepairLoop::new(oracle.clone(), store.clone(), 100, 2);

        let err = repair
            .repair(&question(), GeneratedSql::new("SELECT z", ComplexityClass::Easy))
            .await
            .unwrap_err();
        match err {
            PipelineError::RepairExhausted {
                attempts,
                last_sql,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_sql, "SELECT b");
                assert_eq!(last_error, "near \"SELECT b\": syntax error");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.executed.lock().unwrap().len(), 3);
        assert_eq!(oracle.remaining(), 0);
    }

    #[tokio::test]
    async fn test_empty_join_result_is_repaired_when_enabled() {
        let joined = "SELECT a FROM t JOIN u ON t.id = u.id";
        let oracle = Arc::new(ScriptedOracle::new(["SQL: SELECT 1"]));
        let store = Arc::new(OneGoodStatement::new(joined, 0));
        let repair =
            ExecutionRepairLoop::new(oracle.clone(), store, 100, 1).with_empty_result_repair(true);

        let err = repair
            .repair(&question(), GeneratedSql::new(joined, ComplexityClass::NonNested))
            .await
            .unwrap_err();
        assert!(oracle.prompts()[0].contains(EMPTY_RESULT_ERROR));
        assert!(matches!(err, PipelineError::RepairExhausted { attempts: 1, .. }));
    }

    #[test]
    fn test_join_detection_ignores_layout() {
        assert!(has_join("SELECT a FROM t\nJOIN u ON t.id = u.id"));
        assert!(has_join("SELECT a FROM t LEFT join\n\tu USING (id)"));
        assert!(!has_join("SELECT joined_at FROM t_join_log"));
        assert!(!has_join("SELECT a FROM t"));
    }

    #[tokio::test]
    async fn test_empty_result_with_multiline_join_is_repaired() {
        let joined = "SELECT a\nFROM t\nJOIN u\nON t.id = u.id";
        let oracle = Arc::new(ScriptedOracle::new(["SQL: SELECT 1"]));
        let store = Arc::new(OneGoodStatement::new(joined, 0));
        let repair =
            ExecutionRepairLoop::new(oracle.clone(), store, 100, 1).with_empty_result_repair(true);

        let err = repair
            .repair(&question(), GeneratedSql::new(joined, ComplexityClass::NonNested))
            .await
            .unwrap_err();
        assert!(oracle.prompts()[0].contains(EMPTY_RESULT_ERROR));
        assert!(matches!(err, PipelineError::RepairExhausted { attempts: 1, .. }));
    }
}
