//! SQL synthesis, one strategy per complexity class.
//!
//! | Class | Strategy |
//! |-------|----------|
//! | EASY | Direct translation; the completion is the statement |
//! | NON-NESTED | Intermediate representation, statement after `SQL: ` |
//! | NESTED | Solve each sub-question first, then the outer statement |
//!
//! A completion that yields no statement becomes the sentinel
//! [`SENTINEL_SQL`](crate::models::SENTINEL_SQL), which the repair loop
//! rejects on its first execution.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{Classification, ComplexityClass, GeneratedSql, Question, SchemaLink};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::prompt;

pub struct SqlSynthesizer {
    oracle: Arc<dyn Oracle>,
    max_tokens: u32,
}

impl SqlSynthesizer {
    pub fn new(oracle: Arc<dyn Oracle>, max_tokens: u32) -> Self {
        Self { oracle, max_tokens }
    }

    /// Dispatch on the classification.
    pub async fn synthesize(
        &self,
        question: &Question,
        link: &SchemaLink,
        classification: &Classification,
    ) -> Result<GeneratedSql> {
        let generated = match classification.class {
            ComplexityClass::Easy => self.easy(question, link).await?,
            ComplexityClass::NonNested => self.non_nested(question, link).await?,
            ComplexityClass::Nested => {
                self.nested(question, link, &classification.sub_questions)
                    .await?
            }
        };
        debug!(class = %generated.class, sql = %generated.sql, "synthesized candidate");
        Ok(generated)
    }

    pub async fn easy(&self, question: &Question, link: &SchemaLink) -> Result<GeneratedSql> {
        let prompt = prompt::easy_prompt(question, link);
        let completion =
            oracle::ask(self.oracle.as_ref(), "synthesize_easy", &prompt, self.max_tokens).await?;
        Ok(candidate(parse_direct_sql(&completion), ComplexityClass::Easy))
    }

    pub async fn non_nested(&self, question: &Question, link: &SchemaLink) -> Result<GeneratedSql> {
        let prompt = prompt::non_nested_prompt(question, link);
        let completion = oracle::ask(
            self.oracle.as_ref(),
            "synthesize_non_nested",
            &prompt,
            self.max_tokens,
        )
        .await?;
        Ok(candidate(parse_marked_sql(&completion), ComplexityClass::NonNested))
    }

    /// Sub-questions are synthesized against the same link; those whose link
    /// carries join edges use the NON-NESTED strategy, the rest EASY.
    pub async fn nested(
        &self,
        question: &Question,
        link: &SchemaLink,
        sub_questions: &[String],
    ) -> Result<GeneratedSql> {
        let mut solved = Vec::with_capacity(sub_questions.len());
        for sub in sub_questions {
            let sub_question = question.with_text(sub.as_str());
            let sub_sql = if link.joins().next().is_some() {
                self.non_nested(&sub_question, link).await?
            } else {
                self.easy(&sub_question, link).await?
            };
            debug!(sub_question = %sub, sql = %sub_sql.sql, "solved sub-question");
            solved.push((sub.clone(), sub_sql.sql));
        }

        let prompt = prompt::nested_prompt(question, link, &solved);
        let completion = oracle::ask(
            self.oracle.as_ref(),
            "synthesize_nested",
            &prompt,
            self.max_tokens,
        )
        .await?;
        Ok(candidate(parse_marked_sql(&completion), ComplexityClass::Nested))
    }
}

fn candidate(sql: Option<String>, class: ComplexityClass) -> GeneratedSql {
    match sql {
        Some(sql) => GeneratedSql::new(sql, class),
        None => {
            warn!(class = %class, "no SQL in completion, using sentinel statement");
            GeneratedSql::sentinel(class)
        }
    }
}

/// EASY completions continue the `SQL: ` cue, so the text itself is the
/// statement. An echoed marker is tolerated.
pub fn parse_direct_sql(completion: &str) -> Option<String> {
    let body = parse::SQL.extract(completion).unwrap_or(completion);
    parse::clean_sql(first_paragraph(body))
}

/// Statement after the `SQL: ` marker; `None` if the marker is missing.
pub fn parse_marked_sql(completion: &str) -> Option<String> {
    let body = parse::SQL.extract(completion)?;
    parse::clean_sql(first_paragraph(body))
}

/// Stop at the first blank line or the start of another worked example.
fn first_paragraph(text: &str) -> &str {
    let text = text.trim_start();
    let mut end = text.len();
    for stop in ["\n\n", "\nQ:", "\nIntermediate_representation:"] {
        if let Some(pos) = text.find(stop) {
            end = end.min(pos);
        }
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, ColumnRef, DataSourceSchema, JoinEdge, LinkItem};
    use crate::oracle::ScriptedOracle;

    fn question(text: &str) -> Question {
        Question::new(
            text,
            vec![
                DataSourceSchema {
                    table_name: "customer".into(),
                    db_schema: "main".into(),
                    columns: vec![
                        Column {
                            name: "customer_id".into(),
                            declared_type: "INTEGER".into(),
                        },
                        Column {
                            name: "name".into(),
                            declared_type: "TEXT".into(),
                        },
                    ],
                },
                DataSourceSchema {
                    table_name: "orders".into(),
                    db_schema: "main".into(),
                    columns: vec![
                        Column {
                            name: "order_id".into(),
                            declared_type: "INTEGER".into(),
                        },
                        Column {
                            name: "customer_id".into(),
                            declared_type: "INTEGER".into(),
                        },
                    ],
                },
            ],
        )
    }

    #[test]
    fn test_parse_direct_sql() {
        assert_eq!(
            parse_direct_sql(" SELECT building FROM classroom WHERE capacity > 50\n\nQ: next"),
            Some("SELECT building FROM classroom WHERE capacity > 50".to_string())
        );
        assert_eq!(parse_direct_sql("SQL: SELECT 1;"), Some("SELECT 1".to_string()));
        assert_eq!(parse_direct_sql("   "), None);
    }

    #[test]
    fn test_parse_marked_sql() {
        let completion = " select customer.name from customer join orders\nSQL: SELECT T1.name FROM customer AS T1 JOIN orders AS T2 ON T1.customer_id = T2.customer_id";
        assert_eq!(
            parse_marked_sql(completion).as_deref(),
            Some("SELECT T1.name FROM customer AS T1 JOIN orders AS T2 ON T1.customer_id = T2.customer_id")
        );
        assert_eq!(parse_marked_sql("select name from customer"), None);
    }

    #[tokio::test]
    async fn test_missing_marker_yields_sentinel() {
        let oracle = Arc::new(ScriptedOracle::new(["I would join the tables."]));
        let synth = SqlSynthesizer::new(oracle, 100);
        let generated = synth
            .non_nested(&question("Names?"), &SchemaLink::empty())
            .await
            .unwrap();
        assert!(generated.is_sentinel());
        assert_eq!(generated.class, ComplexityClass::NonNested);
        assert_eq!(generated.attempts, 0);
    }

    #[tokio::test]
    async fn test_nested_solves_sub_questions_first() {
        let oracle = Arc::new(ScriptedOracle::new([
            "SQL: SELECT customer_id FROM orders",
            " select customer.name from customer where @.@ not in orders.customer_id\nSQL: SELECT name FROM customer WHERE customer_id NOT IN (SELECT customer_id FROM orders)",
        ]));
        let synth = SqlSynthesizer::new(oracle.clone(), 100);
        let link = SchemaLink {
            items: vec![LinkItem::Join(JoinEdge::new(
                ColumnRef::new("customer", "customer_id"),
                ColumnRef::new("orders", "customer_id"),
            ))],
        };
        let classification = Classification {
            class: ComplexityClass::Nested,
            sub_questions: vec!["Which customers have placed an order?".into()],
        };

        let generated = synth
            .synthesize(&question("Which customers have never ordered?"), &link, &classification)
            .await
            .unwrap();
        assert_eq!(
            generated.sql,
            "SELECT name FROM customer WHERE customer_id NOT IN (SELECT customer_id FROM orders)"
        );

        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("Q: \"Which customers have placed an order?\""));
        assert!(prompts[1].contains("is SELECT customer_id FROM orders"));
    }
}
