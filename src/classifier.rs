//! Complexity classification of a linked question.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{Classification, ComplexityClass, Question, SchemaLink};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::prompt;

pub struct ComplexityClassifier {
    oracle: Arc<dyn Oracle>,
    max_tokens: u32,
}

impl ComplexityClassifier {
    pub fn new(oracle: Arc<dyn Oracle>, max_tokens: u32) -> Self {
        Self { oracle, max_tokens }
    }

    pub async fn classify(&self, question: &Question, link: &SchemaLink) -> Result<Classification> {
        let prompt = prompt::classification_prompt(question, link);
        let completion =
            oracle::ask(self.oracle.as_ref(), "classify", &prompt, self.max_tokens).await?;

        let classification = parse_classification(&completion, link);
        debug!(
            class = %classification.class,
            sub_questions = classification.sub_questions.len(),
            "question classified"
        );
        Ok(classification)
    }
}

/// Read `Label: "..."` and the sub-question list, falling back to NESTED.
pub fn parse_classification(completion: &str, link: &SchemaLink) -> Classification {
    let label = parse::LABEL
        .extract_line(completion)
        .map(|l| l.trim_matches(|c: char| c == '"' || c == '\'' || c == '.').trim())
        .and_then(ComplexityClass::from_label);

    let class = match label {
        Some(class) => reconcile(class, link),
        None => {
            warn!(
                marker = parse::LABEL.field,
                "completion missing label, classifying as NESTED"
            );
            ComplexityClass::Nested
        }
    };

    let sub_questions = match class {
        ComplexityClass::Nested => parse::sub_questions(completion),
        _ => Vec::new(),
    };

    Classification {
        class,
        sub_questions,
    }
}

/// Correct labels the link contradicts. NESTED is never changed.
fn reconcile(class: ComplexityClass, link: &SchemaLink) -> ComplexityClass {
    let tables = link.tables().len();
    let has_joins = link.joins().next().is_some();

    match class {
        ComplexityClass::NonNested if tables <= 1 && !has_joins && !link.is_empty() => {
            debug!("NON-NESTED label on a single-table link, using EASY");
            ComplexityClass::Easy
        }
        ComplexityClass::Easy if tables >= 2 && has_joins => {
            debug!("EASY label on a joined link, using NON-NESTED");
            ComplexityClass::NonNested
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnRef, JoinEdge, LinkItem};

    fn single_table() -> SchemaLink {
        SchemaLink {
            items: vec![
                LinkItem::Column(ColumnRef::new("classroom", "building")),
                LinkItem::Column(ColumnRef::new("classroom", "capacity")),
                LinkItem::Literal("50".into()),
            ],
        }
    }

    fn joined() -> SchemaLink {
        SchemaLink {
            items: vec![
                LinkItem::Column(ColumnRef::new("facebook_ads", "facebook_clicks")),
                LinkItem::Column(ColumnRef::new("google_ads", "google_clicks")),
                LinkItem::Join(JoinEdge::new(
                    ColumnRef::new("facebook_ads", "date"),
                    ColumnRef::new("google_ads", "date"),
                )),
            ],
        }
    }

    #[test]
    fn test_parse_easy_label() {
        let c = parse_classification(
            "So, we don't need JOIN and don't need nested queries.\nLabel: \"EASY\"",
            &single_table(),
        );
        assert_eq!(c.class, ComplexityClass::Easy);
        assert!(c.sub_questions.is_empty());
    }

    #[test]
    fn test_missing_label_defaults_to_nested() {
        let c = parse_classification("It is probably simple.", &single_table());
        assert_eq!(c.class, ComplexityClass::Nested);

        let unknown = parse_classification("Label: \"MEDIUM\"", &single_table());
        assert_eq!(unknown.class, ComplexityClass::Nested);
    }

    #[test]
    fn test_nested_extracts_sub_questions() {
        let c = parse_classification(
            "Plus, it requires nested queries with (INTERSECT, UNION, EXCEPT, IN, NOT IN), and we need the answer to the questions = [\"Which customers have placed an order?\"].\nLabel: \"NESTED\"",
            &joined(),
        );
        assert_eq!(c.class, ComplexityClass::Nested);
        assert_eq!(c.sub_questions, vec!["Which customers have placed an order?"]);
    }

    #[test]
    fn test_reconcile_single_table_is_easy() {
        let c = parse_classification("Label: \"NON-NESTED\"", &single_table());
        assert_eq!(c.class, ComplexityClass::Easy);
    }

    #[test]
    fn test_reconcile_joined_is_non_nested() {
        let c = parse_classification("Label: \"EASY\"", &joined());
        assert_eq!(c.class, ComplexityClass::NonNested);

        let nested = parse_classification("Label: \"NESTED\"", &single_table());
        assert_eq!(nested.class, ComplexityClass::Nested);
    }
}
