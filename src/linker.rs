//! Schema linking: question terms to columns, join edges and cell values.
//!
//! The oracle proposes a `Schema_links: [...]` list; this module parses it
//! and resolves every `table.column` against the question's own schemas.
//! A reference the schemas cannot satisfy is an error. A completion without
//! the marker is an oracle fault and yields an empty link, which callers
//! should read as "retry", not "no data needed".

use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::models::{ColumnRef, JoinEdge, LinkItem, Question, SchemaLink};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::prompt;

pub struct SchemaLinker {
    oracle: Arc<dyn Oracle>,
    max_tokens: u32,
}

impl SchemaLinker {
    pub fn new(oracle: Arc<dyn Oracle>, max_tokens: u32) -> Self {
        Self { oracle, max_tokens }
    }

    pub async fn link(&self, question: &Question) -> Result<SchemaLink> {
        if question.data_sources.is_empty() {
            return Err(PipelineError::EmptyDataSources);
        }

        let prompt = prompt::link_prompt(question);
        let completion =
            oracle::ask(self.oracle.as_ref(), "link", &prompt, self.max_tokens).await?;

        let link = parse_link(&completion, question)?;
        debug!(
            items = link.items.len(),
            tables = link.tables().len(),
            "schema link resolved"
        );
        Ok(link)
    }
}

/// Parse a linking completion against the question's schemas.
pub fn parse_link(completion: &str, question: &Question) -> Result<SchemaLink> {
    let Some(rest) = parse::SCHEMA_LINKS.extract(completion) else {
        warn!(
            marker = parse::SCHEMA_LINKS.field,
            "completion missing marker, using empty schema link"
        );
        return Ok(SchemaLink::empty());
    };
    let Some(list) = parse::bracketed(rest) else {
        warn!(
            marker = parse::SCHEMA_LINKS.field,
            "schema link list is not bracketed, using empty schema link"
        );
        return Ok(SchemaLink::empty());
    };

    let declared = prompt::foreign_keys(&question.data_sources);
    let mut link = SchemaLink::empty();

    for raw in parse::split_items(list) {
        let item = resolve_item(&raw, question)?;
        if let LinkItem::Join(edge) = &item {
            if !declared.iter().any(|fk| fk.same_as(edge)) {
                warn!(join = %edge, "join edge outside the inferred foreign keys");
            }
        }
        if !link.items.contains(&item) {
            link.items.push(item);
        }
    }

    Ok(link)
}

fn column_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^`?([A-Za-z_][\w\-]*)`?\.`?(\*|[A-Za-z_]\w*)`?$").expect("valid regex")
    })
}

fn resolve_item(raw: &str, question: &Question) -> Result<LinkItem> {
    if let Some((left, right)) = raw.split_once('=') {
        let (left, right) = (left.trim(), right.trim());
        if column_ref_pattern().is_match(left) && column_ref_pattern().is_match(right) {
            let left = resolve_column(left, question)?;
            let right = resolve_column(right, question)?;
            return Ok(LinkItem::Join(JoinEdge::new(left, right)));
        }
    }

    if let Some(caps) = column_ref_pattern().captures(raw) {
        // `example.com` or `St.Louis` copied from the question is a value.
        if question.table(&caps[1]).is_none() && mentions(question, raw) {
            return Ok(LinkItem::Literal(raw.to_string()));
        }
        return Ok(LinkItem::Column(resolve_column(raw, question)?));
    }

    Ok(LinkItem::Literal(raw.to_string()))
}

fn mentions(question: &Question, raw: &str) -> bool {
    question
        .text
        .to_lowercase()
        .contains(&raw.trim_matches('`').to_lowercase())
}

/// Resolve `table.column` to the schema's canonical spelling.
fn resolve_column(reference: &str, question: &Question) -> Result<ColumnRef> {
    let unresolved = || PipelineError::UnresolvedReference {
        reference: reference.to_string(),
    };

    let caps = column_ref_pattern()
        .captures(reference)
        .ok_or_else(unresolved)?;
    let (table, column) = (&caps[1], &caps[2]);

    let source = question.table(table).ok_or_else(unresolved)?;
    if column == "*" {
        return Ok(ColumnRef::new(&source.table_name, "*"));
    }
    let column = source.column(column).ok_or_else(unresolved)?;
    Ok(ColumnRef::new(&source.table_name, &column.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, DataSourceSchema};
    use crate::oracle::ScriptedOracle;

    fn source(table: &str, columns: &[&str]) -> DataSourceSchema {
        DataSourceSchema {
            table_name: table.to_string(),
            db_schema: "main".to_string(),
            columns: columns
                .iter()
                .map(|c| Column {
                    name: c.to_string(),
                    declared_type: "TEXT".to_string(),
                })
                .collect(),
        }
    }

    fn clicks_question() -> Question {
        Question::new(
            "What are the facebook_clicks and google_clicks for each date?",
            vec![
                source("facebook_ads", &["date", "facebook_clicks"]),
                source("google_ads", &["date", "google_clicks"]),
            ],
        )
    }

    #[test]
    fn test_parse_columns_joins_and_literals() {
        let q = Question::new(
            "Find the buildings which have rooms with capacity more than 50.",
            vec![source("classroom", &["building", "room_number", "capacity"])],
        );
        let link = parse_link(
            "reasoning\nSchema_links: [classroom.building,CLASSROOM.Capacity,50]",
            &q,
        )
        .unwrap();
        assert_eq!(link.render(), "[classroom.building,classroom.capacity,50]");
        assert_eq!(link.literals().collect::<Vec<_>>(), vec!["50"]);
    }

    #[test]
    fn test_parse_join_edge() {
        let link = parse_link(
            "Schema_links: [facebook_ads.facebook_clicks,google_ads.google_clicks,facebook_ads.date = google_ads.date]",
            &clicks_question(),
        )
        .unwrap();
        assert_eq!(link.joins().count(), 1);
        assert_eq!(link.columns().count(), 2);
        assert_eq!(link.tables().len(), 2);
    }

    #[test]
    fn test_missing_marker_yields_empty_link() {
        let link = parse_link("I think you need the clicks column.", &clicks_question()).unwrap();
        assert!(link.is_empty());
    }

    #[test]
    fn test_unknown_column_is_error() {
        let err = parse_link("Schema_links: [facebook_ads.impressions]", &clicks_question())
            .unwrap_err();
        match err {
            PipelineError::UnresolvedReference { reference } => {
                assert_eq!(reference, "facebook_ads.impressions")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dotted_value_from_question_is_literal() {
        let q = Question::new(
            "How many clicks came from example.com?",
            vec![source("visits", &["clicks", "referrer"])],
        );
        let link = parse_link(
            "Schema_links: [visits.clicks,visits.referrer,example.com]",
            &q,
        )
        .unwrap();
        assert_eq!(link.columns().count(), 2);
        assert_eq!(link.literals().collect::<Vec<_>>(), vec!["example.com"]);
    }

    #[test]
    fn test_dotted_reference_not_in_question_is_error() {
        let q = Question::new(
            "How many clicks were there?",
            vec![source("visits", &["clicks", "referrer"])],
        );
        let err = parse_link("Schema_links: [sessions.clicks]", &q).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_unknown_table_in_join_is_error() {
        let err = parse_link(
            "Schema_links: [facebook_ads.date = bing_ads.date]",
            &clicks_question(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_wildcard_and_quoted_literal() {
        let q = Question::new("How many?", vec![source("head", &["name", "born_state"])]);
        let link = parse_link("Schema_links: [head.*,head.born_state,'Alabama, AL']", &q).unwrap();
        assert_eq!(link.render(), "[head.*,head.born_state,'Alabama, AL']");
    }

    #[tokio::test]
    async fn test_link_requires_data_sources() {
        let oracle = Arc::new(ScriptedOracle::new(Vec::<String>::new()));
        let linker = SchemaLinker::new(oracle, 100);
        let err = linker
            .link(&Question::new("anything", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDataSources));
    }

    #[tokio::test]
    async fn test_link_sends_schema_to_oracle() {
        let oracle = Arc::new(ScriptedOracle::new([
            "Schema_links: [facebook_ads.date = google_ads.date]",
        ]));
        let linker = SchemaLinker::new(oracle.clone(), 100);
        let link = linker.link(&clicks_question()).await.unwrap();
        assert_eq!(link.joins().count(), 1);

        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Foreign_keys = [facebook_ads.date = google_ads.date]"));
    }
}
