//! Core data types threaded through the question-to-SQL pipeline.
//!
//! Everything here is an immutable snapshot or a value produced by exactly one
//! stage; later stages read these types but never mutate them in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A column as declared in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
}

/// Snapshot of one data source's table, fetched once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSchema {
    pub table_name: String,
    pub db_schema: String,
    pub columns: Vec<Column>,
}

impl DataSourceSchema {
    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// A user question and the data sources it may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub text: String,
    pub data_sources: Vec<DataSourceSchema>,
}

impl Question {
    pub fn new(text: impl Into<String>, data_sources: Vec<DataSourceSchema>) -> Self {
        Self {
            text: text.into(),
            data_sources,
        }
    }

    /// Same data sources, different wording.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data_sources: self.data_sources.clone(),
        }
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&DataSourceSchema> {
        self.data_sources
            .iter()
            .find(|ds| ds.table_name.eq_ignore_ascii_case(name))
    }
}

/// `table.column`, or `table.*` for a whole-row reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.column == "*"
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Equality join between two columns of different tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEdge {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

impl JoinEdge {
    pub fn new(left: ColumnRef, right: ColumnRef) -> Self {
        Self { left, right }
    }

    /// Joins are symmetric: `a.x = b.y` and `b.y = a.x` are the same edge.
    pub fn same_as(&self, other: &JoinEdge) -> bool {
        let key = |c: &ColumnRef| (c.table.to_lowercase(), c.column.to_lowercase());
        (key(&self.left) == key(&other.left) && key(&self.right) == key(&other.right))
            || (key(&self.left) == key(&other.right) && key(&self.right) == key(&other.left))
    }
}

impl fmt::Display for JoinEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.left, self.right)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkItem {
    Column(ColumnRef),
    Join(JoinEdge),
    Literal(String),
}

impl fmt::Display for LinkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkItem::Column(c) => write!(f, "{}", c),
            LinkItem::Join(j) => write!(f, "{}", j),
            LinkItem::Literal(v) => write!(f, "{}", v),
        }
    }
}

/// Resolved references for a question, in the order the linker produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaLink {
    pub items: Vec<LinkItem>,
}

impl SchemaLink {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnRef> {
        self.items.iter().filter_map(|i| match i {
            LinkItem::Column(c) => Some(c),
            _ => None,
        })
    }

    pub fn joins(&self) -> impl Iterator<Item = &JoinEdge> {
        self.items.iter().filter_map(|i| match i {
            LinkItem::Join(j) => Some(j),
            _ => None,
        })
    }

    pub fn literals(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|i| match i {
            LinkItem::Literal(v) => Some(v.as_str()),
            _ => None,
        })
    }

    /// Every table touched by a column reference or a join edge.
    pub fn tables(&self) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        for item in &self.items {
            match item {
                LinkItem::Column(c) => {
                    tables.insert(c.table.clone());
                }
                LinkItem::Join(j) => {
                    tables.insert(j.left.table.clone());
                    tables.insert(j.right.table.clone());
                }
                LinkItem::Literal(_) => {}
            }
        }
        tables
    }

    /// Render in the bracketed form used by prompts: `[t.a,t.b = u.b,50]`.
    pub fn render(&self) -> String {
        let parts: Vec<String> = self.items.iter().map(|i| i.to_string()).collect();
        format!("[{}]", parts.join(","))
    }
}

/// Structural complexity of a linked question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplexityClass {
    Easy,
    NonNested,
    Nested,
}

impl ComplexityClass {
    pub fn label(&self) -> &'static str {
        match self {
            ComplexityClass::Easy => "EASY",
            ComplexityClass::NonNested => "NON-NESTED",
            ComplexityClass::Nested => "NESTED",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "EASY" => Some(ComplexityClass::Easy),
            "NON-NESTED" | "NON_NESTED" | "NONNESTED" => Some(ComplexityClass::NonNested),
            "NESTED" => Some(ComplexityClass::Nested),
            _ => None,
        }
    }
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifier output: the class plus, for NESTED, the sub-questions the
/// outer query depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ComplexityClass,
    pub sub_questions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityKind {
    /// At least one term maps to several columns; the caller must pick.
    MultipleCandidates,
    /// Only terms that map to no column; the caller must rephrase.
    Unrecognized,
}

/// A halt in the pipeline that needs a human answer.
///
/// `ambiguous_terms`, `candidate_columns` and `suggested_columns` are
/// index-aligned. For an unrecognized-only report `candidate_columns` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityReport {
    pub original_question: String,
    pub clarification_statement: String,
    pub ambiguous_terms: Vec<String>,
    pub candidate_columns: Vec<Vec<String>>,
    #[serde(default)]
    pub suggested_columns: Vec<Vec<String>>,
}

impl AmbiguityReport {
    pub fn kind(&self) -> AmbiguityKind {
        if self.candidate_columns.iter().any(|c| !c.is_empty()) {
            AmbiguityKind::MultipleCandidates
        } else {
            AmbiguityKind::Unrecognized
        }
    }
}

/// Marker SQL emitted when synthesis could not parse a statement. It never
/// executes successfully, so the repair loop picks it up immediately.
pub const SENTINEL_SQL: &str = "SELECT";

/// A candidate statement and how many repair rounds produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSql {
    pub sql: String,
    pub class: ComplexityClass,
    pub attempts: u32,
}

impl GeneratedSql {
    pub fn new(sql: impl Into<String>, class: ComplexityClass) -> Self {
        Self {
            sql: sql.into(),
            class,
            attempts: 0,
        }
    }

    pub fn sentinel(class: ComplexityClass) -> Self {
        Self::new(SENTINEL_SQL, class)
    }

    pub fn is_sentinel(&self) -> bool {
        self.sql.trim() == SENTINEL_SQL
    }

    /// Next candidate in the repair chain.
    pub fn revised(&self, sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            class: self.class,
            attempts: self.attempts + 1,
        }
    }
}

/// One exchange in a disambiguation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub question: String,
    pub clarification: Option<AmbiguityReport>,
    pub answer: Option<String>,
    pub created_at: i64,
}

/// Ordered turns of one session. Sessions never expire on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
}

impl ConversationState {
    /// The last turn, if it asked for clarification and has no answer yet.
    pub fn pending_clarification(&self) -> Option<(usize, &ConversationTurn, &AmbiguityReport)> {
        let idx = self.turns.len().checked_sub(1)?;
        let turn = &self.turns[idx];
        match (&turn.clarification, &turn.answer) {
            (Some(report), None) => Some((idx, turn, report)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_schema_link() {
        let link = SchemaLink {
            items: vec![
                LinkItem::Column(ColumnRef::new("classroom", "building")),
                LinkItem::Join(JoinEdge::new(
                    ColumnRef::new("a", "date"),
                    ColumnRef::new("b", "date"),
                )),
                LinkItem::Literal("50".to_string()),
            ],
        };
        assert_eq!(link.render(), "[classroom.building,a.date = b.date,50]");
        assert_eq!(link.tables().len(), 3);
        assert_eq!(SchemaLink::empty().render(), "[]");
    }

    #[test]
    fn test_join_edge_symmetric() {
        let ab = JoinEdge::new(ColumnRef::new("a", "date"), ColumnRef::new("b", "DATE"));
        let ba = JoinEdge::new(ColumnRef::new("B", "date"), ColumnRef::new("a", "date"));
        assert!(ab.same_as(&ba));
    }

    #[test]
    fn test_complexity_labels() {
        assert_eq!(
            ComplexityClass::from_label("non-nested"),
            Some(ComplexityClass::NonNested)
        );
        assert_eq!(ComplexityClass::from_label("NESTED"), Some(ComplexityClass::Nested));
        assert_eq!(ComplexityClass::from_label("HARD"), None);
        assert_eq!(ComplexityClass::NonNested.to_string(), "NON-NESTED");
    }

    #[test]
    fn test_pending_clarification() {
        let report = AmbiguityReport {
            original_question: "q".into(),
            clarification_statement: "which?".into(),
            ambiguous_terms: vec!["clicks".into()],
            candidate_columns: vec![vec!["a".into(), "b".into()]],
            suggested_columns: vec![vec![]],
        };
        let mut state = ConversationState {
            session_id: "s".into(),
            turns: vec![ConversationTurn {
                question: "q".into(),
                clarification: Some(report),
                answer: None,
                created_at: 0,
            }],
        };
        assert!(state.pending_clarification().is_some());
        state.turns[0].answer = Some("both".into());
        assert!(state.pending_clarification().is_none());
    }

    #[test]
    fn test_sentinel_sql() {
        let s = GeneratedSql::sentinel(ComplexityClass::Easy);
        assert!(s.is_sentinel());
        let next = s.revised("SELECT 1");
        assert_eq!(next.attempts, 1);
        assert!(!next.is_sentinel());
    }
}
