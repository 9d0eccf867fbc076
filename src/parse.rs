//! Marker-based extraction from oracle completions.
//!
//! Every prompt asks the oracle to end its reasoning with a fixed marker
//! (`Schema_links: `, `Label: `, ...). A [`Marker`] names that contract;
//! callers decide what a missing marker falls back to.

use regex::Regex;
use std::sync::OnceLock;

/// A required marker in a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Field name used in logs.
    pub field: &'static str,
    /// Literal text that precedes the value.
    pub token: &'static str,
}

pub const SCHEMA_LINKS: Marker = Marker {
    field: "schema_links",
    token: "Schema_links: ",
};

pub const LABEL: Marker = Marker {
    field: "label",
    token: "Label: ",
};

pub const SQL: Marker = Marker {
    field: "sql",
    token: "SQL: ",
};

pub const AMBIGUITIES: Marker = Marker {
    field: "ambiguities",
    token: "Ambiguities: ",
};

pub const UPDATED_QUESTION: Marker = Marker {
    field: "updated_question",
    token: "The updated question is: ",
};

/// Opening and closing delimiters of the sub-question list.
pub const SUB_QUESTIONS_OPEN: &str = "questions = [\"";
pub const SUB_QUESTIONS_CLOSE: &str = "\"]";

impl Marker {
    /// Text after the first occurrence of the marker, or `None` if absent.
    pub fn extract<'a>(&self, completion: &'a str) -> Option<&'a str> {
        completion
            .find(self.token)
            .map(|pos| &completion[pos + self.token.len()..])
    }

    /// Like [`extract`](Marker::extract), but only up to the end of that line.
    pub fn extract_line<'a>(&self, completion: &'a str) -> Option<&'a str> {
        self.extract(completion)
            .map(|rest| rest.lines().next().unwrap_or("").trim())
    }
}

/// Contents of the first balanced `[...]` in `text`, brackets excluded.
///
/// Brackets inside quotes do not count.
pub fn bracketed(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, ch) in text[start..].char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start + 1..start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a comma-separated list, ignoring commas inside quotes or parentheses.
pub fn split_items(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut parens = 0usize;

    for ch in list.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(ch);
            }
            (Some(_), _) => current.push(ch),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, '(') => {
                parens += 1;
                current.push(ch);
            }
            (None, ')') => {
                parens = parens.saturating_sub(1);
                current.push(ch);
            }
            (None, ',') if parens == 0 => {
                push_item(&mut items, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_item(&mut items, &current);
    items
}

fn push_item(items: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        items.push(trimmed.to_string());
    }
}

/// Sub-questions from `questions = ["a", "b"]`. An empty list or `[""]`
/// yields nothing.
pub fn sub_questions(completion: &str) -> Vec<String> {
    let Some(start) = completion.find(SUB_QUESTIONS_OPEN) else {
        return Vec::new();
    };
    let rest = &completion[start + SUB_QUESTIONS_OPEN.len()..];
    let Some(end) = rest.find(SUB_QUESTIONS_CLOSE) else {
        return Vec::new();
    };

    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    let separator = SEPARATOR.get_or_init(|| Regex::new(r#""\s*,\s*""#).expect("valid regex"));

    separator
        .split(&rest[..end])
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalize a SQL statement taken from a completion: drop code fences,
/// surrounding whitespace and a trailing semicolon. Empty input yields `None`.
pub fn clean_sql(raw: &str) -> Option<String> {
    let mut text = raw.trim();

    if let Some(stripped) = text.strip_prefix("```") {
        // Skip an optional language tag on the fence line.
        text = stripped
            .split_once('\n')
            .map(|(_, body)| body)
            .unwrap_or("");
    }
    if let Some(pos) = text.find("```") {
        text = &text[..pos];
    }

    let sql = text.trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

/// Double-quoted strings in `text`, in order.
pub fn quoted_terms(text: &str) -> Vec<(usize, String)> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let re = QUOTED.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| (m.start(), m.as_str().trim().to_string())))
        .collect()
}

/// Square-bracketed names in `text` (`[facebook_clicks]`), in order.
pub fn bracketed_names(text: &str) -> Vec<(usize, String)> {
    static NAMES: OnceLock<Regex> = OnceLock::new();
    let re = NAMES.get_or_init(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid regex"));
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| (m.start(), m.as_str().trim().to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_extract() {
        let completion = "So the Schema_links are:\nSchema_links: [classroom.building,50]";
        assert_eq!(
            SCHEMA_LINKS.extract(completion),
            Some("[classroom.building,50]")
        );
        assert_eq!(SCHEMA_LINKS.extract("no marker here"), None);
    }

    #[test]
    fn test_marker_extract_line() {
        let completion = "reasoning...\nLabel: \"NESTED\"\ntrailing";
        assert_eq!(LABEL.extract_line(completion), Some("\"NESTED\""));
    }

    #[test]
    fn test_bracketed_respects_quotes() {
        assert_eq!(bracketed("x [a,'b]c',d] y"), Some("a,'b]c',d"));
        assert_eq!(bracketed("[]"), Some(""));
        assert_eq!(bracketed("[unterminated"), None);
    }

    #[test]
    fn test_split_items() {
        let items = split_items("department.Creation, head.born_state,'Alabama, AL',count(a,b)");
        assert_eq!(
            items,
            vec![
                "department.Creation",
                "head.born_state",
                "'Alabama, AL'",
                "count(a,b)"
            ]
        );
        assert!(split_items("  ").is_empty());
    }

    #[test]
    fn test_sub_questions() {
        let text = r#"we need the answer to the questions = ["Which courses have prerequisite?"]."#;
        assert_eq!(sub_questions(text), vec!["Which courses have prerequisite?"]);

        let two = r#"questions = ["A?", "B?"]"#;
        assert_eq!(sub_questions(two), vec!["A?", "B?"]);

        assert!(sub_questions(r#"questions = [""]"#).is_empty());
        assert!(sub_questions("Label: \"EASY\"").is_empty());
    }

    #[test]
    fn test_clean_sql() {
        assert_eq!(
            clean_sql("```sql\nSELECT 1;\n```\nextra"),
            Some("SELECT 1".to_string())
        );
        assert_eq!(clean_sql("  SELECT a FROM t  "), Some("SELECT a FROM t".to_string()));
        assert_eq!(clean_sql(" ; "), None);
    }

    #[test]
    fn test_quoted_and_bracketed() {
        let s = r#"By "the clicks" are you referring to [facebook_clicks] or [google_clicks] ?"#;
        let terms = quoted_terms(s);
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].1, "the clicks");
        let names: Vec<String> = bracketed_names(s).into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["facebook_clicks", "google_clicks"]);
    }
}
