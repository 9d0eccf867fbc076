//! Ambiguity detection and the clarification rewrite.
//!
//! A term is ambiguous when it names a metric that several channels carry
//! (`facebook_clicks`, `google_clicks`), and unrecognized when it names no
//! column at all. Both halt the pipeline with an [`AmbiguityReport`]; the
//! resolver never picks a mapping for the caller.
//!
//! Findings come from two places: the oracle's `Ambiguities: ` verdict, and
//! a structural pass over the schemas that groups channel-prefixed columns
//! by their shared label. Oracle candidates are checked against the schemas
//! before they reach a report.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AmbiguityKind, AmbiguityReport, Question};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::prompt;

/// Maximum suggestions offered per unrecognized term.
const MAX_SUGGESTIONS: usize = 3;

/// Words in a clarification answer that carry no choice.
const FILLER_WORDS: &[&str] = &[
    "and", "or", "the", "a", "an", "one", "ones", "only", "please", "use", "i", "want", "mean",
    "meant", "columns", "column", "of", "them", "just",
];

/// One ambiguous or unrecognized term. Empty `candidates` means unrecognized.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Finding {
    term: String,
    candidates: Vec<String>,
}

pub struct AmbiguityResolver {
    oracle: Arc<dyn Oracle>,
    max_tokens: u32,
    suggestion_threshold: f64,
}

impl AmbiguityResolver {
    pub fn new(oracle: Arc<dyn Oracle>, max_tokens: u32, suggestion_threshold: f64) -> Self {
        Self {
            oracle,
            max_tokens,
            suggestion_threshold,
        }
    }

    /// `None` when every term maps to exactly one column.
    pub async fn check(&self, question: &Question) -> Result<Option<AmbiguityReport>> {
        if question.data_sources.is_empty() {
            return Err(PipelineError::EmptyDataSources);
        }

        let prompt = prompt::ambiguity_prompt(question);
        let completion =
            oracle::ask(self.oracle.as_ref(), "ambiguity", &prompt, self.max_tokens).await?;

        let from_oracle = match parse_verdict(&completion) {
            Some(findings) => vet(findings, question),
            None => {
                warn!(
                    marker = parse::AMBIGUITIES.field,
                    "completion missing marker, using structural ambiguity check only"
                );
                Vec::new()
            }
        };
        let findings = merge(from_oracle, structural_findings(question));

        let report = build_report(question, &findings, self.suggestion_threshold);
        match &report {
            Some(r) => info!(
                terms = r.ambiguous_terms.len(),
                kind = ?r.kind(),
                "question needs clarification"
            ),
            None => debug!("question is unambiguous"),
        }
        Ok(report)
    }

    /// Rewrite the question so that it carries the user's answer.
    ///
    /// Simple answers ("both" for a single term, a channel name, column
    /// names) are applied directly. Anything else goes to the oracle; if its completion lacks
    /// the marker, the answer is appended to the question in parentheses.
    pub async fn update_question(
        &self,
        question: &Question,
        report: &AmbiguityReport,
        answer: &str,
    ) -> Result<Question> {
        if let Some(text) = rewrite_with_answer(report, answer) {
            debug!(question = %text, "clarification applied without oracle");
            return Ok(question.with_text(text));
        }

        let prompt = prompt::update_question_prompt(
            question,
            &report.original_question,
            &report.clarification_statement,
            answer,
        );
        let completion =
            oracle::ask(self.oracle.as_ref(), "update_question", &prompt, self.max_tokens).await?;

        let rewritten = parse::UPDATED_QUESTION
            .extract_line(&completion)
            .map(|line| line.trim_matches('"').trim().to_string())
            .filter(|line| !line.is_empty());

        Ok(match rewritten {
            Some(text) => question.with_text(text),
            None => {
                warn!(
                    marker = parse::UPDATED_QUESTION.field,
                    "completion missing marker, appending answer to the question"
                );
                question.with_text(format!(
                    "{} ({})",
                    report.original_question,
                    answer.trim()
                ))
            }
        })
    }
}

/// Findings named by the oracle. `None` when the marker is missing.
fn parse_verdict(completion: &str) -> Option<Vec<Finding>> {
    let verdict = parse::AMBIGUITIES.extract_line(completion)?;
    if verdict.is_empty() || verdict.to_ascii_lowercase().starts_with("none") {
        return Some(Vec::new());
    }

    let terms = parse::quoted_terms(verdict);
    let names = parse::bracketed_names(verdict);

    let mut findings: Vec<Finding> = terms
        .iter()
        .map(|(_, term)| Finding {
            term: term.clone(),
            candidates: Vec::new(),
        })
        .collect();

    // Each bracketed name belongs to the closest quoted term before it.
    for (pos, name) in names {
        if let Some(idx) = terms.iter().rposition(|(start, _)| *start < pos) {
            findings[idx].candidates.push(name);
        }
    }

    if findings.is_empty() {
        debug!(verdict, "ambiguity verdict names no terms");
    }
    Some(findings)
}

/// Drop oracle findings the schemas or the question contradict.
fn vet(findings: Vec<Finding>, question: &Question) -> Vec<Finding> {
    let mut kept = Vec::new();
    for finding in findings {
        if finding.candidates.is_empty() {
            if known_column(question, strip_article(&finding.term)).is_some() {
                debug!(term = %finding.term, "unrecognized term is a column, ignoring");
                continue;
            }
            kept.push(finding);
            continue;
        }

        let mut candidates: Vec<String> = Vec::new();
        for name in &finding.candidates {
            match known_column(question, name) {
                Some(canonical) if !candidates.contains(&canonical) => candidates.push(canonical),
                Some(_) => {}
                None => debug!(candidate = %name, "discarding candidate absent from schemas"),
            }
        }
        if candidates.len() < 2 {
            continue;
        }
        if candidates.iter().any(|c| names_column(&question.text, c)) {
            continue;
        }
        kept.push(Finding {
            term: finding.term,
            candidates,
        });
    }
    kept
}

/// Channel-prefixed columns from distinct sources that share a label the
/// question uses bare.
fn structural_findings(question: &Question) -> Vec<Finding> {
    let mut groups: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();
    for (idx, source) in question.data_sources.iter().enumerate() {
        for name in source.column_names() {
            if let Some(label) = channel_label(name) {
                groups
                    .entry(label.to_lowercase())
                    .or_default()
                    .push((idx, name.to_string()));
            }
        }
    }

    let mut findings = Vec::new();
    for (label, members) in groups {
        let sources: BTreeSet<usize> = members.iter().map(|(i, _)| *i).collect();
        let mut names: Vec<String> = Vec::new();
        for (_, name) in &members {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        if sources.len() < 2 || names.len() < 2 {
            continue;
        }
        // A column literally called by the label makes the bare term resolvable.
        if known_column(question, &label).is_some() {
            continue;
        }
        if names.iter().any(|n| names_column(&question.text, n)) {
            continue;
        }
        if let Some(term) = label_pattern(&label).find(&question.text) {
            findings.push(Finding {
                term: term.as_str().to_string(),
                candidates: names,
            });
        }
    }
    findings
}

/// Oracle findings first; structural ones only when they add a new term.
fn merge(mut findings: Vec<Finding>, structural: Vec<Finding>) -> Vec<Finding> {
    for extra in structural {
        let key = lowered(&extra.candidates);
        let covered = findings.iter().any(|f| {
            lowered(&f.candidates) == key || f.term.eq_ignore_ascii_case(&extra.term)
        });
        if !covered {
            findings.push(extra);
        }
    }
    findings
}

fn lowered(names: &[String]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_lowercase()).collect()
}

fn build_report(
    question: &Question,
    findings: &[Finding],
    threshold: f64,
) -> Option<AmbiguityReport> {
    if findings.is_empty() {
        return None;
    }

    let suggestions: Vec<Vec<String>> = findings
        .iter()
        .map(|f| {
            if f.candidates.is_empty() {
                suggest_columns(question, &f.term, threshold)
            } else {
                Vec::new()
            }
        })
        .collect();

    let has_candidates = findings.iter().any(|f| !f.candidates.is_empty());
    let candidate_columns = if has_candidates {
        findings.iter().map(|f| f.candidates.clone()).collect()
    } else {
        Vec::new()
    };

    Some(AmbiguityReport {
        original_question: question.text.clone(),
        clarification_statement: render_statement(findings, &suggestions),
        ambiguous_terms: findings.iter().map(|f| f.term.clone()).collect(),
        candidate_columns,
        suggested_columns: suggestions,
    })
}

/// `By "t" are you referring to [a] or [b] ?` for each ambiguous term,
/// then one apology per unrecognized term.
fn render_statement(findings: &[Finding], suggestions: &[Vec<String>]) -> String {
    let mut sentences = Vec::new();

    let choices: Vec<String> = findings
        .iter()
        .filter(|f| !f.candidates.is_empty())
        .map(|f| {
            format!(
                "\"{}\" are you referring to {}",
                f.term,
                bracket_list(&f.candidates)
            )
        })
        .collect();
    if !choices.is_empty() {
        sentences.push(format!("By {} ?", choices.join(" and by ")));
    }

    for (finding, suggested) in findings.iter().zip(suggestions) {
        if !finding.candidates.is_empty() {
            continue;
        }
        let mut sentence = format!(
            "Sorry I did not recognise the term \"{}\", could you clarify what you mean by this?",
            finding.term
        );
        if !suggested.is_empty() {
            sentence.push_str(&format!(" Did you mean {}?", bracket_list(suggested)));
        }
        sentences.push(sentence);
    }

    sentences.join(" ")
}

/// `[a] or [b]`, `[a], [b] or [c]`.
fn bracket_list(names: &[String]) -> String {
    let wrapped: Vec<String> = names.iter().map(|n| format!("[{}]", n)).collect();
    match wrapped.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} or {}", rest.join(", "), last),
        Some((last, _)) => last.clone(),
        None => String::new(),
    }
}

/// Columns whose name resembles `term` (Jaro-Winkler), best first.
fn suggest_columns(question: &Question, term: &str, threshold: f64) -> Vec<String> {
    let needle = strip_article(term).to_lowercase();
    let mut scored: Vec<(f64, String)> = Vec::new();

    for source in &question.data_sources {
        for name in source.column_names() {
            let lower = name.to_lowercase();
            let mut score = strsim::jaro_winkler(&needle, &lower)
                .max(strsim::jaro_winkler(&needle, &lower.replace('_', " ")));
            if let Some(label) = channel_label(&lower) {
                score = score.max(strsim::jaro_winkler(&needle, label));
            }
            if score >= threshold && !scored.iter().any(|(_, n)| n.eq_ignore_ascii_case(name)) {
                scored.push((score, name.to_string()));
            }
        }
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, name)| name)
        .collect()
}

/// Apply a simple answer without the oracle. `None` when the answer needs
/// interpretation.
fn rewrite_with_answer(report: &AmbiguityReport, answer: &str) -> Option<String> {
    if report.kind() == AmbiguityKind::Unrecognized {
        return None;
    }

    let tokens: Vec<String> = answer
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !FILLER_WORDS.contains(&t.as_str()))
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let wants_all = tokens.iter().any(|t| t == "both" || t == "all");
    // With several terms, "both" leaves the pairing of columns open.
    let multi_term = report.candidate_columns.len() > 1;
    let mut text = report.original_question.clone();

    for (term, candidates) in report.ambiguous_terms.iter().zip(&report.candidate_columns) {
        if candidates.is_empty() {
            return None;
        }
        let mut chosen: Vec<&String> = candidates
            .iter()
            .filter(|c| {
                let lower = c.to_lowercase();
                tokens.iter().any(|t| *t == lower)
                    || channel_prefix(&lower).is_some_and(|p| tokens.iter().any(|t| t == p))
            })
            .collect();
        if chosen.is_empty() && wants_all && !multi_term {
            chosen = candidates.iter().collect();
        }
        if chosen.is_empty() || (multi_term && chosen.len() > 1) {
            return None;
        }

        let span = replacement_span(term, candidates);
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&span))).ok()?;
        if !pattern.is_match(&text) {
            return None;
        }
        let replacement: Vec<&str> = chosen.iter().map(|c| c.as_str()).collect();
        text = pattern
            .replacen(&text, 1, regex::NoExpand(&replacement.join(" and ")))
            .into_owned();
    }

    // Every remaining token must be a choice we understood.
    let understood = tokens.iter().all(|t| {
        t == "both"
            || t == "all"
            || report.candidate_columns.iter().flatten().any(|c| {
                let lower = c.to_lowercase();
                *t == lower
                    || channel_prefix(&lower) == Some(t.as_str())
                    || channel_label(&lower).is_some_and(|l| label_pattern(l).is_match(t))
            })
    });
    understood.then_some(text)
}

/// The word in `term` that names the shared label, so "the clicks" is
/// rewritten as "the facebook_clicks" rather than losing its article.
fn replacement_span(term: &str, candidates: &[String]) -> String {
    for candidate in candidates {
        if let Some(label) = channel_label(candidate) {
            if let Some(m) = label_pattern(&label.to_lowercase()).find(term) {
                return m.as_str().to_string();
            }
        }
    }
    term.to_string()
}

/// `facebook_clicks` → `clicks`.
fn channel_label(name: &str) -> Option<&str> {
    match name.split_once('_') {
        Some((prefix, label)) if !prefix.is_empty() && !label.is_empty() => Some(label),
        _ => None,
    }
}

/// `facebook_clicks` → `facebook`.
fn channel_prefix(name: &str) -> Option<&str> {
    match name.split_once('_') {
        Some((prefix, label)) if !prefix.is_empty() && !label.is_empty() => Some(prefix),
        _ => None,
    }
}

/// Matches a label bare in text: singular or plural, spaces for underscores.
fn label_pattern(label: &str) -> Regex {
    let stem = if label.len() > 1 {
        label.strip_suffix('s').unwrap_or(label)
    } else {
        label
    };
    let body = regex::escape(stem).replace('_', "[ _]");
    Regex::new(&format!(r"(?i)\b{}s?\b", body)).expect("escaped label is a valid regex")
}

/// Whether `text` names `column`, underscored or spaced.
fn names_column(text: &str, column: &str) -> bool {
    let spaced = column.replace('_', " ");
    [column.to_string(), spaced].iter().any(|form| {
        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(form)))
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    })
}

/// Canonical spelling of a column in any source. Accepts `table.column`.
fn known_column(question: &Question, name: &str) -> Option<String> {
    let name = name.trim();
    if let Some((table, column)) = name.split_once('.') {
        return question
            .table(table)
            .and_then(|source| source.column(column))
            .map(|c| c.name.clone());
    }
    let spaced = name.replace(' ', "_");
    question
        .data_sources
        .iter()
        .find_map(|source| source.column(name).or_else(|| source.column(&spaced)))
        .map(|c| c.name.clone())
}

fn strip_article(term: &str) -> &str {
    let trimmed = term.trim();
    for article in ["the ", "a ", "an "] {
        match trimmed.get(..article.len()) {
            Some(head) if head.eq_ignore_ascii_case(article) && trimmed.len() > article.len() => {
                return trimmed[article.len()..].trim_start();
            }
            _ => {}
        }
    }
    trimmed
}
