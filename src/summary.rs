//! Narrative analysis text into display sections.
//!
//! The backend writes numbered sections such as `1. **Valuation** ...`.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarySection {
    pub title: Option<String>,
    pub body: String,
}

fn section_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.\s+\*\*").expect("valid section pattern"))
}

fn bold() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.*?)\*\*").expect("valid bold pattern"))
}

fn list_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.\s+").expect("valid list pattern"))
}

/// Split a summary at each `N. **` marker. Text before the first marker is its own section.
///
/// The first bold span of a section becomes its title and is dropped from the body.
pub fn split_sections(text: &str) -> Vec<SummarySection> {
    let mut starts: Vec<usize> = section_marker().find_iter(text).map(|m| m.start()).collect();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }
    starts.push(text.len());

    starts
        .windows(2)
        .map(|w| &text[w[0]..w[1]])
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            let title = bold()
                .captures(chunk)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|t| !t.is_empty());
            let plain = bold().replace_all(chunk, "$1");
            let mut body = list_number().replace(&plain, "").trim().to_string();
            if let Some(t) = title.as_deref() {
                if let Some(rest) = body.strip_prefix(t) {
                    body = rest.trim_start_matches(':').trim().to_string();
                }
            }
            SummarySection { title, body }
        })
        .collect()
}

/// Wrap lines longer than `width` at word boundaries. Words are never split.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.chars().count() <= width {
            out.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split(' ') {
            if !current.is_empty() && current.chars().count() + word.chars().count() + 1 > width {
                out.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        out.push(current);
    }
    out
}
