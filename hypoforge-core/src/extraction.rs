//! Turning raw research text into (title, summary) pairs.
//!
//! Structuring is tiered. The AI-assisted tier asks the model for a JSON
//! object and validates its shape; if that yields nothing, three regex
//! header styles are tried in order; if those yield nothing too, a single
//! hypothesis named after the job is synthesized so every run produces at
//! least one hypothesis.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

static BRACKET_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【\s*仮説\s*[0-9０-９]+\s*】([^\n]*)").expect("bracket header"));
static MARKDOWN_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#{2,3}[ \t]*仮説[ \t]*[0-9０-９]+[ \t]*[：:.．]?([^\n]*)$").expect("markdown header")
});
static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+[.)][ \t]+([^\n]+)$").expect("numbered item"));
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z]*").expect("code fence"));

/// Length limits applied to structured fields, counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionLimits {
    pub title_max_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            title_max_chars: 100,
            summary_max_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedHypothesis {
    pub title: String,
    pub summary: String,
}

/// Which tier produced the structured hypotheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuringSource {
    Ai,
    Patterns,
    Fallback,
}

/// Find the JSON object in a model response: code fences are dropped and
/// the text between the first `{` and the last `}` is parsed.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let stripped = CODE_FENCE.replace_all(text, "");
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&stripped[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Validate `{hypotheses: [{title, summary}, ...]}` and clean each entry.
///
/// Entries without a string title or summary, or whose title is blank after
/// cleaning, are skipped; array order is kept.
pub fn structure_hypotheses_json(value: &Value, limits: ExtractionLimits) -> Vec<ExtractedHypothesis> {
    let Some(entries) = value.get("hypotheses").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?;
            let summary = entry.get("summary")?.as_str()?;
            let title = clean_title(title, limits.title_max_chars);
            if title.is_empty() {
                return None;
            }
            Some(ExtractedHypothesis {
                title,
                summary: clean_summary(summary, limits.summary_max_chars),
            })
        })
        .collect()
}

/// Regex extraction over raw research text.
///
/// Tries `【仮説N】`, then `## 仮説N` / `### 仮説N`, then `1.` / `1)` items,
/// stopping at the first style that yields anything. Duplicate titles
/// (case-insensitive) keep their first occurrence.
pub fn parse_hypotheses_from_output(text: &str, limits: ExtractionLimits) -> Vec<ExtractedHypothesis> {
    [&*BRACKET_HEADER, &*MARKDOWN_HEADER, &*NUMBERED_ITEM]
        .into_iter()
        .map(|pattern| split_on_headers(text, pattern, limits))
        .find(|found| !found.is_empty())
        .unwrap_or_default()
}

fn split_on_headers(text: &str, pattern: &Regex, limits: ExtractionLimits) -> Vec<ExtractedHypothesis> {
    let headers: Vec<_> = pattern.captures_iter(text).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (i, caps) in headers.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let body = &text[whole.end()..body_end];

        let mut title = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let mut summary = body.trim();
        if clean_title(&title, limits.title_max_chars).is_empty() {
            let mut lines = summary.splitn(2, '\n');
            title = lines.next().unwrap_or("").to_string();
            summary = lines.next().unwrap_or("").trim();
        }

        let title = clean_title(&title, limits.title_max_chars);
        if title.is_empty() || !seen.insert(title.to_lowercase()) {
            continue;
        }
        out.push(ExtractedHypothesis {
            title,
            summary: clean_summary(summary, limits.summary_max_chars),
        });
    }
    out
}

/// Trim markdown decoration and label prefixes, then truncate.
pub fn clean_title(raw: &str, max_chars: usize) -> String {
    let mut title = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '*' | '#' | '"' | '「' | '」' | '『' | '』'))
        .trim_start_matches([':', '：', '-', '−'])
        .trim();
    for prefix in ["タイトル", "Title", "title"] {
        if let Some(rest) = title.strip_prefix(prefix) {
            title = rest.trim_start_matches([':', '：', ' ']).trim();
        }
    }
    let title = title.trim_matches(|c: char| matches!(c, '*' | '「' | '」')).trim();
    truncate_chars(title, max_chars)
}

pub fn clean_summary(raw: &str, max_chars: usize) -> String {
    truncate_chars(raw.trim(), max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// The single hypothesis synthesized when nothing could be extracted.
pub fn fallback_hypothesis(job_name: &str, raw: &str, limits: ExtractionLimits) -> ExtractedHypothesis {
    let title = clean_title(job_name, limits.title_max_chars);
    ExtractedHypothesis {
        title: if title.is_empty() {
            "Hypothesis".to_string()
        } else {
            title
        },
        summary: truncate_chars(raw, limits.summary_max_chars),
    }
}

/// Run all three tiers. `ai_response` is the structuring model's reply, if
/// the call succeeded.
pub fn structure_research_output(
    ai_response: Option<&str>,
    raw: &str,
    job_name: &str,
    limits: ExtractionLimits,
) -> (Vec<ExtractedHypothesis>, StructuringSource) {
    let from_ai = ai_response
        .and_then(extract_json_object)
        .map(|value| structure_hypotheses_json(&value, limits))
        .unwrap_or_default();
    if !from_ai.is_empty() {
        return (from_ai, StructuringSource::Ai);
    }

    let from_patterns = parse_hypotheses_from_output(raw, limits);
    if !from_patterns.is_empty() {
        return (from_patterns, StructuringSource::Patterns);
    }

    (
        vec![fallback_hypothesis(job_name, raw, limits)],
        StructuringSource::Fallback,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limits() -> ExtractionLimits {
        ExtractionLimits::default()
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"hypotheses\": [{\"title\": \"A\", \"summary\": \"s\"}]}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["hypotheses"][0]["title"], "A");
    }

    #[test]
    fn test_extract_json_rejects_garbage() {
        assert!(extract_json_object("no braces here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
        assert!(extract_json_object("{not json}").is_none());
    }

    #[test]
    fn test_structure_json_skips_invalid_entries() {
        let value = serde_json::json!({
            "hypotheses": [
                {"title": "  Solid-state film  ", "summary": "thin"},
                {"title": 3, "summary": "bad title"},
                {"summary": "no title"},
                {"title": "Coolant additive", "summary": "fluid"}
            ]
        });
        let found = structure_hypotheses_json(&value, limits());
        assert_eq!(
            found,
            vec![
                ExtractedHypothesis {
                    title: "Solid-state film".into(),
                    summary: "thin".into()
                },
                ExtractedHypothesis {
                    title: "Coolant additive".into(),
                    summary: "fluid".into()
                },
            ]
        );
    }

    #[test]
    fn test_bracket_headers() {
        let long = "詳".repeat(2500);
        let text = format!(
            "前置き\n【仮説1】 放熱シート事業 \n概要A\n【仮説2】蓄電池モジュール\n{long}\n【仮説3】リサイクル材\n概要C"
        );
        let found = parse_hypotheses_from_output(&text, limits());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].title, "放熱シート事業");
        assert_eq!(found[0].summary, "概要A");
        assert_eq!(found[1].title, "蓄電池モジュール");
        assert_eq!(found[1].summary.chars().count(), 2000);
        assert_eq!(found[2].title, "リサイクル材");
    }

    #[test]
    fn test_markdown_headers_with_title_on_next_line() {
        let text = "## 仮説1\n**Heat spreader**\nbody one\n### 仮説2: Battery pack\nbody two";
        let found = parse_hypotheses_from_output(text, limits());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title, "Heat spreader");
        assert_eq!(found[0].summary, "body one");
        assert_eq!(found[1].title, "Battery pack");
    }

    #[test]
    fn test_numbered_list_dedupes_case_insensitively() {
        let text = "1. Smart Coating\n detail\n2) smart coating\n3. Sensor Mesh";
        let found = parse_hypotheses_from_output(text, limits());
        let titles: Vec<_> = found.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Smart Coating", "Sensor Mesh"]);
    }

    #[test]
    fn test_bracket_style_wins_over_numbered() {
        let text = "【仮説1】First\n1. step one\n2. step two";
        let found = parse_hypotheses_from_output(text, limits());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "First");
    }

    #[test]
    fn test_no_patterns_returns_empty() {
        assert!(parse_hypotheses_from_output("just prose, nothing numbered", limits()).is_empty());
    }

    #[test]
    fn test_clean_title_truncates_by_chars() {
        let title = clean_title(&format!("**タイトル：{}**", "あ".repeat(150)), 100);
        assert_eq!(title.chars().count(), 100);
        assert!(title.starts_with('あ'));
    }

    #[test]
    fn test_fallback_uses_job_name() {
        let raw = "x".repeat(3000);
        let (found, source) = structure_research_output(Some("not json"), &raw, "EV thermal", limits());
        assert_eq!(source, StructuringSource::Fallback);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "EV thermal");
        assert_eq!(found[0].summary.len(), 2000);
    }

    #[test]
    fn test_tiers_prefer_ai() {
        let ai = r#"{"hypotheses":[{"title":"From AI","summary":"s"}]}"#;
        let (found, source) = structure_research_output(Some(ai), "【仮説1】From regex", "job", limits());
        assert_eq!(source, StructuringSource::Ai);
        assert_eq!(found[0].title, "From AI");

        let (found, source) = structure_research_output(None, "【仮説1】From regex", "job", limits());
        assert_eq!(source, StructuringSource::Patterns);
        assert_eq!(found[0].title, "From regex");
    }
}
