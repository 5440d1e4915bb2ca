//! Output-quality validators: deciding whether raw agent output is real
//! content or narration/skeleton, and parsing the moderator's free-form
//! consensus score.
//!
//! The JSON/score extraction here mirrors `review/arbiter.rs`'s
//! `extract_json` layering — markdown fence, then balanced-brace scan — used
//! at three points: recovering output from disk when stdout is empty,
//! accepting a round's analysis, and reconciling crashed state.

use regex::Regex;
use std::sync::OnceLock;

/// A distinctive fallback anchor the moderator prompt asks for when a clean
/// score line can't be produced; recognized as evidence of a genuine
/// moderator response even without a parseable score.
pub const MODERATOR_ANCHOR_SENTINEL: &str = "QUORUM_MODERATOR_RESPONSE";

/// `isValidAnalysisOutput`: empty is invalid; a skeleton outline (>= 3
/// header lines with fewer than 3 substantial non-header lines) is invalid;
/// short output (< 1024 bytes) is valid as-is; longer output additionally
/// requires a newline and a markdown header.
pub fn is_valid_analysis_output(s: &str) -> bool {
    if s.trim().is_empty() {
        return false;
    }

    let lines: Vec<&str> = s.lines().collect();
    let header_lines = lines.iter().filter(|l| is_markdown_header(l)).count();
    let substantial_lines = lines
        .iter()
        .filter(|l| !is_markdown_header(l) && l.trim().len() >= 10)
        .count();
    if header_lines >= 3 && substantial_lines < 3 {
        return false;
    }

    if s.len() < 1024 {
        return true;
    }

    s.contains('\n') && lines.iter().any(|l| is_markdown_header(l))
}

fn is_markdown_header(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// `isValidModeratorOutput`: any of YAML frontmatter, the anchor sentinel,
/// the literal key `consensus_score`, or markdown structure plus an
/// evaluation keyword, suffices.
pub fn is_valid_moderator_output(s: &str) -> bool {
    if s.trim().is_empty() {
        return false;
    }
    if s.trim_start().starts_with("---") {
        return true;
    }
    if s.contains(MODERATOR_ANCHOR_SENTINEL) {
        return true;
    }
    if s.contains("consensus_score") {
        return true;
    }
    let has_markdown_structure = s.lines().any(is_markdown_header) || s.contains("- ");
    let has_keyword = ["agreement", "divergen", "consensus"]
        .iter()
        .any(|kw| s.to_lowercase().contains(kw));
    has_markdown_structure && has_keyword
}

fn consensus_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\**CONSENSUS_SCORE\**\s*:?\s*([0-9]+(?:\.[0-9]+)?)\s*%").unwrap()
    })
}

fn prose_score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)consensus score (?:is|of|:)?\s*([0-9]+(?:\.[0-9]+)?)\s*%").unwrap()
    })
}

fn decimal_score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b0\.(\d{1,3})\b").unwrap())
}

fn yaml_frontmatter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^---\s*\n(.*?)\n---").unwrap())
}

fn yaml_score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)consensus_score\s*:\s*([0-9]+(?:\.[0-9]+)?)").unwrap())
}

/// Parses a consensus score in [0, 1] from the moderator's free-form output,
/// trying five shapes in priority order plus YAML frontmatter.
///
/// 1. `CONSENSUS_SCORE: NN%` (optionally bolded with `**`)
/// 2. the same, inside a fenced code block
/// 3. the anchor sentinel alone does not yield a score — callers should
///    treat its presence as validity without a numeric score
/// 4. prose: "consensus score is 78%"
/// 5. a bare decimal `0.NN`
pub fn parse_consensus_score(s: &str) -> Option<f64> {
    if let Some(caps) = yaml_frontmatter_re().captures(s) {
        if let Some(score_caps) = yaml_score_re().captures(&caps[1]) {
            return normalize_percent_or_fraction(&score_caps[1]);
        }
    }

    if let Some(caps) = consensus_line_re().captures(s) {
        return normalize_percent(&caps[1]);
    }

    if let Some(fenced) = extract_fenced_block(s) {
        if let Some(caps) = consensus_line_re().captures(&fenced) {
            return normalize_percent(&caps[1]);
        }
    }

    if let Some(caps) = prose_score_re().captures(s) {
        return normalize_percent(&caps[1]);
    }

    if let Some(caps) = decimal_score_re().captures(s) {
        let frac = format!("0.{}", &caps[1]);
        return frac.parse::<f64>().ok();
    }

    None
}

fn normalize_percent(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().map(|n| n / 100.0)
}

fn normalize_percent_or_fraction(raw: &str) -> Option<f64> {
    let n: f64 = raw.parse().ok()?;
    Some(if n > 1.0 { n / 100.0 } else { n })
}

fn extract_fenced_block(s: &str) -> Option<String> {
    let start = s.find("```")?;
    let after = &s[start + 3..];
    let end = after.find("```")?;
    Some(after[..end].to_string())
}

/// Extracts the first balanced `{}` or `[]` run, the brace-scan fallback
/// shared by the planner's manifest parsing and the moderator's structured
/// fields.
pub fn extract_balanced_json(s: &str) -> Option<String> {
    if let Some(fenced) = extract_json_fence(s) {
        return Some(fenced);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(found) = scan_balanced(s, open, close) {
            return Some(found);
        }
    }
    None
}

fn extract_json_fence(s: &str) -> Option<String> {
    let marker = if s.contains("```json") {
        "```json"
    } else if s.contains("```") {
        "```"
    } else {
        return None;
    };
    let start = s.find(marker)?;
    let after = &s[start + marker.len()..];
    let end = after.find("```")?;
    let body = after[..end].trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

fn scan_balanced(s: &str, open: char, close: char) -> Option<String> {
    let start = s.find(open)?;
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in s[start..].char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                end = Some(start + i + 1);
                break;
            }
        }
    }
    let end = end?;
    Some(s[start..end].to_string())
}

/// Unwraps common envelope keys (`result`, `content`, `output`, `text`)
/// around a JSON payload, returning the inner value if one matches.
pub fn unwrap_envelope(value: &serde_json::Value) -> serde_json::Value {
    for key in ["result", "content", "output", "text"] {
        if let Some(inner) = value.get(key) {
            if inner.is_object() || inner.is_array() {
                return inner.clone();
            }
            if let Some(s) = inner.as_str() {
                if let Ok(parsed) = serde_json::from_str(s) {
                    return parsed;
                }
            }
        }
    }
    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_invalid() {
        assert!(!is_valid_analysis_output(""));
        assert!(!is_valid_analysis_output("   \n  "));
    }

    #[test]
    fn skeleton_outline_is_invalid() {
        let skeleton = "# Heading One\n# Heading Two\n# Heading Three\nshort\n";
        assert!(!is_valid_analysis_output(skeleton));
    }

    #[test]
    fn short_output_without_header_is_valid() {
        let short = "x".repeat(1023);
        assert!(is_valid_analysis_output(&short));
    }

    #[test]
    fn long_output_requires_header_and_newline() {
        let no_header = "x".repeat(2000);
        assert!(!is_valid_analysis_output(&no_header));

        let mut with_header = "# Analysis\n\n".to_string();
        with_header.push_str(&"content ".repeat(200));
        assert!(is_valid_analysis_output(&with_header));
    }

    #[test]
    fn moderator_output_recognizes_consensus_score_key() {
        assert!(is_valid_moderator_output("consensus_score: 0.8\nmore text"));
    }

    #[test]
    fn moderator_output_recognizes_anchor_sentinel() {
        assert!(is_valid_moderator_output(MODERATOR_ANCHOR_SENTINEL));
    }

    #[test]
    fn moderator_output_requires_keyword_with_markdown() {
        assert!(!is_valid_moderator_output("# Report\nNo relevant keyword here."));
        assert!(is_valid_moderator_output("# Report\nThere is broad agreement here."));
    }

    #[test]
    fn parses_literal_consensus_score_percent() {
        assert_eq!(parse_consensus_score("CONSENSUS_SCORE: 72%"), Some(0.72));
        assert_eq!(
            parse_consensus_score("**CONSENSUS_SCORE:** 86%"),
            Some(0.86)
        );
    }

    #[test]
    fn parses_score_in_fenced_block() {
        let text = "Result:\n```\nCONSENSUS_SCORE: 91%\n```\n";
        assert_eq!(parse_consensus_score(text), Some(0.91));
    }

    #[test]
    fn parses_prose_score() {
        assert_eq!(
            parse_consensus_score("The consensus score is 78% across analysts."),
            Some(0.78)
        );
    }

    #[test]
    fn parses_bare_decimal_score() {
        assert_eq!(parse_consensus_score("final value 0.64 observed"), Some(0.64));
    }

    #[test]
    fn parses_yaml_frontmatter_score() {
        let text = "---\nconsensus_score: 65\n---\nbody";
        assert_eq!(parse_consensus_score(text), Some(0.65));
    }

    #[test]
    fn rejects_unparseable_score() {
        assert_eq!(parse_consensus_score("no score information here"), None);
    }

    #[test]
    fn extract_balanced_json_scans_matching_braces() {
        let text = "prefix {\"a\": {\"b\": 1}} suffix";
        assert_eq!(
            extract_balanced_json(text),
            Some("{\"a\": {\"b\": 1}}".to_string())
        );
    }

    #[test]
    fn unwrap_envelope_unwraps_result_key() {
        let value = serde_json::json!({"result": {"tasks": []}});
        let unwrapped = unwrap_envelope(&value);
        assert_eq!(unwrapped, serde_json::json!({"tasks": []}));
    }
}
