//! Tolerant JSON extraction from free-form model output (spec.md §4.D).
//!
//! Five stages run in order, short-circuiting on the first successful
//! parse: direct parse, pattern extraction, bracket-slice, aggressive
//! repair, final parse. Every repair actually applied is recorded so
//! callers can log exactly what happened to the payload.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// One repair applied while trying to recover a parseable payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    StrippedFence,
    BracketSliced,
    QuotedBarewordKey,
    SingleToDoubleQuote,
    DroppedTrailingComma,
    ClosedUnterminatedString,
    CollapsedEllipsis,
    QuotedBareCjkScalar,
    StrippedHtml,
}

#[derive(Debug)]
pub enum ExtractOutcome {
    Ok { data: Value, repairs: Vec<RepairStep> },
    Err { repairs: Vec<RepairStep> },
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());
static OUTER_OBJECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());
static OUTER_ARRAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").unwrap());
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static BAREWORD_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<pre>[{,]\s*)(?P<key>[A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap());
static TRAILING_COMMA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());
static ELLIPSIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{3,}|…").unwrap());
static BARE_CJK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<pre>:\s*)(?P<value>[\p{Han}\p{Hiragana}\p{Katakana}][^,\}\]\n]*)").unwrap()
});

/// Recover a structured value from `input`, trying increasingly invasive
/// repairs (spec.md §4.D).
pub fn extract(input: &str) -> ExtractOutcome {
    let mut repairs = Vec::new();
    let trimmed = input.trim();

    // Stage 1: direct parse.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return ExtractOutcome::Ok { data: value, repairs };
    }

    // Stage 2: pattern extraction — fenced block first, then the outermost
    // bracketed region.
    let mut candidate = trimmed.to_string();
    if let Some(caps) = FENCE_RE.captures(trimmed) {
        candidate = caps[1].to_string();
        repairs.push(RepairStep::StrippedFence);
        if let Ok(value) = serde_json::from_str::<Value>(candidate.trim()) {
            return ExtractOutcome::Ok { data: value, repairs };
        }
    }

    if let Some(m) = OUTER_OBJECT_RE.find(&candidate).or_else(|| OUTER_ARRAY_RE.find(&candidate)) {
        let sliced = m.as_str().to_string();
        if sliced != candidate {
            candidate = sliced;
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(candidate.trim()) {
        return ExtractOutcome::Ok { data: value, repairs };
    }

    // Stage 3: bracket-slice — first opening bracket to matching last
    // closing bracket, accepted only if meaningfully shorter.
    if let Some(sliced) = bracket_slice(&candidate) {
        if sliced.len() as f64 <= candidate.len() as f64 * 0.9 {
            repairs.push(RepairStep::BracketSliced);
            candidate = sliced;
            if let Ok(value) = serde_json::from_str::<Value>(candidate.trim()) {
                return ExtractOutcome::Ok { data: value, repairs };
            }
        }
    }

    // Stage 4: aggressive repair.
    let repaired = aggressive_repair(&candidate, &mut repairs);

    // Stage 5: final parse attempt.
    match serde_json::from_str::<Value>(repaired.trim()) {
        Ok(value) => ExtractOutcome::Ok { data: value, repairs },
        Err(_) => ExtractOutcome::Err { repairs },
    }
}

fn bracket_slice(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let open_pos = input.find(['{', '['])?;
    let open = bytes[open_pos] as char;
    let close = if open == '{' { '}' } else { ']' };
    let close_pos = input.rfind(close)?;
    if close_pos <= open_pos {
        return None;
    }
    Some(input[open_pos..=close_pos].to_string())
}

fn aggressive_repair(input: &str, repairs: &mut Vec<RepairStep>) -> String {
    let mut out = input.to_string();

    if HTML_TAG_RE.is_match(&out) {
        out = HTML_TAG_RE.replace_all(&out, "").to_string();
        repairs.push(RepairStep::StrippedHtml);
    }

    let without_fence = out.replace("```json", "").replace("```", "");
    if without_fence != out {
        out = without_fence;
        repairs.push(RepairStep::StrippedFence);
    }

    if TRAILING_COMMA_RE.is_match(&out) {
        out = TRAILING_COMMA_RE.replace_all(&out, "$1").to_string();
        repairs.push(RepairStep::DroppedTrailingComma);
    }

    if BAREWORD_KEY_RE.is_match(&out) {
        out = BAREWORD_KEY_RE
            .replace_all(&out, "$pre\"$key\":")
            .to_string();
        repairs.push(RepairStep::QuotedBarewordKey);
    }

    if out.contains('\'') {
        let swapped = out.replace('\'', "\"");
        if swapped != out {
            out = swapped;
            repairs.push(RepairStep::SingleToDoubleQuote);
        }
    }

    if ELLIPSIS_RE.is_match(&out) {
        out = ELLIPSIS_RE.replace_all(&out, "").to_string();
        repairs.push(RepairStep::CollapsedEllipsis);
    }

    if BARE_CJK_RE.is_match(&out) {
        out = BARE_CJK_RE
            .replace_all(&out, |caps: &regex::Captures| {
                format!("{}\"{}\"", &caps["pre"], caps["value"].trim())
            })
            .to_string();
        repairs.push(RepairStep::QuotedBareCjkScalar);
    }

    if let Some(closed) = close_unterminated_trailing_string(&out) {
        out = closed;
        repairs.push(RepairStep::ClosedUnterminatedString);
    }

    out
}

/// If the last non-empty line has an odd number of unescaped double
/// quotes, close the dangling string at end-of-line.
fn close_unterminated_trailing_string(input: &str) -> Option<String> {
    let mut lines: Vec<String> = input.lines().map(str::to_string).collect();
    let idx = lines.iter().rposition(|l| !l.trim().is_empty())?;
    let quote_count = lines[idx].chars().filter(|c| *c == '"').count();
    if quote_count % 2 == 1 {
        lines[idx].push('"');
        Some(lines.join("\n"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_parse_succeeds_with_no_repairs() {
        let outcome = extract(r#"{"a": 1}"#);
        match outcome {
            ExtractOutcome::Ok { data, repairs } => {
                assert_eq!(data["a"], 1);
                assert!(repairs.is_empty());
            }
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn strips_fenced_code_block() {
        let input = "here is the plan:\n```json\n{\"a\": 1}\n```\nthanks";
        match extract(input) {
            ExtractOutcome::Ok { data, repairs } => {
                assert_eq!(data["a"], 1);
                assert!(repairs.contains(&RepairStep::StrippedFence));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn drops_trailing_comma() {
        let input = r#"{"a": 1, "b": 2,}"#;
        match extract(input) {
            ExtractOutcome::Ok { data, repairs } => {
                assert_eq!(data["b"], 2);
                assert!(repairs.contains(&RepairStep::DroppedTrailingComma));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn quotes_bareword_keys() {
        let input = r#"{a: 1, b: "two"}"#;
        match extract(input) {
            ExtractOutcome::Ok { data, repairs } => {
                assert_eq!(data["a"], 1);
                assert!(repairs.contains(&RepairStep::QuotedBarewordKey));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn converts_single_to_double_quotes() {
        let input = "{'a': 'one'}";
        match extract(input) {
            ExtractOutcome::Ok { data, .. } => assert_eq!(data["a"], "one"),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn unrecoverable_garbage_returns_err_with_repair_trail() {
        let outcome = extract("this is not json at all, just prose.");
        assert!(matches!(outcome, ExtractOutcome::Err { .. }));
    }

    #[test]
    fn bracket_slice_only_accepted_when_meaningfully_shorter() {
        let noisy = format!("leading noise {} trailing noise", r#"{"a": 1}"#);
        match extract(&noisy) {
            ExtractOutcome::Ok { data, .. } => assert_eq!(data["a"], 1),
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}
