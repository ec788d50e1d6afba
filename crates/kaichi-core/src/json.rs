use crate::{KaichiError, KaichiResult};
use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    // (?s) so the body may span lines; the language tag is optional.
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap()
});

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r",\s*([}\]])").unwrap()
});

static UNQUOTED_KEY: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap()
});

/// Extract the bare JSON substring from an LLM answer.
///
/// Accepts raw JSON, JSON wrapped in a markdown code fence, or JSON
/// embedded in surrounding prose. Returns the input unchanged when no
/// narrower candidate is found.
pub fn extract_json_from_markdown(content: &str) -> String {
    let trimmed = content.trim();

    if let Some(caps) = FENCED_JSON.captures(trimmed) {
        return caps[1].trim().to_string();
    }

    // Unfenced JSON with prose around it: take the outermost brace or
    // bracket span.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                return trimmed[start..=end].to_string();
            }
        }
    }

    trimmed.to_string()
}

/// Parse an LLM answer as JSON, tolerating markdown fencing, trailing
/// commas, and unquoted object keys before giving up.
pub fn fix_and_parse_json(content: &str) -> KaichiResult<serde_json::Value> {
    let candidate = extract_json_from_markdown(content);

    if let Ok(value) = serde_json::from_str(&candidate) {
        return Ok(value);
    }

    let repaired = TRAILING_COMMA.replace_all(&candidate, "$1");
    let repaired = UNQUOTED_KEY.replace_all(&repaired, "$1\"$2\":");

    serde_json::from_str(&repaired).map_err(|e| {
        KaichiError::Parse(format!("Invalid JSON in LLM answer: {e}: {candidate}"))
    })
}
