//! Best-effort conversion of free-form model output into a narrative plus exactly
//! three options.

use serde::Deserialize;
use thiserror::Error;

/// Number of forward options every segment offers.
pub const OPTION_COUNT: usize = 3;

/// Deterministic options used to pad short or missing option lists.
pub const FILLER_OPTIONS: [&str; OPTION_COUNT] = [
    "Continue exploring",
    "Ask a companion for help",
    "Rest and reflect",
];

const MAX_OPTION_CHARS: usize = 200;

/// Narrative and options extracted from a generator reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    /// Narrative text, trimmed.
    pub text: String,
    /// Always exactly [`OPTION_COUNT`] distinct, non-empty entries.
    pub options: Vec<String>,
}

/// Why a reply could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing but options or whitespace.
    #[error("reply contains no narrative text")]
    EmptyNarrative,
}

#[derive(Deserialize)]
struct JsonReply {
    #[serde(default, alias = "narrative", alias = "story")]
    text: String,
    #[serde(default, alias = "choices", alias = "actions")]
    options: Vec<String>,
}

/// Parse a JSON object `{"text", "options"}` or prose followed by a list.
pub fn parse_reply(raw: &str) -> Result<ParsedReply, ParseError> {
    let raw = strip_code_fence(raw);

    let (text, options) = match parse_json(raw) {
        Some(reply) => (reply.text.trim().to_owned(), reply.options),
        None => parse_prose(raw),
    };

    if text.is_empty() {
        return Err(ParseError::EmptyNarrative);
    }

    Ok(ParsedReply {
        text,
        options: normalize_options(options),
    })
}

/// Trim, drop empties, dedupe case-insensitively, keep three, pad with fillers.
pub fn normalize_options<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut options: Vec<String> = Vec::with_capacity(OPTION_COUNT);
    let candidates = raw
        .into_iter()
        .map(|option| clean_option(option.as_ref()))
        .chain(FILLER_OPTIONS.iter().map(|filler| filler.to_string()));

    for candidate in candidates {
        if options.len() == OPTION_COUNT {
            break;
        }
        let duplicate = options
            .iter()
            .any(|existing| existing.to_lowercase() == candidate.to_lowercase());
        if !candidate.is_empty() && !duplicate {
            options.push(candidate);
        }
    }
    options
}

fn clean_option(option: &str) -> String {
    let trimmed = option
        .trim()
        .trim_matches(|c: char| c == '*' || c == '"' || c == '`')
        .trim();
    trimmed.chars().take(MAX_OPTION_CHARS).collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the language tag on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_json(raw: &str) -> Option<JsonReply> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn parse_prose(raw: &str) -> (String, Vec<String>) {
    let mut narrative: Vec<&str> = Vec::new();
    let mut options: Vec<String> = Vec::new();

    for line in raw.lines().map(str::trim) {
        if let Some(option) = list_item(line) {
            options.push(option.to_owned());
        } else if options.is_empty() && !line.is_empty() {
            narrative.push(line);
        }
    }

    // "What do you do next:" style headers introduce the list, they are not story.
    if !options.is_empty() && narrative.last().is_some_and(|line| line.ends_with(':')) {
        narrative.pop();
    }

    (narrative.join(" "), options)
}

/// Content of a list line (`1.`, `2)`, `-`, `*`, `•`, `Option 1:`), if it is one.
fn list_item(line: &str) -> Option<&str> {
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest);
        }
    }

    let lower = line.to_ascii_lowercase();
    let numbered = if lower.starts_with("option ") {
        &line["option ".len()..]
    } else {
        line
    };

    let digits = numbered.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 || digits > 2 {
        return None;
    }
    let rest = &numbered[digits..];
    let rest = rest
        .strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .or_else(|| rest.strip_prefix(':'))?;
    rest.starts_with(' ').then(|| rest.trim_start())
}
