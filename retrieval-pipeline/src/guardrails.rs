use std::sync::LazyLock;

use common::{
    error::AppError,
    storage::{
        types::message::{validate_history, Message},
        vector_store::{validate_filters, SearchFilters},
    },
};
use regex::Regex;

pub const NO_KNOWLEDGE_MESSAGE: &str =
    "I don't have verifiable information in the knowledge base for that query.";

pub const MAX_QUERY_CHARS: usize = 2000;

const PREVIEW_CHARS: usize = 120;

pub const ADVICE_KEYWORDS: [&str; 10] = [
    "should i file",
    "what should i claim",
    "advice",
    "deduct",
    "penalty strategy",
    "how should i",
    "what do you recommend",
    "should i",
    "can i claim",
    "what can i deduct",
];

static SSN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").ok());
static EIN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b\d{2}-\d{7}\b").ok());

/// Whether the answer must open with the legal disclaimer.
///
/// Keywords match whole words, so "deduct" does not fire on "deduction".
pub fn needs_disclaimer(query: &str) -> bool {
    let lowered = query.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let padded = format!(" {} ", words.join(" "));

    ADVICE_KEYWORDS
        .iter()
        .any(|keyword| padded.contains(&format!(" {keyword} ")))
}

pub fn validate_query(query: &str) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".into()));
    }
    let chars = query.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(AppError::Validation(format!(
            "query is {chars} characters; the limit is {MAX_QUERY_CHARS}"
        )));
    }
    Ok(())
}

/// All caller-supplied input checks in one place.
pub fn validate_request(
    query: &str,
    filters: &SearchFilters,
    history: &[Message],
) -> Result<(), AppError> {
    validate_query(query)?;
    validate_filters(filters)?;
    validate_history(history)
}

/// Replaces SSN- and EIN-shaped numbers before text reaches the logs.
pub fn mask_pii(text: &str) -> String {
    let masked = match SSN.as_ref() {
        Some(ssn) => ssn.replace_all(text, "XXX-XX-XXXX").into_owned(),
        None => text.to_owned(),
    };
    match EIN.as_ref() {
        Some(ein) => ein.replace_all(&masked, "XX-XXXXXXX").into_owned(),
        None => masked,
    }
}

/// Masked, single-line, 120-character preview of a query for logging.
/// Returns the preview and whether it was truncated.
pub fn log_preview(text: &str) -> (String, bool) {
    let masked = mask_pii(text);
    let preview: String = masked
        .chars()
        .take(PREVIEW_CHARS)
        .collect::<String>()
        .replace('\n', " ");
    let truncated = masked.chars().count() > PREVIEW_CHARS;
    (preview, truncated)
}
