use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// Characters of chunk text folded into the identifier.
const ID_TEXT_PREFIX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Html,
    Pdf,
    Faq,
    Form,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Html => "html",
            ContentType::Pdf => "pdf",
            ContentType::Faq => "faq",
            ContentType::Form => "form",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page-level attributes shared by every chunk cut from one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSource {
    pub url: String,
    pub title: String,
    pub section_heading: Option<String>,
    pub content_type: ContentType,
    pub crawl_ts: DateTime<Utc>,
    pub last_modified: Option<DateTime<Utc>>,
    pub language: String,
}

impl ChunkSource {
    pub fn new(url: impl Into<String>, title: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            section_heading: None,
            content_type,
            crawl_ts: Utc::now(),
            last_modified: None,
            language: "en".to_string(),
        }
    }

    pub fn with_section(mut self, heading: impl Into<String>) -> Self {
        self.section_heading = Some(heading.into());
        self
    }
}

/// Unit of retrievable knowledge as stored in the vector index payload.
///
/// The vector itself travels next to the payload, never inside it. Payloads
/// written by other producers may omit `id` (carried as the point id),
/// `hash`, and `embedding_model`, and may carry offset-less timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub section_heading: Option<String>,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    pub content_type: ContentType,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub crawl_ts: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub tokens: usize,
    #[serde(default)]
    pub hash: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

fn default_language() -> String {
    "en".to_string()
}

/// RFC 3339, or a naive ISO 8601 timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc()),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(de::Error::custom)
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| parse_timestamp(&raw))
        .transpose()
        .map_err(de::Error::custom)
}

impl ChunkRecord {
    pub fn new(
        source: ChunkSource,
        text: String,
        char_start: usize,
        char_end: usize,
        embedding: Vec<f32>,
        embedding_model: impl Into<String>,
    ) -> Result<Self, AppError> {
        if char_start >= char_end {
            return Err(AppError::Validation(format!(
                "chunk offsets must satisfy start < end (got {char_start}..{char_end})"
            )));
        }

        let id = chunk_id(&source.url, char_start, char_end, &text);
        let tokens = estimate_tokens(&text);
        let hash = content_hash(&text);

        Ok(Self {
            id,
            url: source.url,
            title: source.title,
            section_heading: source.section_heading,
            text,
            char_start,
            char_end,
            content_type: source.content_type,
            crawl_ts: source.crawl_ts,
            last_modified: source.last_modified,
            language: source.language,
            embedding_model: embedding_model.into(),
            tokens,
            hash,
            embedding,
        })
    }

    /// Derives fields a foreign payload left out. `point_id` is the id the
    /// record was stored under.
    pub fn fill_missing(&mut self, point_id: &str) {
        if self.id.is_empty() {
            self.id = point_id.to_string();
        }
        if self.hash.is_empty() {
            self.hash = content_hash(&self.text);
        }
        if self.tokens == 0 {
            self.tokens = estimate_tokens(&self.text);
        }
    }

    /// Value of a filterable attribute, by payload key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "content_type" => Some(self.content_type.as_str()),
            "url" => Some(&self.url),
            "title" => Some(&self.title),
            "section_heading" => self.section_heading.as_deref(),
            "language" => Some(&self.language),
            "embedding_model" => Some(&self.embedding_model),
            _ => None,
        }
    }
}

/// Deterministic identifier over (url, offsets, text prefix).
pub fn chunk_id(url: &str, char_start: usize, char_end: usize, text: &str) -> String {
    let prefix: String = text.chars().take(ID_TEXT_PREFIX_CHARS).collect();
    let name = format!("{url}{char_start}{char_end}{prefix}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Rough token count: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ChunkSource {
        ChunkSource::new(
            "https://www.irs.gov/filing",
            "Filing",
            ContentType::Html,
        )
        .with_section("Who must file")
    }

    #[test]
    fn identifier_is_stable_across_reingestion() {
        let text = "Most people must file a return if income exceeds the filing threshold.";
        let first = ChunkRecord::new(source(), text.into(), 0, 72, vec![0.1], "m").expect("valid");
        let second = ChunkRecord::new(source(), text.into(), 0, 72, vec![0.9], "m").expect("valid");

        assert_eq!(first.id, second.id);
        assert!(Uuid::parse_str(&first.id).is_ok());
        assert_ne!(first.id, chunk_id("https://www.irs.gov/filing", 1, 72, text));
    }

    #[test]
    fn only_the_first_hundred_chars_feed_the_identifier() {
        let base = "a".repeat(100);
        let longer = format!("{base}tail that differs");
        assert_eq!(
            chunk_id("https://x", 0, 10, &base),
            chunk_id("https://x", 0, 10, &longer)
        );
    }

    #[test]
    fn inverted_or_empty_offsets_are_rejected() {
        let err = ChunkRecord::new(source(), "text".into(), 10, 10, Vec::new(), "m")
            .expect_err("empty span");
        assert!(matches!(err, AppError::Validation(_)));
        assert!(ChunkRecord::new(source(), "text".into(), 12, 3, Vec::new(), "m").is_err());
    }

    #[test]
    fn derived_fields() {
        let record =
            ChunkRecord::new(source(), "abcdefghij".into(), 0, 10, Vec::new(), "m").expect("valid");
        assert_eq!(record.tokens, 2);
        assert_eq!(record.hash.len(), 64);
        assert_eq!(record.language, "en");
        assert_eq!(record.attribute("content_type"), Some("html"));
        assert_eq!(record.attribute("section_heading"), Some("Who must file"));
        assert_eq!(record.attribute("embedding"), None);
    }

    #[test]
    fn payload_omits_the_vector() {
        let record =
            ChunkRecord::new(source(), "abcdefghij".into(), 0, 10, vec![1.0, 2.0], "m").expect("valid");
        let payload = serde_json::to_value(&record).expect("serialize");
        assert!(payload.get("embedding").is_none());
        assert_eq!(payload["content_type"], "html");

        let back: ChunkRecord = serde_json::from_value(payload).expect("deserialize");
        assert!(back.embedding.is_empty());
        assert_eq!(back.id, record.id);
    }

    #[test]
    fn ingest_payload_without_id_or_offset_decodes() {
        let payload = serde_json::json!({
            "url": "https://www.irs.gov/publications/p501",
            "title": "Standard deduction",
            "section_heading": null,
            "text": "The standard deduction for single filers is $14,600.",
            "char_start": 0,
            "char_end": 52,
            "content_type": "html",
            "crawl_ts": "2024-05-01T12:34:56.789012",
            "language": "en",
            "embedding_model": "local",
            "tokens": 13,
            "hash": "abc123"
        });

        let mut record: ChunkRecord = serde_json::from_value(payload).expect("deserialize");
        assert!(record.id.is_empty());
        assert_eq!(
            record.crawl_ts.to_rfc3339(),
            "2024-05-01T12:34:56.789012+00:00"
        );
        assert_eq!(record.last_modified, None);

        record.fill_missing("5f0c1b2e-8d7a-5c3e-9b1a-0e2f4d6c8a10");
        assert_eq!(record.id, "5f0c1b2e-8d7a-5c3e-9b1a-0e2f4d6c8a10");
        assert_eq!(record.hash, "abc123");
        assert_eq!(record.tokens, 13);
    }

    #[test]
    fn missing_hash_and_tokens_are_derived() {
        let payload = serde_json::json!({
            "url": "https://www.irs.gov/faq",
            "title": "FAQ",
            "text": "abcdefgh",
            "char_start": 0,
            "char_end": 8,
            "content_type": "faq",
            "crawl_ts": "2024-05-01T12:34:56Z",
            "last_modified": "2024-04-30T08:00:00"
        });

        let mut record: ChunkRecord = serde_json::from_value(payload).expect("deserialize");
        record.fill_missing("7");
        assert_eq!(record.id, "7");
        assert_eq!(record.hash, content_hash("abcdefgh"));
        assert_eq!(record.tokens, 2);
        assert_eq!(record.embedding_model, "");
        assert!(record.last_modified.is_some());
    }

    #[test]
    fn timestamps_accept_offsets_and_naive_forms() {
        let zoned = parse_timestamp("2024-05-01T14:34:56+02:00").expect("rfc3339");
        let naive = parse_timestamp("2024-05-01T12:34:56").expect("naive");
        assert_eq!(zoned, naive);
        assert!(parse_timestamp("May 1st").is_err());
    }
}
