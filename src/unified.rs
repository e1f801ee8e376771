//! Unified record schema
//!
//! One [`UnifiedRecord`] per submission, identical in shape for every year and
//! both API generations. Absent text is `""`, absent lists are `[]`, and the
//! optional parts (`meta_review`, `decision`, `page_metadata.number`) are
//! serialized as `null` rather than omitted.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Top-level keys every output line carries, in output order
pub const UNIFIED_FIELDS: &[&str] = &[
    "paper_id",
    "year",
    "title",
    "authors",
    "affiliations",
    "abstract",
    "url",
    "pdf_url",
    "page_metadata",
    "official_reviews",
    "meta_review",
    "decision",
    "crawl_timestamp",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub paper_id: String,
    pub year: i32,
    pub title: String,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub url: String,
    pub pdf_url: String,
    pub page_metadata: PageMetadata,
    pub official_reviews: Vec<Review>,
    pub meta_review: Option<MetaReview>,
    pub decision: Option<Decision>,
    /// ISO-8601, assigned when the record was normalized
    pub crawl_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub venue: String,
    pub keywords: Vec<String>,
    pub number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: String,
    pub score: String,
    pub confidence: String,
    pub text: String,
    pub date: String,
    pub strengths: String,
    pub weaknesses: String,
    pub questions: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaReview {
    pub text: String,
    pub decision_rationale: String,
}

/// Final decision. Serialized as its lowercase name; unrecognized raw values are
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    Accept,
    Reject,
    Poster,
    Oral,
    Spotlight,
    Workshop,
    Unrecognized(String),
}

impl Decision {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Poster => "poster",
            Self::Oral => "oral",
            Self::Spotlight => "spotlight",
            Self::Workshop => "workshop",
            Self::Unrecognized(raw) => raw,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    /// Map a raw decision string onto the vocabulary. Blank input yields `None`.
    ///
    /// More specific outcomes win over plain "accept": `Accept (Oral)` is
    /// [`Decision::Oral`], `Accept: notable-top-25%` is [`Decision::Spotlight`].
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let matched = vocabulary()
            .iter()
            .find(|(pattern, _)| pattern.is_match(trimmed))
            .map(|(_, decision)| decision.clone());

        Some(matched.unwrap_or_else(|| Self::Unrecognized(trimmed.to_string())))
    }
}

fn vocabulary() -> &'static [(Regex, Decision)] {
    static VOCABULARY: OnceLock<Vec<(Regex, Decision)>> = OnceLock::new();
    VOCABULARY.get_or_init(|| {
        [
            (r"(?i)\breject", Decision::Reject),
            (r"(?i)\bworkshop\b", Decision::Workshop),
            (r"(?i)\boral\b|notable[\s-]*top[\s-]*5\s*%", Decision::Oral),
            (r"(?i)\bspotlight\b|notable[\s-]*top[\s-]*25\s*%", Decision::Spotlight),
            (r"(?i)\bposter\b", Decision::Poster),
            (r"(?i)\baccept", Decision::Accept),
        ]
        .into_iter()
        .filter_map(|(pattern, decision)| Regex::new(pattern).ok().map(|re| (re, decision)))
        .collect()
    })
}

impl From<String> for Decision {
    fn from(value: String) -> Self {
        match value.as_str() {
            "accept" => Self::Accept,
            "reject" => Self::Reject,
            "poster" => Self::Poster,
            "oral" => Self::Oral,
            "spotlight" => Self::Spotlight,
            "workshop" => Self::Workshop,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<Decision> for String {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Unrecognized(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}
