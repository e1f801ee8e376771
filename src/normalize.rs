//! Record normalizer
//!
//! Turns one raw submission plus its replies into a [`UnifiedRecord`]. The
//! review form changed almost every year, so field extraction is driven by an
//! explicit table ([`FieldRules`]) keyed by year bucket rather than by
//! conditionals. API generation only decides how content is unwrapped (done by
//! [`RawNote`]) and whether the v2 `venueid` is consulted for the decision.
//!
//! Form history:
//! - ≤2017: `rating`, `review`, `confidence`; decisions posted as `acceptance`
//! - 2018-2021: same review form, separate `Meta_Review` with `recommendation`
//! - 2022: `main_review`, score under `recommendation`
//! - 2023: one `strength_and_weaknesses` block
//! - ≥2024: separate `strengths`, `weaknesses`, `questions`, score under `rating`

use crate::clock::Clock;
use crate::notes::{ApiVersion, RawDecision, RawMetaReview, RawNote, RawReview, RawSubmission};
use crate::report::{Anomaly, AnomalyKind};
use crate::unified::{Decision, MetaReview, PageMetadata, Review, UnifiedRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Used when a review carries no signature
const ANONYMOUS: &str = "Anonymous";

/// Review form generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearBucket {
    Legacy,
    Classic,
    Structured,
    Combined,
    Modern,
}

impl YearBucket {
    pub fn of(year: i32) -> Self {
        match year {
            ..=2017 => Self::Legacy,
            2018..=2021 => Self::Classic,
            2022 => Self::Structured,
            2023 => Self::Combined,
            _ => Self::Modern,
        }
    }
}

/// Ordered candidate content keys for each output field. The first key present
/// wins; an empty list means the field does not exist in that year's form.
#[derive(Debug)]
pub struct FieldRules {
    pub bucket: YearBucket,
    pub score: &'static [&'static str],
    pub confidence: &'static [&'static str],
    pub review_text: &'static [&'static str],
    pub strengths: &'static [&'static str],
    pub weaknesses: &'static [&'static str],
    pub questions: &'static [&'static str],
    pub meta_text: &'static [&'static str],
    pub meta_rationale: &'static [&'static str],
}

static FIELD_RULES: [FieldRules; 5] = [
    FieldRules {
        bucket: YearBucket::Legacy,
        score: &["rating"],
        confidence: &["confidence"],
        review_text: &["review", "comment"],
        strengths: &[],
        weaknesses: &[],
        questions: &[],
        meta_text: &["metareview", "comment"],
        meta_rationale: &["recommendation"],
    },
    FieldRules {
        bucket: YearBucket::Classic,
        score: &["rating", "recommendation"],
        confidence: &["confidence"],
        review_text: &["review", "comment"],
        strengths: &[],
        weaknesses: &[],
        questions: &[],
        meta_text: &["metareview", "comment"],
        meta_rationale: &["recommendation"],
    },
    FieldRules {
        bucket: YearBucket::Structured,
        score: &["recommendation", "rating"],
        confidence: &["confidence"],
        review_text: &["main_review", "summary_of_the_review", "review"],
        strengths: &[],
        weaknesses: &[],
        questions: &[],
        meta_text: &["metareview", "comment"],
        meta_rationale: &["recommendation"],
    },
    FieldRules {
        bucket: YearBucket::Combined,
        score: &["recommendation", "rating"],
        confidence: &["confidence"],
        review_text: &["summary_of_the_review", "summary_of_the_paper", "review"],
        strengths: &["strength_and_weaknesses"],
        weaknesses: &[],
        questions: &[],
        meta_text: &["metareview:_summary,_strengths_and_weaknesses", "metareview", "comment"],
        meta_rationale: &["justification_for_why_not_higher_score", "recommendation"],
    },
    FieldRules {
        bucket: YearBucket::Modern,
        score: &["rating", "recommendation"],
        confidence: &["confidence"],
        review_text: &["summary", "review"],
        strengths: &["strengths"],
        weaknesses: &["weaknesses"],
        questions: &["questions"],
        meta_text: &["metareview", "comment"],
        meta_rationale: &[
            "justification_for_why_not_higher_score",
            "additional_comments_on_reviewer_discussion",
            "recommendation",
        ],
    },
];

/// Extraction rules for a year's review form.
pub fn rules_for(year: i32) -> &'static FieldRules {
    let bucket = YearBucket::of(year);
    FIELD_RULES
        .iter()
        .find(|rules| rules.bucket == bucket)
        .unwrap_or(&FIELD_RULES[FIELD_RULES.len() - 1])
}

/// A record plus everything odd noticed while building it
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: UnifiedRecord,
    pub anomalies: Vec<Anomaly>,
}

/// Builds unified records. Holds only configuration and the clock.
pub struct Normalizer {
    site_url: String,
    venue: String,
    clock: Arc<dyn Clock>,
}

impl Normalizer {
    pub fn new(site_url: &str, venue: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            site_url: site_url.trim_end_matches('/').to_string(),
            venue: venue.to_string(),
            clock,
        }
    }

    /// Build the unified record for one submission. `year` is the year whose
    /// invitation produced the submission; content is never consulted for it.
    pub fn normalize(
        &self,
        submission: &RawSubmission,
        reviews: &[RawReview],
        meta_review: Option<&RawMetaReview>,
        decision: Option<&RawDecision>,
        year: i32,
    ) -> Normalized {
        let rules = rules_for(year);
        let mut scope = Scope {
            year,
            paper_id: &submission.id,
            anomalies: Vec::new(),
        };

        let official_reviews: Vec<Review> = reviews
            .iter()
            .map(|review| scope.review(review, rules))
            .collect();
        let decision = scope.decision(submission, meta_review, decision);
        let meta_review = meta_review.map(|meta| MetaReview {
            text: scope.scalar(meta, rules.meta_text),
            decision_rationale: scope.scalar(meta, rules.meta_rationale),
        });

        let record = UnifiedRecord {
            paper_id: submission.id.clone(),
            year,
            title: scope.scalar(submission, &["title"]),
            authors: scope.string_list(submission, "authors"),
            affiliations: scope.string_list(submission, "affiliations"),
            abstract_text: scope.scalar(submission, &["abstract"]),
            url: format!("{}/forum?id={}", self.site_url, submission.id),
            pdf_url: self.pdf_url(&scope.scalar(submission, &["pdf"])),
            page_metadata: PageMetadata {
                venue: format!("{}/{}/Conference", self.venue, year),
                keywords: scope.string_list(submission, "keywords"),
                number: submission.number,
            },
            official_reviews,
            meta_review,
            decision,
            crawl_timestamp: self
                .clock
                .now()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        };

        Normalized {
            record,
            anomalies: scope.anomalies,
        }
    }

    fn pdf_url(&self, pdf: &str) -> String {
        if pdf.is_empty() || pdf.starts_with("http://") || pdf.starts_with("https://") {
            pdf.to_string()
        } else if pdf.starts_with('/') {
            format!("{}{}", self.site_url, pdf)
        } else {
            format!("{}/{}", self.site_url, pdf)
        }
    }
}

/// Anomaly collection for one submission
struct Scope<'a> {
    year: i32,
    paper_id: &'a str,
    anomalies: Vec<Anomaly>,
}

impl Scope<'_> {
    fn flag(&mut self, kind: AnomalyKind, detail: String) {
        warn!(year = self.year, paper_id = %self.paper_id, kind = kind.label(), "{}", detail);
        self.anomalies
            .push(Anomaly::for_paper(self.year, self.paper_id, kind, detail));
    }

    /// First present key rendered as text. Lists and objects are not text; they
    /// are reported and the field is left empty.
    fn scalar(&mut self, note: &RawNote, keys: &[&str]) -> String {
        match note.first_field(keys) {
            None => String::new(),
            Some((_, Value::String(s))) => s.clone(),
            Some((_, Value::Number(n))) => n.to_string(),
            Some((_, Value::Bool(b))) => b.to_string(),
            Some((key, other)) => {
                let detail = format!(
                    "note {} field '{}' is {}, expected text",
                    note.id,
                    key,
                    json_kind(other)
                );
                self.flag(AnomalyKind::SchemaAnomaly, detail);
                String::new()
            }
        }
    }

    fn string_list(&mut self, note: &RawNote, key: &str) -> Vec<String> {
        match note.field(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(s.clone()),
                        other => {
                            let detail = format!(
                                "note {} field '{}' has a {} entry",
                                note.id,
                                key,
                                json_kind(other)
                            );
                            self.flag(AnomalyKind::SchemaAnomaly, detail);
                        }
                    }
                }
                out
            }
            Some(Value::String(s)) => {
                self.flag(
                    AnomalyKind::SchemaAnomaly,
                    format!("note {} field '{}' is a string, expected a list", note.id, key),
                );
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(String::from)
                    .collect()
            }
            Some(other) => {
                let detail = format!(
                    "note {} field '{}' is {}, expected a list",
                    note.id,
                    key,
                    json_kind(other)
                );
                self.flag(AnomalyKind::SchemaAnomaly, detail);
                Vec::new()
            }
        }
    }

    fn review(&mut self, note: &RawReview, rules: &FieldRules) -> Review {
        Review {
            reviewer_id: note
                .signatures
                .first()
                .cloned()
                .unwrap_or_else(|| ANONYMOUS.to_string()),
            score: self.scalar(note, rules.score),
            confidence: self.scalar(note, rules.confidence),
            text: self.scalar(note, rules.review_text),
            date: note.created_ms().map(iso_date).unwrap_or_default(),
            strengths: self.scalar(note, rules.strengths),
            weaknesses: self.scalar(note, rules.weaknesses),
            questions: self.scalar(note, rules.questions),
        }
    }

    /// Decision note, then meta-review recommendation, then the submission's own
    /// venue fields.
    fn decision(
        &mut self,
        submission: &RawSubmission,
        meta_review: Option<&RawMetaReview>,
        decision: Option<&RawDecision>,
    ) -> Option<Decision> {
        let non_blank = |s: &String| !s.trim().is_empty();
        let raw = decision
            .and_then(|note| note.text("decision"))
            .filter(non_blank)
            .or_else(|| {
                meta_review
                    .and_then(|note| note.text("recommendation"))
                    .filter(non_blank)
            });

        match raw {
            Some(raw) => self.classify(raw),
            None => self.venue_decision(submission),
        }
    }

    fn venue_decision(&mut self, submission: &RawSubmission) -> Option<Decision> {
        if submission.version == ApiVersion::V2 {
            if let Some(venueid) = submission.text("venueid") {
                if venueid.ends_with("Rejected_Submission") {
                    return Some(Decision::Reject);
                }
                if venueid.ends_with("Withdrawn_Submission") {
                    return None;
                }
            }
        }

        let venue = submission.text("venue")?;
        let lowered = venue.trim().to_ascii_lowercase();
        if lowered.starts_with("submitted to") || lowered.contains("withdrawn") {
            return None;
        }
        self.classify(venue)
    }

    fn classify(&mut self, raw: String) -> Option<Decision> {
        let decision = Decision::normalize(&raw)?;
        if !decision.is_recognized() {
            self.flag(
                AnomalyKind::UnrecognizedDecision,
                format!("decision '{}' kept verbatim", raw.trim()),
            );
        }
        Some(decision)
    }
}

fn iso_date(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
