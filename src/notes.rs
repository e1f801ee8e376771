//! Raw OpenReview notes as returned by either API generation.
//!
//! API v1 stores note content as plain values (`"title": "..."`), API v2
//! wraps every content field (`"title": {"value": "..."}`). A [`RawNote`]
//! remembers which generation it came from and all content access goes
//! through [`RawNote::field`], so nothing downstream has to care.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Record API schema generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    #[default]
    V1,
    V2,
}

impl ApiVersion {
    pub fn label(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    /// Strip the `{"value": ...}` wrapper v2 puts around content fields.
    pub fn unwrap_field(self, raw: &Value) -> &Value {
        match self {
            Self::V2 => raw
                .as_object()
                .and_then(|obj| obj.get("value"))
                .unwrap_or(raw),
            Self::V1 => raw,
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One note: a submission, review, meta-review, decision or comment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNote {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub forum: Option<String>,
    #[serde(default)]
    pub number: Option<i64>,
    /// v1 carries a single invitation
    #[serde(default)]
    pub invitation: Option<String>,
    /// v2 carries a list of invitations
    #[serde(default, deserialize_with = "null_as_default")]
    pub invitations: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub cdate: Option<i64>,
    #[serde(default)]
    pub tcdate: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub details: Option<NoteDetails>,
    #[serde(skip)]
    pub version: ApiVersion,
}

/// Replies embedded by `details=directReplies` (v1)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteDetails {
    #[serde(rename = "directReplies", default)]
    pub direct_replies: Option<Vec<RawNote>>,
    #[serde(default)]
    pub replies: Option<Vec<RawNote>>,
}

pub type RawSubmission = RawNote;
pub type RawReview = RawNote;
pub type RawMetaReview = RawNote;
pub type RawDecision = RawNote;

/// What a forum reply is, judged by its invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Review,
    MetaReview,
    Decision,
    Other,
}

impl RawNote {
    /// Tag this note (and any embedded replies) with the generation it came from.
    pub fn with_version(mut self, version: ApiVersion) -> Self {
        self.version = version;
        if let Some(details) = self.details.take() {
            let tag = |notes: Option<Vec<RawNote>>| {
                notes.map(|ns| ns.into_iter().map(|n| n.with_version(version)).collect())
            };
            self.details = Some(NoteDetails {
                direct_replies: tag(details.direct_replies),
                replies: tag(details.replies),
            });
        }
        self
    }

    /// Content field with the version wrapper removed. JSON null counts as absent.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.content
            .get(key)
            .map(|raw| self.version.unwrap_field(raw))
            .filter(|v| !v.is_null())
    }

    /// Scalar content field rendered as text.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.field(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// First of `keys` that holds a scalar.
    pub fn first_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.text(key))
    }

    /// First of `keys` that is present at all, with the key that matched.
    pub fn first_field<'a>(&'a self, keys: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        keys.iter()
            .find_map(|key| self.field(key).map(|value| (*key, value)))
    }

    pub fn invitation_ids(&self) -> impl Iterator<Item = &str> {
        self.invitation
            .iter()
            .map(String::as_str)
            .chain(self.invitations.iter().map(String::as_str))
    }

    pub fn reply_kind(&self) -> ReplyKind {
        let mut kind = ReplyKind::Other;
        for invitation in self.invitation_ids() {
            // 2017 invitations are lower-case and slash separated (`paper1/official/review`)
            let name = invitation
                .rsplit("/-/")
                .next()
                .unwrap_or(invitation)
                .to_ascii_lowercase();
            if name.contains("meta_review") || name.contains("metareview") {
                return ReplyKind::MetaReview;
            }
            if name.contains("decision") || name.ends_with("/acceptance") {
                return ReplyKind::Decision;
            }
            if name.contains("official_review")
                || name.ends_with("official/review")
                || name.ends_with("review")
            {
                kind = ReplyKind::Review;
            }
        }
        kind
    }

    /// Creation time in epoch milliseconds, preferring the true creation date.
    pub fn created_ms(&self) -> Option<i64> {
        self.tcdate.or(self.cdate)
    }

    pub fn embedded_replies(&self) -> Option<&[RawNote]> {
        let details = self.details.as_ref()?;
        details
            .direct_replies
            .as_deref()
            .or(details.replies.as_deref())
    }

    /// Same paper as seen by a second page: compares what ends up in the output.
    pub fn same_content(&self, other: &RawNote) -> bool {
        self.id == other.id
            && self.number == other.number
            && self.version == other.version
            && self.content == other.content
    }
}

/// A submission's replies, split by kind. Review order is retrieval order.
#[derive(Debug, Clone, Default)]
pub struct ForumReplies {
    pub reviews: Vec<RawReview>,
    pub meta_review: Option<RawMetaReview>,
    pub decision: Option<RawDecision>,
}

impl ForumReplies {
    pub fn classify(submission_id: &str, notes: impl IntoIterator<Item = RawNote>) -> Self {
        let mut replies = Self::default();
        for note in notes {
            if note.id == submission_id {
                continue;
            }
            match note.reply_kind() {
                ReplyKind::Review => replies.reviews.push(note),
                ReplyKind::MetaReview => {
                    if replies.meta_review.is_none() {
                        replies.meta_review = Some(note);
                    }
                }
                ReplyKind::Decision => {
                    if replies.decision.is_none() {
                        replies.decision = Some(note);
                    }
                }
                ReplyKind::Other => {}
            }
        }
        replies
    }
}

/// One page of a `/notes` listing.
#[derive(Debug, Clone, Default)]
pub struct NotesPage {
    pub notes: Vec<RawNote>,
    /// Total result count, when the API reports it
    pub count: Option<usize>,
    /// Notes dropped because they could not be parsed or had no id
    pub malformed: usize,
}

#[derive(Deserialize)]
struct NotesEnvelope {
    #[serde(default, deserialize_with = "null_as_default")]
    notes: Vec<Value>,
    #[serde(default)]
    count: Option<usize>,
}

impl NotesPage {
    /// Parse a `/notes` response body. Individual malformed notes are dropped and
    /// counted rather than failing the whole page.
    pub fn from_json(body: Value, version: ApiVersion) -> crate::Result<Self> {
        let envelope: NotesEnvelope = serde_json::from_value(body).map_err(|e| {
            crate::HarvestError::Parse(format!("Unexpected /notes response shape: {}", e))
        })?;

        let mut page = NotesPage {
            notes: Vec::with_capacity(envelope.notes.len()),
            count: envelope.count,
            malformed: 0,
        };

        for raw in envelope.notes {
            match serde_json::from_value::<RawNote>(raw) {
                Ok(note) if !note.id.is_empty() => page.notes.push(note.with_version(version)),
                Ok(_) => {
                    warn!(version = %version, "Dropping note without id");
                    page.malformed += 1;
                }
                Err(e) => {
                    warn!(version = %version, error = %e, "Dropping malformed note");
                    page.malformed += 1;
                }
            }
        }

        Ok(page)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}
