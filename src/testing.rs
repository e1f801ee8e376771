//! In-memory record API and note builders shared by unit tests.

use crate::cancel::CancelFlag;
use crate::error::{HarvestError, Result};
use crate::http::RequestContext;
use crate::notes::{ApiVersion, NotesPage, RawNote};
use crate::openreview::{SubmissionQuery, VenueApi};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn note(id: &str, invitation: &str, content: Map<String, Value>, version: ApiVersion) -> RawNote {
    let mut note = RawNote {
        id: id.to_string(),
        forum: Some(id.to_string()),
        content,
        ..Default::default()
    };
    match version {
        ApiVersion::V1 => note.invitation = Some(invitation.to_string()),
        ApiVersion::V2 => note.invitations = vec![invitation.to_string()],
    }
    note.with_version(version)
}

fn object(content: Value) -> Map<String, Value> {
    match content {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Note shaped like an API v1 response: plain content values
pub(crate) fn v1_note(id: &str, invitation: &str, content: Value) -> RawNote {
    note(id, invitation, object(content), ApiVersion::V1)
}

/// Note shaped like an API v2 response: every content value wrapped in `{"value": ...}`
pub(crate) fn v2_note(id: &str, invitation: &str, content: Value) -> RawNote {
    let wrapped = object(content)
        .into_iter()
        .map(|(key, value)| (key, json!({ "value": value })))
        .collect();
    note(id, invitation, wrapped, ApiVersion::V2)
}

/// `count` submissions for a year, ids `{version}-{year}-{i}`
pub(crate) fn submissions(version: ApiVersion, year: i32, count: usize) -> Vec<RawNote> {
    let invitation = format!("ICLR.cc/{}/Conference/-/Submission", year);
    (0..count)
        .map(|i| {
            let id = format!("{}-{}-{}", version, year, i);
            let content = json!({
                "title": format!("Paper {} of {}", i, year),
                "authors": ["Ada Lovelace"],
                "abstract": "Abstract.",
            });
            let note = match version {
                ApiVersion::V1 => v1_note(&id, &invitation, content),
                ApiVersion::V2 => v2_note(&id, &invitation, content),
            };
            note.numbered(i as i64 + 1)
        })
        .collect()
}

impl RawNote {
    pub(crate) fn numbered(mut self, number: i64) -> Self {
        self.number = Some(number);
        self
    }

    pub(crate) fn signed(mut self, signature: &str) -> Self {
        self.signatures = vec![signature.to_string()];
        self
    }

    pub(crate) fn created(mut self, ms: i64) -> Self {
        self.tcdate = Some(ms);
        self
    }

    pub(crate) fn in_forum(mut self, forum: &str) -> Self {
        self.forum = Some(forum.to_string());
        self
    }
}

/// Failure a scripted page answers with
#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    NotFound,
    Transient,
    Forbidden,
}

impl Failure {
    fn error(self, what: &str) -> HarvestError {
        match self {
            Self::NotFound => HarvestError::NotFound(what.to_string()),
            Self::Transient => HarvestError::TransientNetwork(format!("{}: retries exhausted", what)),
            Self::Forbidden => HarvestError::Api {
                code: 403,
                message: what.to_string(),
            },
        }
    }
}

/// Scripted [`VenueApi`]. Unknown queries answer with an empty page.
pub(crate) struct FakeApi {
    version: ApiVersion,
    listings: HashMap<SubmissionQuery, Vec<RawNote>>,
    report_count: bool,
    page_cap: Option<usize>,
    outage: Option<Failure>,
    forums: HashMap<String, Vec<RawNote>>,
    failing_forums: HashSet<String>,
    failing_pages: HashMap<(SubmissionQuery, usize), Failure>,
    endless: HashSet<SubmissionQuery>,
    cancel_on_forum: Option<(String, CancelFlag)>,
    page_requests: Mutex<Vec<(SubmissionQuery, usize)>>,
    forum_calls: AtomicUsize,
}

impl FakeApi {
    pub(crate) fn new(version: ApiVersion) -> Self {
        Self {
            version,
            listings: HashMap::new(),
            report_count: false,
            page_cap: None,
            outage: None,
            forums: HashMap::new(),
            failing_forums: HashSet::new(),
            failing_pages: HashMap::new(),
            endless: HashSet::new(),
            cancel_on_forum: None,
            page_requests: Mutex::new(Vec::new()),
            forum_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_listing(mut self, query: SubmissionQuery, notes: Vec<RawNote>) -> Self {
        self.listings.insert(query, notes);
        self
    }

    pub(crate) fn with_invitation(self, invitation: &str, notes: Vec<RawNote>) -> Self {
        self.with_listing(SubmissionQuery::Invitation(invitation.to_string()), notes)
    }

    /// Report the listing's total size in every page
    pub(crate) fn with_count(mut self) -> Self {
        self.report_count = true;
        self
    }

    /// Never return more than `cap` notes per page, whatever limit is asked for
    pub(crate) fn capped_at(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    /// Every listing request fails
    pub(crate) fn down(mut self, failure: Failure) -> Self {
        self.outage = Some(failure);
        self
    }

    pub(crate) fn with_forum(mut self, forum_id: &str, notes: Vec<RawNote>) -> Self {
        self.forums.insert(forum_id.to_string(), notes);
        self
    }

    pub(crate) fn failing_forum(mut self, forum_id: &str) -> Self {
        self.failing_forums.insert(forum_id.to_string());
        self
    }

    pub(crate) fn failing_page(mut self, query: SubmissionQuery, offset: usize, failure: Failure) -> Self {
        self.failing_pages.insert((query, offset), failure);
        self
    }

    /// Every page is full of fresh submissions, forever
    pub(crate) fn endless(mut self, query: SubmissionQuery) -> Self {
        self.endless.insert(query);
        self
    }

    pub(crate) fn cancelling_on_forum(mut self, forum_id: &str, flag: CancelFlag) -> Self {
        self.cancel_on_forum = Some((forum_id.to_string(), flag));
        self
    }

    pub(crate) fn page_requests(&self) -> Vec<(SubmissionQuery, usize)> {
        self.page_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub(crate) fn forum_calls(&self) -> usize {
        self.forum_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VenueApi for FakeApi {
    fn version(&self) -> ApiVersion {
        self.version
    }

    async fn submissions_page(
        &self,
        query: &SubmissionQuery,
        offset: usize,
        limit: usize,
        _ctx: &RequestContext,
    ) -> Result<NotesPage> {
        if let Ok(mut requests) = self.page_requests.lock() {
            requests.push((query.clone(), offset));
        }
        if let Some(failure) = self.outage {
            return Err(failure.error(&format!("{} at offset {}", query, offset)));
        }
        if let Some(failure) = self.failing_pages.get(&(query.clone(), offset)) {
            return Err(failure.error(&format!("{} at offset {}", query, offset)));
        }

        if self.endless.contains(query) {
            let notes = (offset..offset + limit)
                .map(|i| v2_note(&format!("endless-{}", i), "X/-/Submission", json!({})))
                .collect();
            return Ok(NotesPage {
                notes,
                count: None,
                malformed: 0,
            });
        }

        let limit = self.page_cap.map_or(limit, |cap| limit.min(cap));
        let listing = self.listings.get(query).map(Vec::as_slice).unwrap_or(&[]);
        let start = offset.min(listing.len());
        let end = (offset + limit).min(listing.len());
        Ok(NotesPage {
            notes: listing[start..end].to_vec(),
            count: self.report_count.then_some(listing.len()),
            malformed: 0,
        })
    }

    async fn forum_notes(&self, forum_id: &str, _ctx: &RequestContext) -> Result<Vec<RawNote>> {
        self.forum_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((id, flag)) = &self.cancel_on_forum {
            if id == forum_id {
                flag.cancel();
            }
        }
        if self.failing_forums.contains(forum_id) {
            return Err(Failure::Transient.error(&format!("forum {}", forum_id)));
        }
        Ok(self.forums.get(forum_id).cloned().unwrap_or_default())
    }
}
