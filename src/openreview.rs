//! OpenReview record API adapter.
//!
//! [`VenueApi`] is the version-agnostic query surface the rest of the
//! pipeline talks to. [`OpenReviewApi`] implements it for both API
//! generations; the only per-version differences on the wire are the base URL,
//! whether v1's embedded `directReplies` are requested, and how note content is
//! unwrapped (handled by [`crate::notes`]).
//!
//! API details:
//! - `GET /notes?invitation=...&offset=...&limit=...` lists submissions
//! - `GET /notes?content.venueid=...` lists submissions by venue
//! - `GET /notes?forum=<id>` lists a submission and all of its replies
//! - `POST /login` exchanges credentials for a bearer token

use crate::error::{HarvestError, Result};
use crate::http::{RateLimitedClient, RequestContext};
use crate::notes::{
    ApiVersion, ForumReplies, NotesPage, RawMetaReview, RawNote, RawReview, RawSubmission,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Replies requested per forum listing; forums are far smaller than this
const FORUM_LIMIT: usize = 1000;

/// How to select a conference's submissions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubmissionQuery {
    /// Notes posted to an invitation, e.g. `ICLR.cc/2020/Conference/-/Blind_Submission`
    Invitation(String),
    /// Notes whose `content.venueid` equals the value
    VenueId(String),
}

impl SubmissionQuery {
    /// Query parameter carrying this selection
    pub fn query_pair(&self) -> (&'static str, String) {
        match self {
            Self::Invitation(id) => ("invitation", id.clone()),
            Self::VenueId(id) => ("content.venueid", id.clone()),
        }
    }
}

impl fmt::Display for SubmissionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invitation(id) => f.write_str(id),
            Self::VenueId(id) => write!(f, "content.venueid={}", id),
        }
    }
}

/// Normalized accessor surface shared by both API generations.
#[async_trait]
pub trait VenueApi: Send + Sync {
    fn version(&self) -> ApiVersion;

    /// One page of submissions for `query`, starting at `offset`.
    async fn submissions_page(
        &self,
        query: &SubmissionQuery,
        offset: usize,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<NotesPage>;

    /// Every note in a submission's forum, the submission itself included.
    async fn forum_notes(&self, forum_id: &str, ctx: &RequestContext) -> Result<Vec<RawNote>>;

    /// Reviews, meta-review and decision for a submission. Uses replies embedded in
    /// the listing when present and only goes back to the API otherwise.
    async fn replies_of(
        &self,
        submission: &RawSubmission,
        ctx: &RequestContext,
    ) -> Result<ForumReplies> {
        if let Some(embedded) = submission.embedded_replies() {
            return Ok(ForumReplies::classify(
                &submission.id,
                embedded.iter().cloned(),
            ));
        }
        let forum = submission.forum.as_deref().unwrap_or(&submission.id);
        let notes = self.forum_notes(forum, ctx).await?;
        Ok(ForumReplies::classify(&submission.id, notes))
    }

    async fn reviews_of(&self, submission_id: &str, ctx: &RequestContext) -> Result<Vec<RawReview>> {
        let notes = self.forum_notes(submission_id, ctx).await?;
        Ok(ForumReplies::classify(submission_id, notes).reviews)
    }

    async fn meta_review_of(
        &self,
        submission_id: &str,
        ctx: &RequestContext,
    ) -> Result<Option<RawMetaReview>> {
        let notes = self.forum_notes(submission_id, ctx).await?;
        Ok(ForumReplies::classify(submission_id, notes).meta_review)
    }
}

/// HTTP implementation of [`VenueApi`] for one API generation.
pub struct OpenReviewApi {
    version: ApiVersion,
    base_url: Url,
    client: Arc<RateLimitedClient>,
    token: Option<String>,
}

impl OpenReviewApi {
    pub fn new(version: ApiVersion, base_url: &str, client: Arc<RateLimitedClient>) -> Result<Self> {
        // Trailing slash so `join` appends instead of replacing the last segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| {
            HarvestError::Config(format!("Invalid {} base URL '{}': {}", version, base_url, e))
        })?;

        Ok(Self {
            version,
            base_url,
            client,
            token: None,
        })
    }

    /// Use a pre-issued bearer token.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Exchange credentials for a token. Any failure is a configuration error.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let url = self.endpoint("login")?;
        let ctx = RequestContext::new(0, "login");
        let body = json!({ "id": username, "password": password });

        let response = self
            .client
            .post(&url, body, None, &ctx)
            .await
            .map_err(|e| HarvestError::Config(format!("Login to API {} failed: {}", self.version, e)))?;

        let token = response
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HarvestError::Config(format!("Login to API {} returned no token", self.version))
            })?;

        self.token = Some(token.to_string());
        info!(version = %self.version, "Logged in");
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| HarvestError::Config(format!("Invalid endpoint '{}': {}", path, e)))
    }
}

#[async_trait]
impl VenueApi for OpenReviewApi {
    fn version(&self) -> ApiVersion {
        self.version
    }

    async fn submissions_page(
        &self,
        query: &SubmissionQuery,
        offset: usize,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<NotesPage> {
        let url = self.endpoint("notes")?;
        let (key, value) = query.query_pair();
        let mut params = vec![
            (key, value),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if self.version == ApiVersion::V1 {
            params.push(("details", "directReplies".to_string()));
        }

        debug!(version = %self.version, query = %query, offset, limit, "Fetching submissions page");
        let body = self
            .client
            .get(&url, &params, self.token.as_deref(), &ctx.at_offset(offset))
            .await?;
        NotesPage::from_json(body, self.version)
    }

    async fn forum_notes(&self, forum_id: &str, ctx: &RequestContext) -> Result<Vec<RawNote>> {
        let url = self.endpoint("notes")?;
        let params = [
            ("forum", forum_id.to_string()),
            ("limit", FORUM_LIMIT.to_string()),
        ];

        let body = self
            .client
            .get(&url, &params, self.token.as_deref(), ctx)
            .await?;
        Ok(NotesPage::from_json(body, self.version)?.notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RateLimiter, ReqwestTransport, RetryPolicy};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Arc<RateLimitedClient> {
        Arc::new(RateLimitedClient::new(
            Arc::new(ReqwestTransport::new(Duration::from_secs(5)).expect("transport")),
            Arc::new(RateLimiter::new(1000.0, Duration::from_secs(5))),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        ))
    }

    fn ctx() -> RequestContext {
        RequestContext::new(2016, "ICLR.cc/2016/Conference/-/Submission")
    }

    #[test]
    fn test_query_pairs() {
        let inv = SubmissionQuery::Invitation("ICLR.cc/2020/Conference/-/Blind_Submission".into());
        assert_eq!(inv.query_pair().0, "invitation");
        let venue = SubmissionQuery::VenueId("ICLR.cc/2024/Conference".into());
        assert_eq!(venue.query_pair().0, "content.venueid");
        assert_eq!(venue.to_string(), "content.venueid=ICLR.cc/2024/Conference");
    }

    #[tokio::test]
    async fn test_v1_requests_embedded_replies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .and(query_param("invitation", "ICLR.cc/2016/Conference/-/Submission"))
            .and(query_param("offset", "0"))
            .and(query_param("limit", "50"))
            .and(query_param("details", "directReplies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "notes": [{
                    "id": "p1",
                    "number": 1,
                    "content": {"title": "Old Paper"},
                    "details": {"directReplies": [
                        {"id": "r1", "invitation": "ICLR.cc/2016/Conference/-/Paper1/Official_Review",
                         "content": {"rating": "7: Good paper"}}
                    ]}
                }],
                "count": 1
            })))
            .mount(&server)
            .await;

        let api = OpenReviewApi::new(ApiVersion::V1, &server.uri(), client()).expect("api");
        let query = SubmissionQuery::Invitation("ICLR.cc/2016/Conference/-/Submission".into());
        let page = api.submissions_page(&query, 0, 50, &ctx()).await.expect("page");

        assert_eq!(page.len(), 1);
        assert_eq!(page.count, Some(1));
        let replies = api.replies_of(&page.notes[0], &ctx()).await.expect("embedded replies");
        assert_eq!(replies.reviews.len(), 1);
        assert_eq!(replies.reviews[0].text("rating").as_deref(), Some("7: Good paper"));
    }

    #[tokio::test]
    async fn test_v2_fetches_forum_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .and(query_param("forum", "p9"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "notes": [
                    {"id": "p9", "invitations": ["ICLR.cc/2024/Conference/-/Submission"]},
                    {"id": "r1", "invitations": ["ICLR.cc/2024/Conference/Submission9/-/Official_Review"],
                     "content": {"rating": {"value": 6}}},
                    {"id": "m1", "invitations": ["ICLR.cc/2024/Conference/Submission9/-/Meta_Review"],
                     "content": {"metareview": {"value": "Solid."}}}
                ]
            })))
            .mount(&server)
            .await;

        let mut api = OpenReviewApi::new(ApiVersion::V2, &server.uri(), client()).expect("api");
        api.login("user@example.org", "secret").await.expect("login");
        assert!(api.has_token());

        let reviews = api.reviews_of("p9", &ctx()).await.expect("reviews");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].text("rating").as_deref(), Some("6"));

        let meta = api.meta_review_of("p9", &ctx()).await.expect("meta").expect("present");
        assert_eq!(meta.text("metareview").as_deref(), Some("Solid."));
    }

    #[tokio::test]
    async fn test_login_failure_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"name": "InvalidCredentials"})))
            .mount(&server)
            .await;

        let mut api = OpenReviewApi::new(ApiVersion::V2, &server.uri(), client()).expect("api");
        let err = api.login("user", "wrong").await.expect_err("bad credentials");
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_invitation_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"name": "NotFoundError"})))
            .mount(&server)
            .await;

        let api = OpenReviewApi::new(ApiVersion::V2, &server.uri(), client()).expect("api");
        let query = SubmissionQuery::Invitation("ICLR.cc/2016/Conference/-/Submission".into());
        let err = api
            .submissions_page(&query, 0, 10, &ctx())
            .await
            .expect_err("404");
        assert!(err.is_not_found());
    }
}
