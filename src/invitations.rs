//! Invitation resolver
//!
//! Submission invitations were renamed several times over the years and the
//! early workshop-track years used lower-case group names. For a year and API
//! generation this module lists every known way of asking for the year's
//! submissions and probes them in order until one answers with data.

use crate::cancel::CancelFlag;
use crate::error::{HarvestError, Result};
use crate::http::RequestContext;
use crate::notes::{ApiVersion, NotesPage};
use crate::openreview::{SubmissionQuery, VenueApi};
use tracing::{debug, info, warn};

/// First year whose accepted papers also carry the bare `{venue}/{year}` venue id
const BARE_VENUEID_FROM: i32 = 2024;

/// First year API v1 listed double-blind submissions under their own invitation
const BLIND_FIRST_FROM: i32 = 2018;

/// Ordered candidate queries for a year's submissions.
pub fn candidates(venue: &str, year: i32, version: ApiVersion) -> Vec<SubmissionQuery> {
    let invitation = |suffix: &str| SubmissionQuery::Invitation(format!("{}/{}/{}", venue, year, suffix));

    // API v1 reviews hang off the blind copies from 2018 on; the originals
    // there are separate notes with no replies
    let mut out = if version == ApiVersion::V1 && year >= BLIND_FIRST_FROM {
        vec![
            invitation("Conference/-/Blind_Submission"),
            invitation("Conference/-/Submission"),
        ]
    } else {
        vec![
            invitation("Conference/-/Submission"),
            invitation("Conference/-/Blind_Submission"),
        ]
    };

    if version == ApiVersion::V1 {
        let aliases: &[&str] = match year {
            2016 => &["workshop/-/submission", "workshop/-/paper"],
            2017 => &["conference/-/submission", "workshop/-/submission"],
            2018 => &["Workshop/-/Submission"],
            _ => &[],
        };
        out.extend(aliases.iter().copied().map(invitation));
    }

    out.push(SubmissionQuery::VenueId(format!("{}/{}/Conference", venue, year)));
    if year >= BARE_VENUEID_FROM {
        out.push(SubmissionQuery::VenueId(format!("{}/{}", venue, year)));
    }
    out
}

/// Outcome of probing one API generation for a year
#[derive(Debug)]
pub enum Resolution {
    /// A candidate answered with data; its first page is kept for the paginator
    Found {
        query: SubmissionQuery,
        first_page: NotesPage,
    },
    /// Every candidate was empty or does not exist
    NoData,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }
}

/// Probes candidate queries for one year
#[derive(Debug, Clone)]
pub struct InvitationResolver {
    venue: String,
    page_size: usize,
}

impl InvitationResolver {
    pub fn new(venue: impl Into<String>, page_size: usize) -> Self {
        Self {
            venue: venue.into(),
            page_size,
        }
    }

    /// Return the first candidate whose first page is non-empty.
    ///
    /// A candidate that does not exist is expected and skipped quietly. Any other
    /// failure is logged and probing continues, but if nothing then answers the
    /// failures are returned as [`HarvestError::ProbeFailed`]: an outage is not
    /// an empty year.
    pub async fn resolve(&self, api: &dyn VenueApi, year: i32, cancel: &CancelFlag) -> Result<Resolution> {
        let version = api.version();
        let mut probe_errors = Vec::new();

        for query in candidates(&self.venue, year, version) {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            let ctx = RequestContext::new(year, query.to_string());
            match api.submissions_page(&query, 0, self.page_size, &ctx).await {
                Ok(page) if !page.is_empty() => {
                    info!(year, version = %version, query = %query, first_page = page.len(), "Resolved submissions");
                    return Ok(Resolution::Found {
                        query,
                        first_page: page,
                    });
                }
                Ok(_) => {
                    debug!(year, version = %version, query = %query, "Candidate is empty");
                }
                Err(e) if e.is_not_found() => {
                    debug!(year, version = %version, query = %query, "Candidate does not exist");
                }
                Err(e) => {
                    warn!(year, version = %version, query = %query, error = %e, "Candidate probe failed");
                    probe_errors.push(format!("{}: {}", query, e));
                }
            }
        }

        if !probe_errors.is_empty() {
            return Err(HarvestError::ProbeFailed {
                year,
                version: version.to_string(),
                detail: probe_errors.join("; "),
            });
        }
        Ok(Resolution::NoData)
    }
}
