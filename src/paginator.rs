//! Offset pagination over one submission query.
//!
//! Pages are fetched strictly in sequence. The sweep ends on an empty page or
//! once the reported total has been reached. When the server reports no total,
//! a short page ends it too. Servers cap the page size on their side, so a
//! short page alongside a total still to be reached just moves the offset on.
//! A query that still returns notes on the page after `max_pages` is treated
//! as runaway.

use crate::cancel::CancelFlag;
use crate::error::{HarvestError, Result};
use crate::http::RequestContext;
use crate::notes::{NotesPage, RawSubmission};
use crate::openreview::{SubmissionQuery, VenueApi};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Everything one sweep produced. `failure` is set when the sweep stopped early;
/// `submissions` still holds what was fetched before that.
#[derive(Debug, Default)]
pub struct Sweep {
    pub submissions: Vec<RawSubmission>,
    pub pages: usize,
    pub duplicates_dropped: usize,
    pub malformed: usize,
    pub failure: Option<HarvestError>,
}

#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    page_size: usize,
    max_pages: usize,
}

struct Cursor {
    offset: usize,
    pages: usize,
    first_page: Option<NotesPage>,
    done: bool,
}

impl Paginator {
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_size,
            max_pages,
        }
    }

    /// Lazy page stream. `first_page` is a page already fetched at offset 0
    /// (by the resolver's probe) and is yielded instead of being fetched again.
    /// The stream ends after the first error.
    pub fn pages<'a>(
        &'a self,
        api: &'a dyn VenueApi,
        query: &'a SubmissionQuery,
        year: i32,
        first_page: Option<NotesPage>,
        cancel: &'a CancelFlag,
    ) -> impl Stream<Item = Result<NotesPage>> + 'a {
        let cursor = Cursor {
            offset: 0,
            pages: 0,
            first_page,
            done: false,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            if cursor.done {
                return None;
            }
            if cancel.is_cancelled() {
                cursor.done = true;
                return Some((Err(HarvestError::Cancelled), cursor));
            }

            let page = match cursor.first_page.take() {
                Some(page) => page,
                None => {
                    let ctx = RequestContext::new(year, query.to_string());
                    match api
                        .submissions_page(query, cursor.offset, self.page_size, &ctx)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            cursor.done = true;
                            return Some((Err(e), cursor));
                        }
                    }
                }
            };

            // Malformed notes still occupy a slot on the server side
            let returned = page.len() + page.malformed;
            if cursor.pages >= self.max_pages {
                cursor.done = true;
                if returned == 0 {
                    return None;
                }
                let err = HarvestError::PaginationBoundExceeded {
                    invitation: query.to_string(),
                    max_pages: self.max_pages,
                };
                return Some((Err(err), cursor));
            }

            cursor.pages += 1;
            cursor.offset += returned;
            let exhausted = match page.count {
                Some(count) => cursor.offset >= count,
                None => returned < self.page_size,
            };
            if returned == 0 || exhausted {
                cursor.done = true;
            }

            debug!(year, query = %query, page = cursor.pages, offset = cursor.offset, notes = page.len(), "Fetched page");
            Some((Ok(page), cursor))
        })
    }

    /// Drain the page stream into one deduplicated submission list.
    ///
    /// A submission repeated on adjacent pages is kept once. A repeat whose
    /// content differs is a [`HarvestError::DuplicateKey`] and ends the sweep.
    pub async fn sweep(
        &self,
        api: &dyn VenueApi,
        query: &SubmissionQuery,
        year: i32,
        first_page: Option<NotesPage>,
        cancel: &CancelFlag,
    ) -> Sweep {
        let mut sweep = Sweep::default();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut pages = std::pin::pin!(self.pages(api, query, year, first_page, cancel));

        while let Some(result) = pages.next().await {
            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    warn!(year, query = %query, pages = sweep.pages, fetched = sweep.submissions.len(), error = %e, "Sweep stopped early");
                    sweep.failure = Some(e);
                    return sweep;
                }
            };

            sweep.pages += 1;
            sweep.malformed += page.malformed;

            for note in page.notes {
                match positions.get(&note.id) {
                    Some(&at) if sweep.submissions[at].same_content(&note) => {
                        debug!(year, paper_id = %note.id, "Dropping repeated submission");
                        sweep.duplicates_dropped += 1;
                    }
                    Some(_) => {
                        sweep.failure = Some(HarvestError::DuplicateKey {
                            paper_id: note.id.clone(),
                            year,
                            detail: format!("returned twice by {} with differing content", query),
                        });
                        return sweep;
                    }
                    None => {
                        positions.insert(note.id.clone(), sweep.submissions.len());
                        sweep.submissions.push(note);
                    }
                }
            }
        }

        info!(
            year,
            query = %query,
            pages = sweep.pages,
            submissions = sweep.submissions.len(),
            duplicates = sweep.duplicates_dropped,
            "Sweep complete"
        );
        sweep
    }
}
