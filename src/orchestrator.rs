//! Year-by-year harvest driver
//!
//! Each year runs a two-step fallback: probe API v2, and only if it has nothing
//! for the year probe API v1. Whichever answers first is authoritative for the
//! year. Years run concurrently up to `year_concurrency`; within a year
//! submissions are paged sequentially and their replies fetched concurrently up
//! to `review_concurrency`, with output kept in listing order.

use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::http::RequestContext;
use crate::invitations::{InvitationResolver, Resolution};
use crate::normalize::Normalizer;
use crate::notes::{ApiVersion, ForumReplies, NotesPage, RawSubmission};
use crate::openreview::{SubmissionQuery, VenueApi};
use crate::paginator::Paginator;
use crate::report::{Anomaly, AnomalyKind, RunReport, YearReport, YearStatus};
use crate::sink::{JsonlSink, ResumeIndex};
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Per-year fallback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    TryV2,
    TryV1,
    Done(ApiVersion),
    NoData,
}

/// What probing the current API generation found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found,
    Empty,
}

impl FallbackState {
    pub fn start() -> Self {
        Self::TryV2
    }

    pub fn next(self, probe: Probe) -> Self {
        match (self, probe) {
            (Self::TryV2, Probe::Found) => Self::Done(ApiVersion::V2),
            (Self::TryV2, Probe::Empty) => Self::TryV1,
            (Self::TryV1, Probe::Found) => Self::Done(ApiVersion::V1),
            (Self::TryV1, Probe::Empty) => Self::NoData,
            (terminal, _) => terminal,
        }
    }

    /// API generation to probe next, `None` once terminal
    pub fn probing(self) -> Option<ApiVersion> {
        match self {
            Self::TryV2 => Some(ApiVersion::V2),
            Self::TryV1 => Some(ApiVersion::V1),
            Self::Done(_) | Self::NoData => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.probing().is_none()
    }
}

/// Every paper_id claimed so far in this run or present in the output already.
#[derive(Debug, Default)]
pub struct PaperRegistry {
    ids: Mutex<HashMap<String, i32>>,
}

impl PaperRegistry {
    pub fn new(existing: HashMap<String, i32>) -> Self {
        Self {
            ids: Mutex::new(existing),
        }
    }

    /// Claim a year's ids. Returns the ids that were already recorded for this
    /// year. Claims nothing and fails if any id belongs to another year.
    pub fn claim_all(&self, year: i32, ids: &[&str]) -> Result<HashSet<String>> {
        let mut known = self
            .ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut present = HashSet::new();
        for id in ids {
            match known.get(*id) {
                Some(&owner) if owner == year => {
                    present.insert(id.to_string());
                }
                Some(&owner) => {
                    return Err(HarvestError::DuplicateKey {
                        paper_id: id.to_string(),
                        year,
                        detail: format!("already harvested under year {}", owner),
                    });
                }
                None => {}
            }
        }

        for id in ids {
            known.entry(id.to_string()).or_insert(year);
        }
        Ok(present)
    }
}

pub struct Harvester {
    v2: Arc<dyn VenueApi>,
    v1: Arc<dyn VenueApi>,
    resolver: InvitationResolver,
    paginator: Paginator,
    normalizer: Normalizer,
    sink: Arc<JsonlSink>,
    registry: PaperRegistry,
    review_concurrency: usize,
    year_concurrency: usize,
    cancel: CancelFlag,
    progress: MultiProgress,
}

impl Harvester {
    pub fn new(
        config: &HarvestConfig,
        v2: Arc<dyn VenueApi>,
        v1: Arc<dyn VenueApi>,
        sink: Arc<JsonlSink>,
        existing: ResumeIndex,
        clock: Arc<dyn Clock>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            v2,
            v1,
            resolver: InvitationResolver::new(config.venue.clone(), config.page_size),
            paginator: Paginator::new(config.page_size, config.max_pages),
            normalizer: Normalizer::new(&config.site_url, &config.venue, clock),
            sink,
            registry: PaperRegistry::new(existing.into_ids()),
            review_concurrency: config.review_concurrency.max(1),
            year_concurrency: config.year_concurrency.max(1),
            cancel,
            progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        }
    }

    /// Draw one progress bar per year on stderr
    pub fn with_progress(mut self) -> Self {
        self.progress = MultiProgress::new();
        self
    }

    fn year_bar(&self, year: i32, len: usize) -> ProgressBar {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>6}/{len:6} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = self.progress.add(ProgressBar::new(len as u64));
        bar.set_style(style);
        bar.set_prefix(year.to_string());
        bar
    }

    fn api(&self, version: ApiVersion) -> &dyn VenueApi {
        match version {
            ApiVersion::V2 => self.v2.as_ref(),
            ApiVersion::V1 => self.v1.as_ref(),
        }
    }

    /// Harvest every year. Always returns a report; failures are per year.
    pub async fn harvest(&self, years: &[i32]) -> RunReport {
        info!(years = ?years, concurrency = self.year_concurrency, "Starting harvest");
        let reports: Vec<YearReport> = stream::iter(years.iter().copied())
            .map(|year| self.harvest_year(year))
            .buffer_unordered(self.year_concurrency)
            .collect()
            .await;

        let report = RunReport::new(reports);
        info!(written = report.total_written(), anomalies = report.anomalies().count(), "Harvest finished");
        report
    }

    /// Run the fallback state machine for one year and write its records.
    pub async fn harvest_year(&self, year: i32) -> YearReport {
        let mut report = YearReport::new(year);
        let mut state = FallbackState::start();
        let mut found = None;

        while let Some(version) = state.probing() {
            match self.resolver.resolve(self.api(version), year, &self.cancel).await {
                Ok(Resolution::Found { query, first_page }) => {
                    found = Some((query, first_page));
                    state = state.next(Probe::Found);
                }
                Ok(Resolution::NoData) => {
                    info!(year, version = %version, "No submissions under this API");
                    state = state.next(Probe::Empty);
                }
                Err(HarvestError::Cancelled) => {
                    warn!(year, "Cancelled while probing");
                    report.status = YearStatus::Cancelled;
                    return report;
                }
                Err(e) => {
                    error!(year, version = %version, error = %e, "Probe failed, year not harvested");
                    let kind = match e {
                        HarvestError::ProbeFailed { .. } => AnomalyKind::ProbeFailed,
                        _ => AnomalyKind::YearFailed,
                    };
                    report.anomaly(kind, e.to_string());
                    report.status = YearStatus::Failed;
                    return report;
                }
            }
        }

        match (state, found) {
            (FallbackState::Done(version), Some((query, first_page))) => {
                report.version = Some(version);
                report.query = Some(query.to_string());
                self.collect(self.api(version), &query, first_page, &mut report)
                    .await;
            }
            _ => {
                error!(year, "No submissions found under API v2 or v1");
                report.anomaly(
                    AnomalyKind::EmptyYear,
                    "no submission query returned data under API v2 or v1",
                );
                report.status = YearStatus::NoData;
            }
        }

        info!(
            year,
            status = report.status.label(),
            version = report.version.map(ApiVersion::label).unwrap_or("-"),
            submissions = report.submissions,
            written = report.written,
            skipped = report.skipped_present,
            "Year finished"
        );
        report
    }

    /// Sweep the resolved query, then fetch replies, normalize and write every
    /// submission not already in the output.
    async fn collect(
        &self,
        api: &dyn VenueApi,
        query: &SubmissionQuery,
        first_page: NotesPage,
        report: &mut YearReport,
    ) {
        let year = report.year;
        let sweep = self
            .paginator
            .sweep(api, query, year, Some(first_page), &self.cancel)
            .await;

        report.pages = sweep.pages;
        report.submissions = sweep.submissions.len();
        report.duplicates_dropped = sweep.duplicates_dropped;
        if sweep.malformed > 0 {
            report.anomaly(
                AnomalyKind::MalformedNotes,
                format!("{} unparseable notes dropped from {}", sweep.malformed, query),
            );
        }

        report.status = YearStatus::Done;
        match sweep.failure {
            None => {}
            Some(HarvestError::Cancelled) => {
                report.status = YearStatus::Cancelled;
                return;
            }
            Some(e) if e.is_fatal_for_year() => {
                error!(year, query = %query, error = %e, "Year halted, nothing written");
                report.anomaly(AnomalyKind::YearFailed, e.to_string());
                report.status = YearStatus::Failed;
                return;
            }
            Some(e) => {
                report.anomaly(
                    AnomalyKind::PartialSweep,
                    format!("stopped after {} pages: {}", sweep.pages, e),
                );
                report.status = YearStatus::Partial;
            }
        }

        let ids: Vec<&str> = sweep.submissions.iter().map(|s| s.id.as_str()).collect();
        let present = match self.registry.claim_all(year, &ids) {
            Ok(present) => present,
            Err(e) => {
                error!(year, error = %e, "Year halted, nothing written");
                report.anomaly(AnomalyKind::YearFailed, e.to_string());
                report.status = YearStatus::Failed;
                return;
            }
        };
        report.skipped_present = present.len();

        let pending: Vec<&RawSubmission> = sweep
            .submissions
            .iter()
            .filter(|submission| !present.contains(&submission.id))
            .collect();
        let bar = self.year_bar(year, pending.len());
        let ctx = RequestContext::new(year, query.to_string());
        let mut replies = std::pin::pin!(stream::iter(pending)
            .map(|submission| {
                let ctx = &ctx;
                async move { (submission, self.replies(api, submission, ctx).await) }
            })
            .buffered(self.review_concurrency));

        while let Some((submission, outcome)) = replies.next().await {
            bar.inc(1);
            let forum = match outcome {
                Ok(forum) => forum,
                Err(HarvestError::Cancelled) => {
                    report.status = YearStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(year, paper_id = %submission.id, error = %e, "Skipping submission, replies unavailable");
                    report.failed_submissions += 1;
                    report.anomalies.push(Anomaly::for_paper(
                        year,
                        &submission.id,
                        AnomalyKind::SubmissionFailed,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let normalized = self.normalizer.normalize(
                submission,
                &forum.reviews,
                forum.meta_review.as_ref(),
                forum.decision.as_ref(),
                year,
            );
            if let Err(e) = self.sink.append(&normalized.record) {
                error!(year, paper_id = %submission.id, error = %e, "Output write failed");
                report.anomaly(AnomalyKind::YearFailed, e.to_string());
                report.status = YearStatus::Failed;
                bar.abandon_with_message("output write failed");
                return;
            }

            report.written += 1;
            report.reviews += normalized.record.official_reviews.len();
            report.meta_reviews += usize::from(normalized.record.meta_review.is_some());
            report.anomalies.extend(normalized.anomalies);
        }
        bar.finish_with_message(report.status.label());
    }

    async fn replies(
        &self,
        api: &dyn VenueApi,
        submission: &RawSubmission,
        ctx: &RequestContext,
    ) -> Result<ForumReplies> {
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        api.replies_of(submission, ctx).await
    }
}
