//! Per-year outcome of a run and the anomalies worth a human look.

use crate::error::Result;
use crate::notes::ApiVersion;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::info;

/// What kind of oddity was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnomalyKind {
    /// Neither API generation had any submissions for the year
    EmptyYear,
    /// Decision text outside the known vocabulary, kept verbatim
    UnrecognizedDecision,
    /// Field present with an unexpected shape
    SchemaAnomaly,
    /// Replies for one submission could not be fetched; submission skipped
    SubmissionFailed,
    /// A page fetch failed mid-sweep; earlier pages were still emitted
    PartialSweep,
    /// An invitation probe failed for a reason other than NotFound
    ProbeFailed,
    /// Notes dropped from a page because they could not be parsed
    MalformedNotes,
    /// The year was halted
    YearFailed,
}

impl AnomalyKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::EmptyYear => "empty_year",
            Self::UnrecognizedDecision => "unrecognized_decision",
            Self::SchemaAnomaly => "schema_anomaly",
            Self::SubmissionFailed => "submission_failed",
            Self::PartialSweep => "partial_sweep",
            Self::ProbeFailed => "probe_failed",
            Self::MalformedNotes => "malformed_notes",
            Self::YearFailed => "year_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub year: i32,
    pub paper_id: Option<String>,
    pub kind: AnomalyKind,
    pub detail: String,
}

impl Anomaly {
    pub fn new(year: i32, kind: AnomalyKind, detail: impl Into<String>) -> Self {
        Self {
            year,
            paper_id: None,
            kind,
            detail: detail.into(),
        }
    }

    pub fn for_paper(
        year: i32,
        paper_id: impl Into<String>,
        kind: AnomalyKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            paper_id: Some(paper_id.into()),
            ..Self::new(year, kind, detail)
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.year, self.kind.label())?;
        if let Some(id) = &self.paper_id {
            write!(f, " {}", id)?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Terminal state of one year
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum YearStatus {
    Done,
    /// Sweep aborted mid-way; what was fetched before the failure was written
    Partial,
    NoData,
    Failed,
    Cancelled,
}

impl YearStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Partial => "partial",
            Self::NoData => "no_data",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the run can be considered successful for this year
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Done | Self::Partial)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct YearReport {
    pub year: i32,
    pub status: YearStatus,
    pub version: Option<ApiVersion>,
    pub query: Option<String>,
    pub pages: usize,
    /// Distinct submissions returned by the sweep
    pub submissions: usize,
    /// Records appended to the output in this run
    pub written: usize,
    pub reviews: usize,
    pub meta_reviews: usize,
    /// Already present in the output from an earlier run
    pub skipped_present: usize,
    pub duplicates_dropped: usize,
    pub failed_submissions: usize,
    pub anomalies: Vec<Anomaly>,
}

impl YearReport {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            status: YearStatus::NoData,
            version: None,
            query: None,
            pages: 0,
            submissions: 0,
            written: 0,
            reviews: 0,
            meta_reviews: 0,
            skipped_present: 0,
            duplicates_dropped: 0,
            failed_submissions: 0,
            anomalies: Vec::new(),
        }
    }

    pub fn anomaly(&mut self, kind: AnomalyKind, detail: impl Into<String>) {
        self.anomalies.push(Anomaly::new(self.year, kind, detail));
    }

    fn row(&self) -> YearRow<'_> {
        YearRow {
            year: self.year,
            status: self.status.label(),
            version: self.version.map(ApiVersion::label).unwrap_or(""),
            query: self.query.as_deref().unwrap_or(""),
            pages: self.pages,
            submissions: self.submissions,
            written: self.written,
            reviews: self.reviews,
            meta_reviews: self.meta_reviews,
            skipped_present: self.skipped_present,
            duplicates_dropped: self.duplicates_dropped,
            failed_submissions: self.failed_submissions,
            anomalies: self.anomalies.len(),
        }
    }
}

/// Flat CSV row for one year
#[derive(Serialize)]
struct YearRow<'a> {
    year: i32,
    status: &'a str,
    version: &'a str,
    query: &'a str,
    pages: usize,
    submissions: usize,
    written: usize,
    reviews: usize,
    meta_reviews: usize,
    skipped_present: usize,
    duplicates_dropped: usize,
    failed_submissions: usize,
    anomalies: usize,
}

/// Outcome of a whole run, one entry per requested year in year order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub years: Vec<YearReport>,
}

impl RunReport {
    pub fn new(mut years: Vec<YearReport>) -> Self {
        years.sort_by_key(|y| y.year);
        Self { years }
    }

    /// True when no year ended failed, empty or cancelled
    pub fn is_ok(&self) -> bool {
        self.years.iter().all(|y| y.status.is_ok())
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &Anomaly> {
        self.years.iter().flat_map(|y| y.anomalies.iter())
    }

    pub fn total_written(&self) -> usize {
        self.years.iter().map(|y| y.written).sum()
    }

    pub fn year(&self, year: i32) -> Option<&YearReport> {
        self.years.iter().find(|y| y.year == year)
    }

    /// Write one CSV row per year.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(std::io::Error::from)?;

        for year in &self.years {
            wtr.serialize(year.row()).map_err(std::io::Error::from)?;
        }

        wtr.flush()?;
        info!(path = %path.display(), years = self.years.len(), "Saved run summary");
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<6} {:<10} {:<4} {:>7} {:>8} {:>8} {:>6} {:>8} {:>7}",
            "year", "status", "api", "papers", "written", "reviews", "metas", "skipped", "failed"
        )?;
        for y in &self.years {
            writeln!(
                f,
                "{:<6} {:<10} {:<4} {:>7} {:>8} {:>8} {:>6} {:>8} {:>7}",
                y.year,
                y.status.label(),
                y.version.map(ApiVersion::label).unwrap_or("-"),
                y.submissions,
                y.written,
                y.reviews,
                y.meta_reviews,
                y.skipped_present,
                y.failed_submissions,
            )?;
        }

        let anomalies: Vec<_> = self.anomalies().collect();
        if !anomalies.is_empty() {
            writeln!(f, "\nAnomalies ({}):", anomalies.len())?;
            for a in anomalies {
                writeln!(f, "  {}", a)?;
            }
        }
        Ok(())
    }
}
