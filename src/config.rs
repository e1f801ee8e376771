//! Crawl configuration.
//!
//! `HarvestConfig` is built once by the CLI and passed down explicitly; nothing
//! in the library reads process-wide state.

use crate::error::{HarvestError, Result};
use std::time::Duration;

/// API v1 base URL (conferences up to 2022)
pub const DEFAULT_V1_BASE: &str = "https://api.openreview.net";

/// API v2 base URL (conferences from 2023)
pub const DEFAULT_V2_BASE: &str = "https://api2.openreview.net";

/// Public site used to build forum and PDF links
pub const DEFAULT_SITE: &str = "https://openreview.net";

/// Venue group that prefixes every invitation
pub const DEFAULT_VENUE: &str = "ICLR.cc";

/// First and last conference year covered by the dataset
pub const FIRST_YEAR: i32 = 2016;
pub const LAST_YEAR: i32 = 2025;

/// Settings shared by every component of a crawl.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub v1_base_url: String,
    pub v2_base_url: String,
    pub site_url: String,
    pub venue: String,
    /// Notes requested per page
    pub page_size: usize,
    /// Pages allowed per invitation before the sweep is declared runaway
    pub max_pages: usize,
    /// Aggregate request ceiling across all workers
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    /// Responses slower than this widen the pacing interval
    pub slow_response: Duration,
    /// Concurrent reply fetches within one year
    pub review_concurrency: usize,
    /// Years crawled concurrently
    pub year_concurrency: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            v1_base_url: DEFAULT_V1_BASE.to_string(),
            v2_base_url: DEFAULT_V2_BASE.to_string(),
            site_url: DEFAULT_SITE.to_string(),
            venue: DEFAULT_VENUE.to_string(),
            page_size: 1000,
            max_pages: 100,
            requests_per_second: 5.0,
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            slow_response: Duration::from_secs(10),
            review_concurrency: 8,
            year_concurrency: 2,
        }
    }
}

impl HarvestConfig {
    /// Reject settings that would make the crawl spin or stall.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(HarvestError::Config("page size must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(HarvestError::Config("max pages must be at least 1".into()));
        }
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(HarvestError::Config(format!(
                "requests per second must be positive, got {}",
                self.requests_per_second
            )));
        }
        if self.review_concurrency == 0 || self.year_concurrency == 0 {
            return Err(HarvestError::Config("concurrency must be at least 1".into()));
        }
        if self.base_backoff > self.max_backoff {
            return Err(HarvestError::Config(
                "base backoff exceeds max backoff".into(),
            ));
        }
        for (name, value) in [
            ("v1 base URL", &self.v1_base_url),
            ("v2 base URL", &self.v2_base_url),
            ("site URL", &self.site_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| HarvestError::Config(format!("Invalid {} '{}': {}", name, value, e)))?;
        }
        if self.venue.trim().is_empty() {
            return Err(HarvestError::Config("venue must not be empty".into()));
        }
        Ok(())
    }
}

/// Parse a year selection: a single year (`2024`) or an inclusive range (`2016-2025`).
pub fn parse_years(years_str: &str) -> Result<Vec<i32>> {
    let parse_one = |s: &str| -> Result<i32> {
        s.trim()
            .parse::<i32>()
            .map_err(|e| HarvestError::Config(format!("Invalid year '{}': {}", s.trim(), e)))
    };

    let years: Vec<i32> = if let Some((start, end)) = years_str.split_once('-') {
        let (start, end) = (parse_one(start)?, parse_one(end)?);
        if start > end {
            return Err(HarvestError::Config(format!(
                "Year range is reversed: {}",
                years_str
            )));
        }
        (start..=end).collect()
    } else {
        vec![parse_one(years_str)?]
    };

    if let Some(bad) = years.iter().find(|y| !(FIRST_YEAR..=LAST_YEAR).contains(*y)) {
        return Err(HarvestError::Config(format!(
            "Year {} is outside {}-{}",
            bad, FIRST_YEAR, LAST_YEAR
        )));
    }
    Ok(years)
}
