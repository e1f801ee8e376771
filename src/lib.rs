//! # reviewharvest
//!
//! Multi-year OpenReview harvester: submissions, reviews, meta-reviews and
//! decisions for every ICLR year from 2016, merged across both API generations
//! into one JSON Lines file with a single record shape.
//!
//! ## Modules
//!
//! - [`http`] - Rate-limited, retrying HTTP client
//! - [`notes`] - Raw notes and v1/v2 content unwrapping
//! - [`openreview`] - Version-agnostic record API adapter
//! - [`invitations`] - Per-year submission query candidates and probing
//! - [`paginator`] - Bounded, deduplicating offset pagination
//! - [`normalize`] - Year-aware mapping into [`unified::UnifiedRecord`]
//! - [`orchestrator`] - v2 → v1 fallback per year and the whole-run driver
//! - [`sink`] - Crash-safe, resumable JSON Lines output
//! - [`report`] - Per-year counts and anomalies
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reviewharvest::config::HarvestConfig;
//! use reviewharvest::clock::MonotonicClock;
//! use reviewharvest::http::RateLimitedClient;
//! use reviewharvest::notes::ApiVersion;
//! use reviewharvest::openreview::OpenReviewApi;
//! use reviewharvest::orchestrator::Harvester;
//! use reviewharvest::sink::{JsonlSink, SinkMode};
//! use reviewharvest::cancel::CancelFlag;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig::default();
//!     let client = Arc::new(RateLimitedClient::from_config(&config)?);
//!     let v2 = OpenReviewApi::new(ApiVersion::V2, &config.v2_base_url, client.clone())?;
//!     let v1 = OpenReviewApi::new(ApiVersion::V1, &config.v1_base_url, client)?;
//!     let (sink, existing) = JsonlSink::open("iclr.jsonl".as_ref(), SinkMode::Resume)?;
//!
//!     let harvester = Harvester::new(
//!         &config,
//!         Arc::new(v2),
//!         Arc::new(v1),
//!         Arc::new(sink),
//!         existing,
//!         Arc::new(MonotonicClock::new()),
//!         CancelFlag::new(),
//!     );
//!     let report = harvester.harvest(&[2016, 2024]).await;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod invitations;
pub mod normalize;
pub mod notes;
pub mod openreview;
pub mod orchestrator;
pub mod paginator;
pub mod report;
pub mod sink;
pub mod unified;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HarvestError, Result};
