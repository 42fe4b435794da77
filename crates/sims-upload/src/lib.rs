//! SIMS Upload Library
//!
//! Spreadsheet ingestion for the SIMS warehouse.
//!
//! # Overview
//!
//! An upload is a single workbook sheet. It is admitted against size limits,
//! recorded as a job, queued, and then driven by a worker through:
//!
//! - **Normalization**: headers cleaned to canonical snake_case names, blank
//!   rows dropped, identifiers and dates canonicalised
//! - **Staging**: rows land in a per-sheet staging table, once per content
//!   fingerprint
//! - **Schema evolution**: the normalized table gains columns and widens
//!   types as sheets change, never narrowing
//! - **Validation**: per-row type and business rule checks; rejected rows are
//!   exported to CSV
//! - **Overlap detection**: time ranges already loaded block the commit
//!   unless the upload asks to append, replace or skip
//! - **Commit**: accepted rows are inserted and staged rows marked processed
//!   in one transaction
//!
//! # Job lifecycle
//!
//! `Queued -> Parsing -> Validating -> Loaded`, with `Errors` reachable from
//! every live state. Every transition is appended to the job's event log in
//! the same transaction as the status change.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sims_upload::{config::Config, db, jobs::{JobStore, PgJobStore}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = Arc::new(db::create_pool(&config.database).await?);
//!     let jobs = PgJobStore::new(pool);
//!     for job in jobs.list_recent_jobs(Some(10)).await? {
//!         println!("{} {}", job.job_id, job.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod runner;
pub mod sheets;
pub mod warehouse;

pub use error::{IngestError, IngestResult};
