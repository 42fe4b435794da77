//! SIMS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every SIMS workspace member:
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Fingerprints**: content hashing used to detect duplicate uploads
//! - **Logging**: `tracing` subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use sims_common::fingerprint::Fingerprint;
//!
//! fn describe(path: &str) -> sims_common::Result<()> {
//!     let fingerprint = Fingerprint::from_file(path)?;
//!     tracing::info!(%fingerprint, "workbook fingerprinted");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

pub use error::{CommonError, Result};
