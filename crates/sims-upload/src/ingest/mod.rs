//! Upload pipeline stages
//!
//! Each stage is usable on its own; [`pipeline::PipelineOrchestrator`] wires
//! them together for one job.

pub mod coverage;
pub mod export;
pub mod identifiers;
pub mod normalizer;
pub mod overlap;
pub mod pipeline;
pub mod planner;
pub mod schema;
pub mod staging;
pub mod validation;
pub mod values;
pub mod workbook;

pub use normalizer::{CanonicalRow, NormalizedWorkbook, WorkbookNormalizer};
pub use overlap::{ConflictResolution, OverlapReport};
pub use pipeline::{
    PartialFailurePolicy, PipelineOrchestrator, PipelineReport, PipelineRequest, PipelineSettings,
};
pub use staging::{StagedRow, StagingOutcome};
pub use validation::{BusinessRule, ValidationSummary};
pub use workbook::{CalamineReader, WorkbookReader};
