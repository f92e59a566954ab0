// ETL pipeline: per-record processing stages and the run orchestrator

pub mod orchestrator;
pub mod processing;

pub use orchestrator::{cancellation, CancelHandle, CancelToken, Pipeline, RegionOutcome, RegionReport, RunSummary};
