pub mod catalog;
pub mod job;
pub mod manifest;
pub mod orchestrator;

pub use job::{InputRef, JobSpec};
pub use manifest::{finalize, JobStatus, Manifest, StageResult, StageStatus};
pub use orchestrator::Orchestrator;
