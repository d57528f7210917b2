// src/pipelines/manifest.rs: per-stage results and the job manifest

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::defs::{ErrorKind, StageError};
use crate::utils::sambam::AlignmentStats;
use crate::utils::staging::StagedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// A stage output, with its export location if it was a final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(flatten)]
    pub file: StagedFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub tool: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<AlignmentStats>,
}

impl StageResult {
    pub fn succeeded(
        stage: &str,
        tool: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outputs: Vec<OutputRecord>,
        stats: Option<AlignmentStats>,
    ) -> Self {
        StageResult {
            stage: stage.to_string(),
            tool: tool.to_string(),
            status: StageStatus::Succeeded,
            started_at,
            duration_ms: elapsed.as_millis() as u64,
            outputs,
            error: None,
            diagnostic: String::new(),
            stats,
        }
    }

    pub fn failed(
        stage: &str,
        tool: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        err: &StageError,
    ) -> Self {
        StageResult {
            stage: stage.to_string(),
            tool: tool.to_string(),
            status: StageStatus::Failed,
            started_at,
            duration_ms: elapsed.as_millis() as u64,
            outputs: Vec::new(),
            error: Some(err.kind()),
            diagnostic: err.to_string(),
            stats: None,
        }
    }

    pub fn skipped(stage: &str, tool: &str) -> Self {
        StageResult {
            stage: stage.to_string(),
            tool: tool.to_string(),
            status: StageStatus::Skipped,
            started_at: Utc::now(),
            duration_ms: 0,
            outputs: Vec::new(),
            error: None,
            diagnostic: "skipped on request".to_string(),
            stats: None,
        }
    }
}

/// Immutable record of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    job_id: String,
    pipeline: String,
    status: JobStatus,
    stages: Vec<StageResult>,
    tool_versions: BTreeMap<String, String>,
}

impl Manifest {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn tool_versions(&self) -> &BTreeMap<String, String> {
        &self.tool_versions
    }

    /// Exported paths of all final outputs, in stage order.
    pub fn exported(&self) -> Vec<&Path> {
        self.stages
            .iter()
            .flat_map(|s| s.outputs.iter())
            .filter_map(|o| o.exported_to.as_deref())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes `<dir>/<job_id>.manifest.json` atomically.
    ///
    /// # Returns
    /// Path of the written manifest.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let json = self.to_json().map_err(io::Error::other)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        let target = dir.join(format!("{}.manifest.json", self.job_id));
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }
}

/// Aggregates stage results into a Manifest. Failed iff any stage failed.
pub fn finalize(
    job_id: &str,
    pipeline: &str,
    results: Vec<StageResult>,
    tool_versions: BTreeMap<String, String>,
) -> Manifest {
    let status = if results.iter().any(|r| r.status == StageStatus::Failed) {
        JobStatus::Failed
    } else {
        JobStatus::Succeeded
    };
    Manifest {
        job_id: job_id.to_string(),
        pipeline: pipeline.to_string(),
        status,
        stages: results,
        tool_versions,
    }
}
