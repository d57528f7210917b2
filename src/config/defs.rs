use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// External software
pub const SAMTOOLS_TAG: &str = "samtools";
pub const PICARD_TAG: &str = "picard";

pub const PICARD_JAR: &str = "/opt/picard/build/libs/picard.jar";

lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(SAMTOOLS_TAG, "1.20");
        m.insert(PICARD_TAG, "2.27");
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Sort,
    Index,
    Flagstat,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::Flagstat => "flagstat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PicardSubcommand {
    MarkDuplicates,
    ValidateSamFile,
}

impl PicardSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PicardSubcommand::MarkDuplicates => "MarkDuplicates",
            PicardSubcommand::ValidateSamFile => "ValidateSamFile",
        }
    }
}

// Static Parameters

pub const SAM_EXT: &str = "sam";
pub const BAM_EXT: &str = "bam";
pub const BAI_EXT: &str = "bai";

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Errors ValidateSamFile may report without failing the stage.
pub const DEFAULT_VALIDATION_IGNORE: &[&str] = &[
    "MATE_NOT_FOUND",
    "MISSING_READ_GROUP",
    "INVALID_MAPPING_QUALITY",
];

pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 6 * 60 * 60;
pub const VERSION_CHECK_TIMEOUT_SECS: u64 = 30;
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
pub const SAM_REQUIRED_FIELDS: usize = 11;

/// Format tag carried by every staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileFormat {
    Sam,
    Bam,
    /// Coordinate-sorted BAM carrying a duplicate-marking @PG record.
    MarkedBam,
    Bai,
    Flagstat,
    ValidationReport,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Sam => SAM_EXT,
            FileFormat::Bam => BAM_EXT,
            FileFormat::MarkedBam => "markdup.bam",
            FileFormat::Bai => BAI_EXT,
            FileFormat::Flagstat => "flagstat.txt",
            FileFormat::ValidationReport => "validation.txt",
        }
    }

    /// Guesses the format of a caller-supplied input from its extension.
    pub fn from_extension(ext: &str) -> Option<FileFormat> {
        match ext.to_ascii_lowercase().as_str() {
            SAM_EXT => Some(FileFormat::Sam),
            BAM_EXT => Some(FileFormat::Bam),
            BAI_EXT => Some(FileFormat::Bai),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FileFormat::Sam => "sam",
            FileFormat::Bam => "bam",
            FileFormat::MarkedBam => "marked-bam",
            FileFormat::Bai => "bai",
            FileFormat::Flagstat => "flagstat",
            FileFormat::ValidationReport => "validation-report",
        };
        f.write_str(tag)
    }
}

/// Serialisable error taxonomy reported per stage in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    StagingCorruptInput,
    StagingIo,
    ToolExecutionFailure,
    ToolOutputInvalid,
    ValidationFailed,
    ToolTimeout,
    CancellationRequested,
}

/// Terminal failure of a single pipeline stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt input {path}: {reason}")]
    StagingCorruptInput { path: PathBuf, reason: String },

    #[error("Staging I/O error: {0}")]
    StagingIo(String),

    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolExecutionFailure {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} produced invalid output: {reason}")]
    ToolOutputInvalid { tool: String, reason: String },

    #[error("Validation reported errors: {}", .errors.join(", "))]
    ValidationFailed { errors: Vec<String> },

    #[error("{tool} timed out after {} seconds", .after.as_secs_f64())]
    ToolTimeout { tool: String, after: Duration },

    #[error("Cancellation requested")]
    CancellationRequested,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::InvalidInput(_) => ErrorKind::InvalidInput,
            StageError::StagingCorruptInput { .. } => ErrorKind::StagingCorruptInput,
            StageError::StagingIo(_) => ErrorKind::StagingIo,
            StageError::ToolExecutionFailure { .. } => ErrorKind::ToolExecutionFailure,
            StageError::ToolOutputInvalid { .. } => ErrorKind::ToolOutputInvalid,
            StageError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            StageError::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            StageError::CancellationRequested => ErrorKind::CancellationRequested,
        }
    }
}

/// Failures that prevent a job from starting at all.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct RunConfig {
    pub cwd: PathBuf,
    pub staging_root: PathBuf,
    pub out_dir: PathBuf,
    pub stage_timeout: Duration,
    pub threads: usize,
    pub max_concurrent_jobs: usize,
}

impl RunConfig {
    /// Config rooted in `base`, used by tests and embedding callers.
    pub fn with_root(base: &std::path::Path) -> Self {
        RunConfig {
            cwd: base.to_path_buf(),
            staging_root: base.join("staging"),
            out_dir: base.join("out"),
            stage_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            threads: 1,
            max_concurrent_jobs: 1,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_extension_lookup() {
        assert_eq!(FileFormat::from_extension("SAM"), Some(FileFormat::Sam));
        assert_eq!(FileFormat::from_extension("bam"), Some(FileFormat::Bam));
        assert_eq!(FileFormat::from_extension("cram"), None);
        assert_eq!(FileFormat::MarkedBam.extension(), "markdup.bam");
    }

    #[test]
    fn test_format_serde_matches_display() {
        for format in [
            FileFormat::Sam,
            FileFormat::Bam,
            FileFormat::MarkedBam,
            FileFormat::Bai,
            FileFormat::Flagstat,
            FileFormat::ValidationReport,
        ] {
            let json = serde_json::to_string(&format).unwrap();
            assert_eq!(json, format!("\"{}\"", format));
        }
    }

    #[test]
    fn test_stage_error_kinds() {
        let err = StageError::ToolTimeout {
            tool: "samtools sort".to_string(),
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
        assert!(err.to_string().contains("1.5 seconds"));

        let err = StageError::ValidationFailed {
            errors: vec!["MISSING_TAG_NM".to_string(), "INVALID_CIGAR".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.to_string().ends_with("MISSING_TAG_NM, INVALID_CIGAR"));
    }
}
