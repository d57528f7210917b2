use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::defs::{FileFormat, PipelineError, StageError};
use crate::pipelines::catalog::{self, PipelineDef};


/// Stage options understood by the orchestrator rather than the tool.
pub const SKIP_OPTION: &str = "skip";
pub const TIMEOUT_OPTION: &str = "timeout_secs";
pub const ENABLE_OPTION: &str = "enabled";

const JOB_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

/// A caller-supplied input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
}

impl InputRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        InputRef {
            path: path.into(),
            format: None,
        }
    }

    /// Declared format, or the one implied by the file extension.
    pub fn resolved_format(&self) -> Result<FileFormat, StageError> {
        if let Some(format) = self.format {
            return Ok(format);
        }
        self.path
            .extension()
            .and_then(|e| FileFormat::from_extension(&e.to_string_lossy()))
            .ok_or_else(|| {
                StageError::InvalidInput(format!(
                    "cannot infer format of {}; declare it explicitly",
                    self.path.display()
                ))
            })
    }
}

/// One job submission. Never modified by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    pub pipeline: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputRef>,
    /// Stage name -> option key -> value.
    #[serde(default, deserialize_with = "stringify_options")]
    pub options: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Accepts JSON strings, numbers, booleans and arrays as option values.
fn stringify_options<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::deserialize(deserializer)?;
    let mut options = BTreeMap::new();
    for (stage, values) in raw {
        let mut converted = BTreeMap::new();
        for (key, value) in values {
            let text = option_text(&value).ok_or_else(|| {
                D::Error::custom(format!(
                    "option {}.{} has unsupported value {}",
                    stage, key, value
                ))
            })?;
            converted.insert(key, text);
        }
        options.insert(stage, converted);
    }
    Ok(options)
}

fn option_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|i| match i {
                Value::Array(_) | Value::Object(_) | Value::Null => None,
                other => option_text(other),
            })
            .collect::<Option<Vec<String>>>()
            .map(|v| v.join(",")),
        Value::Null | Value::Object(_) => None,
    }
}

impl JobSpec {
    pub fn new(id: &str, pipeline: &str) -> Self {
        JobSpec {
            id: id.to_string(),
            pipeline: pipeline.to_string(),
            inputs: BTreeMap::new(),
            options: BTreeMap::new(),
            export_dir: None,
            timeout_secs: None,
        }
    }

    pub fn with_input(mut self, role: &str, input: InputRef) -> Self {
        self.inputs.insert(role.to_string(), input);
        self
    }

    pub fn with_option(mut self, stage: &str, key: &str, value: &str) -> Self {
        self.options
            .entry(stage.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::InvalidJobSpec(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::IOError(format!("Failed to read job {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::InvalidJobSpec(format!("{}: {}", path.display(), e)))
    }

    /// Checks everything that can be checked before a workspace exists.
    ///
    /// # Returns
    /// The pipeline this job runs.
    pub fn validate(&self) -> Result<&'static PipelineDef, PipelineError> {
        let job_id = Regex::new(JOB_ID_PATTERN)
            .map_err(|e| PipelineError::Other(anyhow!("Regex error: {}", e)))?;
        if !job_id.is_match(&self.id) {
            return Err(PipelineError::InvalidJobSpec(format!(
                "job id '{}' must be 1-128 characters of [A-Za-z0-9._-] \
                 and not start with punctuation",
                self.id
            )));
        }
        let pipeline = catalog::pipeline(&self.pipeline).ok_or_else(|| {
            PipelineError::InvalidJobSpec(format!(
                "unknown pipeline '{}' (available: {})",
                self.pipeline,
                catalog::pipeline_names().join(", ")
            ))
        })?;

        if self.timeout_secs == Some(0) {
            return Err(PipelineError::InvalidJobSpec("timeout_secs must be positive".to_string()));
        }

        for (stage_name, options) in &self.options {
            let stage = pipeline.stage(stage_name).ok_or_else(|| {
                PipelineError::InvalidJobSpec(format!(
                    "pipeline {} has no stage '{}'",
                    pipeline.name, stage_name
                ))
            })?;
            if let Some(skip) = options.get(SKIP_OPTION) {
                let skip = parse_flag(skip).ok_or_else(|| {
                    PipelineError::InvalidJobSpec(format!(
                        "{}.skip must be true or false",
                        stage_name
                    ))
                })?;
                if skip && !stage.optional {
                    return Err(PipelineError::InvalidJobSpec(format!(
                        "stage '{}' is not optional and cannot be skipped",
                        stage_name
                    )));
                }
            }
            if let Some(enabled) = options.get(ENABLE_OPTION) {
                parse_flag(enabled).ok_or_else(|| {
                    PipelineError::InvalidJobSpec(format!(
                        "{}.enabled must be true or false",
                        stage_name
                    ))
                })?;
                if !stage.opt_in {
                    return Err(PipelineError::InvalidJobSpec(format!(
                        "stage '{}' always runs and cannot be enabled",
                        stage_name
                    )));
                }
            }
            if let Some(timeout) = options.get(TIMEOUT_OPTION) {
                match timeout.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => {}
                    _ => {
                        return Err(PipelineError::InvalidJobSpec(format!(
                            "{}.timeout_secs must be a positive integer",
                            stage_name
                        )))
                    }
                }
            }
        }
        Ok(pipeline)
    }

    /// Options addressed to `stage`, split into orchestrator and tool options.
    pub fn stage_options(&self, stage: &str) -> StageOptions {
        let mut parsed = StageOptions::default();
        if let Some(options) = self.options.get(stage) {
            for (key, value) in options {
                match key.as_str() {
                    SKIP_OPTION => parsed.skip = parse_flag(value).unwrap_or(false),
                    ENABLE_OPTION => parsed.enabled = parse_flag(value).unwrap_or(false),
                    TIMEOUT_OPTION => parsed.timeout_secs = value.trim().parse().ok(),
                    _ => {
                        parsed.tool.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        parsed
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOptions {
    pub skip: bool,
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub tool: BTreeMap<String, String>,
}
