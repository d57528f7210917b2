// src/utils/command.rs: tool adapters, one invocation contract over samtools and Picard subcommands

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use regex::Regex;

use crate::config::defs::{FileFormat, StageError, VERSION_CHECK_TIMEOUT_SECS};
use crate::config::registry::ToolRegistry;
use crate::utils::file::derive_output_name;
use crate::utils::runner::{CancelToken, Invocation, RunnerError, ToolOutput, ToolRunner};
use crate::utils::staging::{StagedFile, StagingManager, Workspace};

const MEMORY_SIZE: &str = r"^[1-9]\d*[KMG]?$";
const LIST_ITEM: &str = r"^\w+$";
const VERSION_NUMBER: &str = r"(\d+\.\d+(?:\.\d+)?)";

/// Logical tools the pipelines are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    SortBam,
    BamToSam,
    IndexBam,
    Flagstat,
    MarkDuplicates,
    ValidateSamFile,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionKind {
    Bool,
    UInt { min: u64, max: u64 },
    Choice(&'static [&'static str]),
    /// Sizes such as `768M`.
    Memory,
    /// Comma separated identifiers.
    List,
}

impl OptionKind {
    /// Returns the normalised value or the reason it was rejected.
    fn check(&self, value: &str) -> std::result::Result<String, String> {
        let value = value.trim();
        match self {
            OptionKind::Bool => match value.to_ascii_lowercase().as_str() {
                "true" | "false" => Ok(value.to_ascii_lowercase()),
                _ => Err("expected true or false".to_string()),
            },
            OptionKind::UInt { min, max } => {
                let n: u64 = value.parse().map_err(|_| "expected an unsigned integer".to_string())?;
                if n < *min || n > *max {
                    return Err(format!("must be between {} and {}", min, max));
                }
                Ok(n.to_string())
            }
            OptionKind::Choice(choices) => {
                if choices.contains(&value) {
                    Ok(value.to_string())
                } else {
                    Err(format!("expected one of {}", choices.join(", ")))
                }
            }
            OptionKind::Memory => {
                let memory = Regex::new(MEMORY_SIZE).map_err(|e| format!("Regex error: {}", e))?;
                if memory.is_match(value) {
                    Ok(value.to_string())
                } else {
                    Err("expected a size such as 768M".to_string())
                }
            }
            OptionKind::List => {
                let items: Vec<&str> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                let item = Regex::new(LIST_ITEM).map_err(|e| format!("Regex error: {}", e))?;
                if items.iter().all(|i| item.is_match(i)) {
                    Ok(items.join(","))
                } else {
                    Err("expected comma separated identifiers".to_string())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub key: &'static str,
    pub kind: OptionKind,
    pub default: Option<&'static str>,
}

const THREADS: OptionSpec = OptionSpec {
    key: "threads",
    kind: OptionKind::UInt { min: 1, max: 1024 },
    default: None,
};

/// Options that passed an adapter's schema, with defaults filled in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedOptions {
    values: BTreeMap<String, String>,
}

impl ValidatedOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }
}

/// An input slot an adapter requires and the formats it accepts there.
#[derive(Debug, Clone, Copy)]
pub struct InputRequirement {
    pub slot: &'static str,
    pub formats: &'static [FileFormat],
}

/// A staged file bound to one of the adapter's input slots.
#[derive(Debug, Clone, Copy)]
pub struct BoundInput<'a> {
    pub slot: &'a str,
    pub file: &'a StagedFile,
}

/// How the tool delivers its output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputCapture {
    /// Output path is passed as an argument.
    Argument,
    /// Tool writes to stdout, which is redirected to the output path.
    Stdout,
}

pub trait ToolAdapter: Send + Sync {
    /// Registry tag of the executable.
    fn tool_tag(&self) -> &'static str;

    /// Human readable name, e.g. "samtools sort".
    fn label(&self) -> &'static str;

    fn inputs(&self) -> &'static [InputRequirement];

    fn option_specs(&self) -> &'static [OptionSpec];

    fn output_format(&self) -> FileFormat;

    fn capture(&self) -> OutputCapture {
        OutputCapture::Argument
    }

    /// Arguments following the registry's prefix arguments.
    fn arg_generator(
        &self,
        inputs: &[BoundInput<'_>],
        options: &ValidatedOptions,
        output: &Path,
    ) -> Vec<String>;

    fn tolerated_exit(&self, code: i32, _stderr: &str) -> bool {
        code == 0
    }

    /// Semantic checks on top of the structural output check.
    fn check_output(
        &self,
        _output: &StagedFile,
        _options: &ValidatedOptions,
    ) -> Result<(), StageError> {
        Ok(())
    }
}

fn input<'a>(inputs: &[BoundInput<'a>], slot: &str) -> &'a Path {
    inputs
        .iter()
        .find(|i| i.slot == slot)
        .map(|i| i.file.path.as_path())
        .unwrap_or_else(|| Path::new(""))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Picard spills sort buffers to `TMP_DIR`; keep them next to the output, inside the
/// stage directory.
fn picard_tmp_dir(output: &Path) -> String {
    format!("TMP_DIR={}", path_arg(output.parent().unwrap_or(output)))
}

/// samtools `-@` is the number of additional threads.
fn samtools_threads(args: &mut Vec<String>, options: &ValidatedOptions) {
    if let Some(threads) = options.get_u64("threads") {
        if threads > 1 {
            args.push("-@".to_string());
            args.push((threads - 1).to_string());
        }
    }
}

pub mod samtools {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::config::defs::{SamtoolsSubcommand, SAMTOOLS_TAG};
    use crate::utils::file::{is_coordinate_sorted, read_bam_header};
    use crate::utils::sambam::parse_flagstat;

    const ALIGNMENT_ANY: &[FileFormat] = &[FileFormat::Sam, FileFormat::Bam, FileFormat::MarkedBam];
    const ALIGNMENT_BAM: &[FileFormat] = &[FileFormat::Bam, FileFormat::MarkedBam];

    pub struct SortBam;

    impl ToolAdapter for SortBam {
        fn tool_tag(&self) -> &'static str {
            SAMTOOLS_TAG
        }

        fn label(&self) -> &'static str {
            "samtools sort"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement {
                slot: "alignment",
                formats: &[FileFormat::Sam, FileFormat::Bam],
            }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[
                THREADS,
                OptionSpec {
                    key: "compression_level",
                    kind: OptionKind::UInt { min: 0, max: 9 },
                    default: Some("9"),
                },
                OptionSpec {
                    key: "memory_per_thread",
                    kind: OptionKind::Memory,
                    default: None,
                },
            ]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::Bam
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            options: &ValidatedOptions,
            output: &Path,
        ) -> Vec<String> {
            let mut args_vec: Vec<String> = vec![SamtoolsSubcommand::Sort.as_str().to_string()];
            if let Some(level) = options.get("compression_level") {
                args_vec.push("-l".to_string());
                args_vec.push(level.to_string());
            }
            args_vec.push("-O".to_string());
            args_vec.push("BAM".to_string());
            samtools_threads(&mut args_vec, options);
            if let Some(mem) = options.get("memory_per_thread") {
                args_vec.push("-m".to_string());
                args_vec.push(mem.to_string());
            }
            args_vec.push("-o".to_string());
            args_vec.push(path_arg(output));
            args_vec.push(path_arg(input(inputs, "alignment")));
            args_vec
        }

        fn check_output(
            &self,
            output: &StagedFile,
            _options: &ValidatedOptions,
        ) -> Result<(), StageError> {
            let header =
                read_bam_header(&output.path).map_err(|reason| StageError::ToolOutputInvalid {
                    tool: self.label().to_string(),
                    reason,
                })?;
            if !is_coordinate_sorted(&header) {
                return Err(StageError::ToolOutputInvalid {
                    tool: self.label().to_string(),
                    reason: "output header is not SO:coordinate".to_string(),
                });
            }
            Ok(())
        }
    }

    pub struct BamToSam;

    impl ToolAdapter for BamToSam {
        fn tool_tag(&self) -> &'static str {
            SAMTOOLS_TAG
        }

        fn label(&self) -> &'static str {
            "samtools view"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement { slot: "alignment", formats: ALIGNMENT_BAM }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[
                THREADS,
                OptionSpec { key: "include_header", kind: OptionKind::Bool, default: Some("true") },
            ]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::Sam
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            options: &ValidatedOptions,
            output: &Path,
        ) -> Vec<String> {
            let mut args_vec: Vec<String> = vec![SamtoolsSubcommand::View.as_str().to_string()];
            if options.get_bool("include_header") {
                args_vec.push("-h".to_string());
            }
            samtools_threads(&mut args_vec, options);
            args_vec.push("-o".to_string());
            args_vec.push(path_arg(output));
            args_vec.push(path_arg(input(inputs, "alignment")));
            args_vec
        }
    }

    pub struct IndexBam;

    impl ToolAdapter for IndexBam {
        fn tool_tag(&self) -> &'static str {
            SAMTOOLS_TAG
        }

        fn label(&self) -> &'static str {
            "samtools index"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement { slot: "alignment", formats: ALIGNMENT_BAM }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[THREADS]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::Bai
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            options: &ValidatedOptions,
            output: &Path,
        ) -> Vec<String> {
            let mut args_vec: Vec<String> =
                vec![SamtoolsSubcommand::Index.as_str().to_string(), "-b".to_string()];
            samtools_threads(&mut args_vec, options);
            args_vec.push(path_arg(input(inputs, "alignment")));
            args_vec.push(path_arg(output));
            args_vec
        }
    }

    pub struct Flagstat;

    impl ToolAdapter for Flagstat {
        fn tool_tag(&self) -> &'static str {
            SAMTOOLS_TAG
        }

        fn label(&self) -> &'static str {
            "samtools flagstat"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement { slot: "alignment", formats: ALIGNMENT_ANY }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[THREADS]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::Flagstat
        }

        fn capture(&self) -> OutputCapture {
            OutputCapture::Stdout
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            options: &ValidatedOptions,
            _output: &Path,
        ) -> Vec<String> {
            let mut args_vec: Vec<String> = vec![SamtoolsSubcommand::Flagstat.as_str().to_string()];
            samtools_threads(&mut args_vec, options);
            args_vec.push(path_arg(input(inputs, "alignment")));
            args_vec
        }

        fn check_output(
            &self,
            output: &StagedFile,
            _options: &ValidatedOptions,
        ) -> Result<(), StageError> {
            let text = fs::read_to_string(&output.path)
                .map_err(|e| StageError::StagingIo(e.to_string()))?;
            parse_flagstat(&text).map_err(|e| StageError::ToolOutputInvalid {
                tool: self.label().to_string(),
                reason: e.to_string(),
            })?;
            Ok(())
        }
    }
}

pub mod picard {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::config::defs::{PicardSubcommand, PICARD_TAG};
    #[cfg(test)]
    use crate::config::defs::DEFAULT_VALIDATION_IGNORE;
    use crate::utils::sambam::validation_errors;

    const VALIDATION_IGNORE_DEFAULT: &str =
        "MATE_NOT_FOUND,MISSING_READ_GROUP,INVALID_MAPPING_QUALITY";

    pub struct MarkDuplicates;

    impl ToolAdapter for MarkDuplicates {
        fn tool_tag(&self) -> &'static str {
            PICARD_TAG
        }

        fn label(&self) -> &'static str {
            "picard MarkDuplicates"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement {
                slot: "alignment",
                formats: &[FileFormat::Bam],
            }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[
                OptionSpec {
                    key: "remove_duplicates",
                    kind: OptionKind::Bool,
                    default: Some("false"),
                },
                OptionSpec {
                    key: "validation_stringency",
                    kind: OptionKind::Choice(&["STRICT", "LENIENT", "SILENT"]),
                    default: Some("LENIENT"),
                },
                OptionSpec {
                    key: "assume_sort_order",
                    kind: OptionKind::Choice(&["coordinate", "queryname", "unsorted"]),
                    default: None,
                },
            ]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::MarkedBam
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            options: &ValidatedOptions,
            output: &Path,
        ) -> Vec<String> {
            let metrics = output.with_extension("metrics.txt");
            let mut args_vec: Vec<String> = vec![
                PicardSubcommand::MarkDuplicates.as_str().to_string(),
                format!("I={}", path_arg(input(inputs, "alignment"))),
                format!("O={}", path_arg(output)),
                format!("M={}", path_arg(&metrics)),
                format!("REMOVE_DUPLICATES={}", options.get_bool("remove_duplicates")),
                picard_tmp_dir(output),
            ];
            if let Some(stringency) = options.get("validation_stringency") {
                args_vec.push(format!("VALIDATION_STRINGENCY={}", stringency));
            }
            if let Some(order) = options.get("assume_sort_order") {
                args_vec.push(format!("ASSUME_SORT_ORDER={}", order));
            }
            args_vec
        }
    }

    pub struct ValidateSamFile;

    impl ToolAdapter for ValidateSamFile {
        fn tool_tag(&self) -> &'static str {
            PICARD_TAG
        }

        fn label(&self) -> &'static str {
            "picard ValidateSamFile"
        }

        fn inputs(&self) -> &'static [InputRequirement] {
            &[InputRequirement {
                slot: "alignment",
                formats: &[FileFormat::Sam, FileFormat::Bam, FileFormat::MarkedBam],
            }]
        }

        fn option_specs(&self) -> &'static [OptionSpec] {
            &[OptionSpec {
                key: "ignore",
                kind: OptionKind::List,
                default: Some(VALIDATION_IGNORE_DEFAULT),
            }]
        }

        fn output_format(&self) -> FileFormat {
            FileFormat::ValidationReport
        }

        fn capture(&self) -> OutputCapture {
            OutputCapture::Stdout
        }

        fn arg_generator(
            &self,
            inputs: &[BoundInput<'_>],
            _options: &ValidatedOptions,
            output: &Path,
        ) -> Vec<String> {
            vec![
                PicardSubcommand::ValidateSamFile.as_str().to_string(),
                format!("I={}", path_arg(input(inputs, "alignment"))),
                "MODE=SUMMARY".to_string(),
                picard_tmp_dir(output),
            ]
        }

        // Findings are reported through the summary and a non-zero exit; only a crash
        // is an execution failure.
        fn tolerated_exit(&self, code: i32, stderr: &str) -> bool {
            (0..=3).contains(&code) && !stderr.contains("Exception")
        }

        fn check_output(
            &self,
            output: &StagedFile,
            options: &ValidatedOptions,
        ) -> Result<(), StageError> {
            let report = fs::read_to_string(&output.path)
                .map_err(|e| StageError::StagingIo(e.to_string()))?;
            let errors = validation_errors(&report, &options.get_list("ignore"));
            if errors.is_empty() {
                Ok(())
            } else {
                Err(StageError::ValidationFailed { errors })
            }
        }
    }

}

static SORT_BAM: samtools::SortBam = samtools::SortBam;
static BAM_TO_SAM: samtools::BamToSam = samtools::BamToSam;
static INDEX_BAM: samtools::IndexBam = samtools::IndexBam;
static FLAGSTAT: samtools::Flagstat = samtools::Flagstat;
static MARK_DUPLICATES: picard::MarkDuplicates = picard::MarkDuplicates;
static VALIDATE_SAM_FILE: picard::ValidateSamFile = picard::ValidateSamFile;

pub fn adapter_for(kind: ToolKind) -> &'static dyn ToolAdapter {
    match kind {
        ToolKind::SortBam => &SORT_BAM,
        ToolKind::BamToSam => &BAM_TO_SAM,
        ToolKind::IndexBam => &INDEX_BAM,
        ToolKind::Flagstat => &FLAGSTAT,
        ToolKind::MarkDuplicates => &MARK_DUPLICATES,
        ToolKind::ValidateSamFile => &VALIDATE_SAM_FILE,
    }
}

/// Checks inputs against the adapter's slots before anything is started.
pub fn check_inputs(
    adapter: &dyn ToolAdapter,
    inputs: &[BoundInput<'_>],
) -> Result<(), StageError> {
    for bound in inputs {
        if !adapter.inputs().iter().any(|req| req.slot == bound.slot) {
            return Err(StageError::InvalidInput(format!(
                "{} has no input slot '{}'",
                adapter.label(),
                bound.slot
            )));
        }
    }
    for req in adapter.inputs() {
        let bound: Vec<&BoundInput<'_>> = inputs.iter().filter(|i| i.slot == req.slot).collect();
        let file = match bound.as_slice() {
            [only] => only.file,
            [] => {
                return Err(StageError::InvalidInput(format!(
                    "{} requires input '{}'",
                    adapter.label(),
                    req.slot
                )))
            }
            _ => {
                return Err(StageError::InvalidInput(format!(
                    "{} got more than one '{}' input",
                    adapter.label(),
                    req.slot
                )))
            }
        };
        if !req.formats.contains(&file.format) {
            let accepted: Vec<String> = req.formats.iter().map(|f| f.to_string()).collect();
            return Err(StageError::InvalidInput(format!(
                "{} input '{}' ({}) is {}, expected {}",
                adapter.label(),
                req.slot,
                file.file_name(),
                file.format,
                accepted.join(" or ")
            )));
        }
    }
    Ok(())
}

/// Validates caller options against the adapter's schema and fills defaults.
pub fn validate_options(
    adapter: &dyn ToolAdapter,
    raw: &BTreeMap<String, String>,
) -> Result<ValidatedOptions, StageError> {
    let mut values = BTreeMap::new();
    for (key, value) in raw {
        let spec = adapter
            .option_specs()
            .iter()
            .find(|s| s.key == key.as_str())
            .ok_or_else(|| {
                StageError::InvalidInput(format!(
                    "{} does not accept option '{}'",
                    adapter.label(),
                    key
                ))
            })?;
        let normalised = spec.kind.check(value).map_err(|reason| {
            StageError::InvalidInput(format!(
                "{} option {}={}: {}",
                adapter.label(),
                key,
                value,
                reason
            ))
        })?;
        values.insert(key.clone(), normalised);
    }
    for spec in adapter.option_specs() {
        if let Some(default) = spec.default {
            values.entry(spec.key.to_string()).or_insert_with(|| default.to_string());
        }
    }
    Ok(ValidatedOptions { values })
}

/// Everything an adapter invocation needs from its surroundings.
pub struct InvokeContext<'a> {
    pub registry: &'a ToolRegistry,
    pub runner: &'a dyn ToolRunner,
    pub staging: &'a StagingManager,
    /// Job workspace; no path argument may point outside it.
    pub workspace: &'a Workspace,
    /// Stage working directory inside the workspace.
    pub stage_dir: &'a Path,
    pub output_role: &'a str,
    pub timeout: Duration,
    pub default_threads: usize,
    pub cancel: &'a CancelToken,
}

/// Full command line for an adapter, prefix arguments from the registry included.
pub fn generate_cli(
    adapter: &dyn ToolAdapter,
    registry: &ToolRegistry,
    inputs: &[BoundInput<'_>],
    options: &ValidatedOptions,
    output: &Path,
) -> Result<(PathBuf, Vec<String>), StageError> {
    let entry = registry.get(adapter.tool_tag()).ok_or_else(|| StageError::ToolExecutionFailure {
        tool: adapter.label().to_string(),
        code: None,
        stderr: format!("{} is not in the tool registry", adapter.tool_tag()),
    })?;
    let mut args = entry.prefix_args.clone();
    args.extend(adapter.arg_generator(inputs, options, output));
    Ok((entry.program.clone(), args))
}

/// Runs one adapter: input/option validation, process execution, output re-validation.
///
/// # Arguments
///
/// * `adapter` - Tool to run.
/// * `ctx` - Registry, runner, workspace and limits.
/// * `inputs` - Staged inputs bound to the adapter's slots.
/// * `raw_options` - Caller options for this tool.
///
/// # Returns
/// The produced output as a StagedFile.
pub async fn invoke(
    adapter: &dyn ToolAdapter,
    ctx: &InvokeContext<'_>,
    inputs: &[BoundInput<'_>],
    raw_options: &BTreeMap<String, String>,
) -> Result<StagedFile, StageError> {
    check_inputs(adapter, inputs)?;
    let mut options = validate_options(adapter, raw_options)?;
    let takes_threads = adapter.option_specs().iter().any(|s| s.key == "threads");
    if takes_threads && options.get("threads").is_none() {
        options.values.insert("threads".to_string(), ctx.default_threads.max(1).to_string());
    }

    for bound in inputs {
        if !ctx.workspace.contains(&bound.file.path) {
            return Err(StageError::InvalidInput(format!(
                "{} is outside the job workspace",
                bound.file.path.display()
            )));
        }
    }
    if !ctx.workspace.contains(ctx.stage_dir) {
        return Err(StageError::InvalidInput(format!(
            "stage directory {} is outside the job workspace",
            ctx.stage_dir.display()
        )));
    }

    let primary = inputs
        .first()
        .map(|i| i.file.path.clone())
        .unwrap_or_else(|| PathBuf::from(ctx.output_role));
    let output = ctx.stage_dir.join(derive_output_name(&primary, adapter.output_format()));
    // Arguments are passed to the tool as UTF-8 strings.
    for path in inputs.iter().map(|i| i.file.path.as_path()).chain([output.as_path()]) {
        if path.to_str().is_none() {
            return Err(StageError::InvalidInput(format!(
                "{} is not a valid UTF-8 path",
                path.display()
            )));
        }
    }
    let (program, args) = generate_cli(adapter, ctx.registry, inputs, &options, &output)?;

    let invocation = Invocation {
        tool: adapter.label().to_string(),
        program,
        args,
        cwd: ctx.stage_dir.to_path_buf(),
        stdout_path: match adapter.capture() {
            OutputCapture::Stdout => Some(output.clone()),
            OutputCapture::Argument => None,
        },
        output: output.clone(),
        timeout: ctx.timeout,
    };

    info!("Running {} -> {}", adapter.label(), output.display());
    let result: ToolOutput = ctx
        .runner
        .invoke(&invocation, ctx.cancel)
        .await
        .map_err(|e| runner_error(adapter, e))?;

    match result.code {
        Some(code) if adapter.tolerated_exit(code, &result.stderr) => {
            debug!("{} exited with {}", adapter.label(), code);
        }
        code => {
            return Err(StageError::ToolExecutionFailure {
                tool: adapter.label().to_string(),
                code,
                stderr: result.stderr.trim().to_string(),
            });
        }
    }

    let staged = ctx
        .staging
        .seal(adapter.label(), ctx.output_role, &output, adapter.output_format())
        .await?;
    adapter.check_output(&staged, &options)?;
    Ok(staged)
}

fn runner_error(adapter: &dyn ToolAdapter, err: RunnerError) -> StageError {
    match err {
        RunnerError::Timeout(after) => StageError::ToolTimeout {
            tool: adapter.label().to_string(),
            after,
        },
        RunnerError::Cancelled => StageError::CancellationRequested,
        other => StageError::ToolExecutionFailure {
            tool: adapter.label().to_string(),
            code: None,
            stderr: other.to_string(),
        },
    }
}

/// Asks a registered tool for its version.
///
/// # Returns
/// The first dotted version number found on stdout or stderr.
pub async fn check_version(
    tag: &str,
    registry: &ToolRegistry,
    runner: &dyn ToolRunner,
) -> Result<String> {
    let entry = registry
        .get(tag)
        .ok_or_else(|| anyhow!("Unknown tool: {}", tag))?;
    let mut args = entry.prefix_args.clone();
    args.extend(entry.version_args.iter().cloned());
    let cwd = std::env::temp_dir();
    let invocation = Invocation {
        tool: format!("{} version check", tag),
        program: entry.program.clone(),
        args,
        cwd: cwd.clone(),
        stdout_path: None,
        output: cwd,
        timeout: Duration::from_secs(VERSION_CHECK_TIMEOUT_SECS),
    };
    let output = runner
        .invoke(&invocation, &CancelToken::never())
        .await
        .map_err(|e| {
            anyhow!("Failed to run {}: {}. Is {} installed?", entry.program.display(), e, tag)
        })?;

    let text = format!("{}\n{}", String::from_utf8_lossy(&output.stdout), output.stderr);
    let version = Regex::new(VERSION_NUMBER)
        .map_err(|e| anyhow!("Regex error: {}", e))?
        .captures(&text)
        .map(|c| c[1].to_string())
        .ok_or_else(|| anyhow!("No version number in {} output: {}", tag, text.trim()))?;
    Ok(version)
}

/// Queries every tool in `tags`; mismatches with the pinned versions are warnings.
pub async fn check_versions(
    tags: &[&str],
    registry: &ToolRegistry,
    runner: &dyn ToolRunner,
) -> Result<BTreeMap<String, String>> {
    let mut found = BTreeMap::new();
    for tag in tags {
        let version = check_version(tag, registry, runner).await?;
        if let Some(entry) = registry.get(tag) {
            if !version.starts_with(&entry.version) {
                warn!("{} version {} differs from pinned {}", tag, version, entry.version);
            } else {
                info!("{} version {}", tag, version);
            }
        }
        found.insert(tag.to_string(), version);
    }
    Ok(found)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::{PICARD_TAG, SAMTOOLS_TAG};
    use crate::utils::runner::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn staged(path: &str, format: FileFormat) -> StagedFile {
        StagedFile {
            role: "aligned-reads".to_string(),
            path: PathBuf::from(path),
            format,
            size: 10,
            checksum: "0".repeat(16),
        }
    }

    /// Records invocations and writes a fixed payload to the expected output.
    struct ScriptedRunner {
        calls: Mutex<Vec<Invocation>>,
        code: i32,
        stderr: String,
        payload: Vec<u8>,
    }

    impl ScriptedRunner {
        fn new(code: i32, payload: &[u8]) -> Self {
            ScriptedRunner {
                calls: Mutex::new(Vec::new()),
                code,
                stderr: String::new(),
                payload: payload.to_vec(),
            }
        }
    }

    #[async_trait]
    impl ToolRunner for ScriptedRunner {
        async fn invoke(
            &self,
            invocation: &Invocation,
            _cancel: &CancelToken,
        ) -> Result<ToolOutput, RunnerError> {
            self.calls.lock().unwrap().push(invocation.clone());
            let target = invocation
                .stdout_path
                .clone()
                .unwrap_or_else(|| invocation.output.clone());
            std::fs::write(&target, &self.payload).unwrap();
            Ok(ToolOutput {
                code: Some(self.code),
                stdout: Vec::new(),
                stderr: self.stderr.clone(),
            })
        }
    }

    #[test]
    fn test_sort_args() {
        let input = staged("/ws/inputs/sample.sam", FileFormat::Sam);
        let bound = [BoundInput { slot: "alignment", file: &input }];
        let adapter = adapter_for(ToolKind::SortBam);
        let mut raw = BTreeMap::new();
        raw.insert("threads".to_string(), "4".to_string());
        raw.insert("memory_per_thread".to_string(), "768M".to_string());
        let options = validate_options(adapter, &raw).unwrap();
        let output = Path::new("/ws/stages/01_sort_bam/sample.bam");
        let args = adapter.arg_generator(&bound, &options, output);
        assert_eq!(
            args,
            vec![
                "sort", "-l", "9", "-O", "BAM", "-@", "3", "-m", "768M", "-o",
                "/ws/stages/01_sort_bam/sample.bam", "/ws/inputs/sample.sam"
            ]
        );
    }

    #[test]
    fn test_picard_args_with_registry_prefix() {
        let input = staged("/ws/stages/01_sort_bam/sample.bam", FileFormat::Bam);
        let bound = [BoundInput { slot: "alignment", file: &input }];
        let adapter = adapter_for(ToolKind::MarkDuplicates);
        let options = validate_options(adapter, &BTreeMap::new()).unwrap();
        let (program, args) = generate_cli(
            adapter,
            &ToolRegistry::default(),
            &bound,
            &options,
            Path::new("/ws/stages/02_mark_duplicates/sample.markdup.bam"),
        )
        .unwrap();
        assert_eq!(program, PathBuf::from("java"));
        assert_eq!(args[..3], ["-jar", crate::config::defs::PICARD_JAR, "MarkDuplicates"]);
        assert!(args.contains(&"I=/ws/stages/01_sort_bam/sample.bam".to_string()));
        let metrics = "M=/ws/stages/02_mark_duplicates/sample.markdup.metrics.txt";
        assert!(args.contains(&metrics.to_string()));
        assert!(args.contains(&"REMOVE_DUPLICATES=false".to_string()));
        assert!(args.contains(&"VALIDATION_STRINGENCY=LENIENT".to_string()));
        assert!(args.contains(&"TMP_DIR=/ws/stages/02_mark_duplicates".to_string()));
    }

    #[test]
    fn test_option_validation() {
        let adapter = adapter_for(ToolKind::SortBam);
        let mut raw = BTreeMap::new();
        raw.insert("compression_level".to_string(), "12".to_string());
        assert!(matches!(validate_options(adapter, &raw), Err(StageError::InvalidInput(_))));

        let mut raw = BTreeMap::new();
        raw.insert("bogus".to_string(), "1".to_string());
        let err = validate_options(adapter, &raw).unwrap_err();
        assert!(err.to_string().contains("does not accept option 'bogus'"));

        let adapter = adapter_for(ToolKind::BamToSam);
        let mut raw = BTreeMap::new();
        raw.insert("include_header".to_string(), "FALSE".to_string());
        let options = validate_options(adapter, &raw).unwrap();
        assert!(!options.get_bool("include_header"));

        let adapter = adapter_for(ToolKind::ValidateSamFile);
        let options = validate_options(adapter, &BTreeMap::new()).unwrap();
        assert_eq!(options.get_list("ignore").len(), 3);
    }

    #[test]
    fn test_check_inputs_rejects_wrong_format() {
        let adapter = adapter_for(ToolKind::MarkDuplicates);
        let sam = staged("/ws/inputs/sample.sam", FileFormat::Sam);
        let err =
            check_inputs(adapter, &[BoundInput { slot: "alignment", file: &sam }]).unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));
        assert!(err.to_string().contains("expected bam"));

        let err = check_inputs(adapter, &[]).unwrap_err();
        assert!(err.to_string().contains("requires input 'alignment'"));

        let bam = staged("/ws/inputs/sample.bam", FileFormat::Bam);
        let err = check_inputs(
            adapter,
            &[
                BoundInput { slot: "alignment", file: &bam },
                BoundInput { slot: "reference", file: &bam },
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("no input slot 'reference'"));
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_runner() {
        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path());
        let ws = staging.scoped_workspace("job").unwrap();
        let stage_dir = ws.stage_dir(0, "mark_duplicates").unwrap();
        let runner = ScriptedRunner::new(0, b"");
        let registry = ToolRegistry::default();
        let cancel = CancelToken::never();
        let ctx = InvokeContext {
            registry: &registry,
            runner: &runner,
            staging: &staging,
            workspace: &ws,
            stage_dir: &stage_dir,
            output_role: "marked-alignment",
            timeout: Duration::from_secs(5),
            default_threads: 1,
            cancel: &cancel,
        };
        let sam = staged(&ws.inputs_dir().join("s.sam").to_string_lossy(), FileFormat::Sam);
        let err = invoke(
            adapter_for(ToolKind::MarkDuplicates),
            &ctx,
            &[BoundInput { slot: "alignment", file: &sam }],
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));

        let stray = staged(&dir.path().join("elsewhere.bam").to_string_lossy(), FileFormat::Bam);
        let err = invoke(
            adapter_for(ToolKind::MarkDuplicates),
            &ctx,
            &[BoundInput { slot: "alignment", file: &stray }],
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("outside the job workspace"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_path_never_reaches_runner() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path());
        let ws = staging.scoped_workspace("job").unwrap();
        let stage_dir = ws.stage_dir(0, "sort_bam").unwrap();
        let runner = ScriptedRunner::new(0, b"");
        let registry = ToolRegistry::default();
        let cancel = CancelToken::never();
        let ctx = InvokeContext {
            registry: &registry,
            runner: &runner,
            staging: &staging,
            workspace: &ws,
            stage_dir: &stage_dir,
            output_role: "sorted-alignment",
            timeout: Duration::from_secs(5),
            default_threads: 1,
            cancel: &cancel,
        };
        let input = StagedFile {
            path: ws.inputs_dir().join(OsStr::from_bytes(b"reads\xfe.sam")),
            ..staged("/unused", FileFormat::Sam)
        };
        let err = invoke(
            adapter_for(ToolKind::SortBam),
            &ctx,
            &[BoundInput { slot: "alignment", file: &input }],
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not a valid UTF-8 path"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_invalid_output() {
        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path());
        let ws = staging.scoped_workspace("job").unwrap();
        let stage_dir = ws.stage_dir(0, "index_bam").unwrap();
        let registry = ToolRegistry::default();
        let cancel = CancelToken::never();
        let input_path = ws.inputs_dir().join("s.bam");
        std::fs::write(&input_path, b"x").unwrap();
        let bam = staged(&input_path.to_string_lossy(), FileFormat::Bam);
        let bound = [BoundInput { slot: "alignment", file: &bam }];

        let mut failing = ScriptedRunner::new(1, b"");
        failing.stderr = "[E::hts_idx_push] unsorted positions\n".to_string();
        let ctx = InvokeContext {
            registry: &registry,
            runner: &failing,
            staging: &staging,
            workspace: &ws,
            stage_dir: &stage_dir,
            output_role: "alignment-index",
            timeout: Duration::from_secs(5),
            default_threads: 2,
            cancel: &cancel,
        };
        let err = invoke(adapter_for(ToolKind::IndexBam), &ctx, &bound, &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            StageError::ToolExecutionFailure { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "[E::hts_idx_push] unsorted positions");
            }
            other => panic!("unexpected error: {other}"),
        }
        let call = failing.calls.lock().unwrap()[0].clone();
        assert_eq!(call.program, PathBuf::from(SAMTOOLS_TAG));
        assert_eq!(call.args[..4], ["index", "-b", "-@", "1"]);
        assert_eq!(call.cwd, stage_dir);

        // Claims success but writes garbage.
        let lying = ScriptedRunner::new(0, b"not an index");
        let ctx = InvokeContext { runner: &lying, ..ctx };
        let err = invoke(adapter_for(ToolKind::IndexBam), &ctx, &bound, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ToolOutputInvalid { .. }));
    }

    #[tokio::test]
    async fn test_validation_report_findings() {
        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path());
        let ws = staging.scoped_workspace("job").unwrap();
        let stage_dir = ws.stage_dir(0, "validate").unwrap();
        let registry = ToolRegistry::default();
        let cancel = CancelToken::never();
        let input_path = ws.inputs_dir().join("s.sam");
        let sam = staged(&input_path.to_string_lossy(), FileFormat::Sam);
        let bound = [BoundInput { slot: "alignment", file: &sam }];

        let findings = b"Error Type\tCount\nERROR:INVALID_CIGAR\t2\nERROR:MATE_NOT_FOUND\t7\n";
        let runner = ScriptedRunner::new(2, findings);
        let ctx = InvokeContext {
            registry: &registry,
            runner: &runner,
            staging: &staging,
            workspace: &ws,
            stage_dir: &stage_dir,
            output_role: "validation-report",
            timeout: Duration::from_secs(5),
            default_threads: 1,
            cancel: &cancel,
        };
        let err = invoke(adapter_for(ToolKind::ValidateSamFile), &ctx, &bound, &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            StageError::ValidationFailed { errors } => assert_eq!(errors, vec!["INVALID_CIGAR"]),
            other => panic!("unexpected error: {other}"),
        }
        let call = runner.calls.lock().unwrap()[0].clone();
        assert_eq!(call.stdout_path, Some(stage_dir.join("s.validation.txt")));
        let tmp_dir = call.args.iter().find_map(|a| a.strip_prefix("TMP_DIR=")).unwrap();
        assert_eq!(Path::new(tmp_dir), stage_dir);
        assert!(Path::new(tmp_dir).starts_with(ws.path()));

        let clean = ScriptedRunner::new(0, b"No errors found\n");
        let ctx = InvokeContext { runner: &clean, ..ctx };
        let report = invoke(adapter_for(ToolKind::ValidateSamFile), &ctx, &bound, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(report.format, FileFormat::ValidationReport);
        assert_eq!(report.role, "validation-report");
    }

    #[tokio::test]
    async fn test_check_version_parses_version_output() {
        struct VersionRunner;

        #[async_trait]
        impl ToolRunner for VersionRunner {
            async fn invoke(
                &self,
                invocation: &Invocation,
                _cancel: &CancelToken,
            ) -> Result<ToolOutput, RunnerError> {
                if invocation.program == PathBuf::from("java") {
                    Ok(ToolOutput {
                        code: Some(1),
                        stdout: Vec::new(),
                        stderr: "Version:2.27.5\n".to_string(),
                    })
                } else {
                    Ok(ToolOutput {
                        code: Some(0),
                        stdout: b"samtools 1.20\nUsing htslib 1.20\n".to_vec(),
                        stderr: String::new(),
                    })
                }
            }
        }

        let registry = ToolRegistry::default();
        let versions = check_versions(&[SAMTOOLS_TAG, PICARD_TAG], &registry, &VersionRunner)
            .await
            .unwrap();
        assert_eq!(versions[SAMTOOLS_TAG], "1.20");
        assert_eq!(versions[PICARD_TAG], "2.27.5");
        assert!(check_version("bwa", &registry, &VersionRunner).await.is_err());
    }
}
