// src/pipelines/orchestrator.rs: runs a JobSpec through its pipeline and reports a Manifest

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::defs::{PipelineError, RunConfig, StageError};
use crate::config::registry::ToolRegistry;
use crate::pipelines::catalog::{PipelineDef, Source, StageDescriptor};
use crate::pipelines::job::JobSpec;
use crate::pipelines::manifest::{finalize, Manifest, OutputRecord, StageResult, StageStatus};
use crate::utils::command::{self, adapter_for, BoundInput, InvokeContext, ToolKind};
use crate::utils::file::resolve_path;
use crate::utils::runner::{CancelToken, ToolRunner};
use crate::utils::sambam::{parse_flagstat, AlignmentStats};
use crate::utils::staging::{StagedFile, StagingManager, Workspace};

pub struct Orchestrator {
    config: Arc<RunConfig>,
    registry: Arc<ToolRegistry>,
    runner: Arc<dyn ToolRunner>,
    staging: StagingManager,
}

/// Files produced so far within one job.
#[derive(Default)]
struct JobFiles {
    /// Job input role -> staged copy.
    inputs: HashMap<String, StagedFile>,
    /// Stage name -> output.
    outputs: HashMap<&'static str, StagedFile>,
}

struct StageSuccess {
    output: OutputRecord,
    stats: Option<AlignmentStats>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        registry: Arc<ToolRegistry>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let staging = StagingManager::new(config.staging_root.clone());
        Orchestrator {
            config,
            registry,
            runner,
            staging,
        }
    }

    pub async fn run(&self, job: &JobSpec) -> Result<Manifest, PipelineError> {
        self.run_with_cancel(job, &CancelToken::never()).await
    }

    /// Runs one job. Stage failures end up in the Manifest; `Err` means the job never started.
    ///
    /// # Arguments
    ///
    /// * `job` - Job to run.
    /// * `cancel` - Stops the running tool and all later stages when triggered.
    ///
    /// # Returns
    /// The job's Manifest.
    pub async fn run_with_cancel(
        &self,
        job: &JobSpec,
        cancel: &CancelToken,
    ) -> Result<Manifest, PipelineError> {
        let pipeline = job.validate()?;
        let workspace = self.staging.scoped_workspace(&job.id).map_err(|e| {
            PipelineError::IOError(format!(
                "Failed to allocate workspace for job {} under {}: {}",
                job.id,
                self.staging.root().display(),
                e
            ))
        })?;
        let export_dir = match &job.export_dir {
            Some(dir) => resolve_path(dir, &self.config.cwd),
            None => self.config.out_dir.join(&job.id),
        };

        info!(
            "Job {}: running pipeline {} in {}",
            job.id,
            pipeline.name,
            workspace.path().display()
        );
        let run_start = Instant::now();
        let results = self.run_stages(job, pipeline, &workspace, &export_dir, cancel).await;

        if let Err(e) = workspace.close() {
            warn!("Job {}: failed to remove workspace: {}", job.id, e);
        }

        let manifest = finalize(
            &job.id,
            pipeline.name,
            results,
            self.registry.versions_for(pipeline.tool_tags()),
        );
        if manifest.succeeded() {
            info!("Job {} succeeded in {} ms", job.id, run_start.elapsed().as_millis());
        } else {
            error!("Job {} failed after {} ms", job.id, run_start.elapsed().as_millis());
        }
        Ok(manifest)
    }

    async fn run_stages(
        &self,
        job: &JobSpec,
        pipeline: &'static PipelineDef,
        workspace: &Workspace,
        export_dir: &Path,
        cancel: &CancelToken,
    ) -> Vec<StageResult> {
        let mut files = JobFiles::default();
        let mut states: HashMap<&str, StageStatus> = HashMap::new();
        let mut results: Vec<StageResult> = Vec::new();
        let mut failed = false;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            let adapter = adapter_for(stage.tool);

            if cancel.is_cancelled() {
                warn!("Job {}: cancelled before {}", job.id, stage.name);
                results.push(StageResult::failed(
                    stage.name,
                    adapter.label(),
                    Utc::now(),
                    Duration::ZERO,
                    &StageError::CancellationRequested,
                ));
                break;
            }
            if failed && !stage.independent {
                debug!("Job {}: not running {} after failure", job.id, stage.name);
                continue;
            }
            if !dependencies_met(stage, &states) {
                debug!("Job {}: dependencies of {} not met", job.id, stage.name);
                continue;
            }

            let options = job.stage_options(stage.name);
            // A stage the job never enabled is not part of its run; later gates see it as skipped.
            if stage.opt_in && !options.enabled {
                debug!("Job {}: {} not enabled", job.id, stage.name);
                states.insert(stage.name, StageStatus::Skipped);
                continue;
            }
            if options.skip && stage.optional {
                info!("Job {}: skipping {}", job.id, stage.name);
                states.insert(stage.name, StageStatus::Skipped);
                results.push(StageResult::skipped(stage.name, adapter.label()));
                continue;
            }

            let timeout = options
                .timeout_secs
                .or(job.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(self.config.stage_timeout);

            info!("Job {}: starting {} ({})", job.id, stage.name, adapter.label());
            let started_at = Utc::now();
            let stage_start = Instant::now();
            let outcome = self
                .run_stage(
                    job,
                    index,
                    stage,
                    workspace,
                    &mut files,
                    &options.tool,
                    timeout,
                    export_dir,
                    cancel,
                )
                .await;

            match outcome {
                Ok(success) => {
                    info!(
                        "Job {}: {} succeeded in {} ms",
                        job.id,
                        stage.name,
                        stage_start.elapsed().as_millis()
                    );
                    states.insert(stage.name, StageStatus::Succeeded);
                    files.outputs.insert(stage.name, success.output.file.clone());
                    results.push(StageResult::succeeded(
                        stage.name,
                        adapter.label(),
                        started_at,
                        stage_start.elapsed(),
                        vec![success.output],
                        success.stats,
                    ));
                }
                Err(e) => {
                    error!("Job {}: {} failed: {}", job.id, stage.name, e);
                    states.insert(stage.name, StageStatus::Failed);
                    failed = true;
                    let cancelled = matches!(e, StageError::CancellationRequested);
                    results.push(StageResult::failed(
                        stage.name,
                        adapter.label(),
                        started_at,
                        stage_start.elapsed(),
                        &e,
                    ));
                    if cancelled {
                        break;
                    }
                }
            }
        }
        results
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        job: &JobSpec,
        index: usize,
        stage: &StageDescriptor,
        workspace: &Workspace,
        files: &mut JobFiles,
        tool_options: &std::collections::BTreeMap<String, String>,
        timeout: Duration,
        export_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<StageSuccess, StageError> {
        let mut staged: Vec<(&'static str, StagedFile)> = Vec::with_capacity(stage.inputs.len());
        for input in stage.inputs {
            let file = match input.source {
                Source::Job(role) => self.stage_job_input(job, role, workspace, files).await?,
                Source::Stage(producer) => files.outputs.get(producer).cloned().ok_or_else(|| {
                    StageError::InvalidInput(format!(
                        "stage {} has no output from {}",
                        stage.name, producer
                    ))
                })?,
            };
            staged.push((input.slot, file));
        }
        let bound: Vec<BoundInput<'_>> = staged
            .iter()
            .map(|(slot, file)| BoundInput { slot, file })
            .collect();

        let stage_dir = workspace.stage_dir(index, stage.name).map_err(|e| {
            StageError::StagingIo(format!("failed to create stage directory: {}", e))
        })?;
        let ctx = InvokeContext {
            registry: &self.registry,
            runner: self.runner.as_ref(),
            staging: &self.staging,
            workspace,
            stage_dir: &stage_dir,
            output_role: stage.output_role,
            timeout,
            default_threads: self.config.threads,
            cancel,
        };
        let adapter = adapter_for(stage.tool);
        let output = command::invoke(adapter, &ctx, &bound, tool_options).await?;

        let stats = if stage.tool == ToolKind::Flagstat {
            Some(read_stats(adapter.label(), &output.path).await?)
        } else {
            None
        };

        let exported_to = if stage.final_output {
            Some(self.staging.stage_out(&output, export_dir).await?)
        } else {
            None
        };

        Ok(StageSuccess {
            output: OutputRecord {
                file: output,
                exported_to,
            },
            stats,
        })
    }

    /// Stages a job input the first time a stage consumes it.
    async fn stage_job_input(
        &self,
        job: &JobSpec,
        role: &str,
        workspace: &Workspace,
        files: &mut JobFiles,
    ) -> Result<StagedFile, StageError> {
        if let Some(file) = files.inputs.get(role) {
            return Ok(file.clone());
        }
        let input = job
            .inputs
            .get(role)
            .ok_or_else(|| {
                StageError::InvalidInput(format!("job {} has no '{}' input", job.id, role))
            })?;
        let format = input.resolved_format()?;
        let location: PathBuf = resolve_path(&input.path, &self.config.cwd);
        let file = self.staging.stage_in(workspace, role, &location, format).await?;
        files.inputs.insert(role.to_string(), file.clone());
        Ok(file)
    }
}

/// Input producers must have succeeded; ordering-only dependencies may also have been skipped.
fn dependencies_met(stage: &StageDescriptor, states: &HashMap<&str, StageStatus>) -> bool {
    let producers_ok = stage.inputs.iter().all(|input| match input.source {
        Source::Job(_) => true,
        Source::Stage(name) => states.get(name) == Some(&StageStatus::Succeeded),
    });
    let gates_ok = stage.after.iter().all(|name| {
        matches!(
            states.get(name),
            Some(StageStatus::Succeeded) | Some(StageStatus::Skipped)
        )
    });
    producers_ok && gates_ok
}

async fn read_stats(tool: &str, path: &Path) -> Result<AlignmentStats, StageError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StageError::StagingIo(format!("failed to read {}: {}", path.display(), e)))?;
    parse_flagstat(&text).map_err(|e| StageError::ToolOutputInvalid {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}
