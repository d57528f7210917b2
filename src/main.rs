use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use env_logger::Builder;
use futures::future::join_all;
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::Semaphore;

use reads_alignment_pipelines::cli::{self, parse};
use reads_alignment_pipelines::config::defs::{PipelineError, RunConfig, PICARD_TAG, SAMTOOLS_TAG};
use reads_alignment_pipelines::config::registry::ToolRegistry;
use reads_alignment_pipelines::pipelines::{JobSpec, Manifest, Orchestrator};
use reads_alignment_pipelines::utils::command::check_versions;
use reads_alignment_pipelines::utils::file::resolve_path;
use reads_alignment_pipelines::utils::runner::{cancel_pair, ProcessRunner, ToolRunner};
use reads_alignment_pipelines::utils::system::{detect_cores_and_load, threads_per_job};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    let threads = threads_per_job(max_cores, args.max_concurrent_jobs);
    debug!(
        "Using {} cores (CPU load {:.1}%); {} threads per job, {} concurrent jobs",
        max_cores, cpu_load, threads, args.max_concurrent_jobs
    );

    let registry = match &args.tools {
        Some(path) => ToolRegistry::from_toml_file(&resolve_path(Path::new(path), &dir))?,
        None => ToolRegistry::default(),
    };
    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());

    if args.check_tools {
        let tags = [SAMTOOLS_TAG, PICARD_TAG];
        if let Err(e) = check_versions(&tags, &registry, runner.as_ref()).await {
            error!("Tool check failed: {}", e);
            std::process::exit(1);
        }
    }

    let out_dir = setup_output_dir(&args, &dir)?;
    let staging_root = match &args.staging_root {
        Some(root) => resolve_path(Path::new(root), &dir),
        None => env::temp_dir().join("reads-alignment-pipelines"),
    };
    let manifest_dir = args.manifest_dir.as_ref().map(|d| resolve_path(Path::new(d), &dir));

    let run_config = Arc::new(RunConfig {
        cwd: dir.clone(),
        staging_root,
        out_dir,
        stage_timeout: Duration::from_secs(args.stage_timeout_secs),
        threads,
        max_concurrent_jobs: args.max_concurrent_jobs.max(1),
    });

    let mut failures = 0usize;
    let mut jobs: Vec<JobSpec> = Vec::new();
    for path in &args.jobs {
        match JobSpec::from_json_file(&resolve_path(Path::new(path), &dir)) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                error!("Cannot load job {}: {}", path, e);
                failures += 1;
            }
        }
    }
    let total_jobs = args.jobs.len();

    let orchestrator = Arc::new(Orchestrator::new(run_config.clone(), Arc::new(registry), runner));
    let (cancel_handle, cancel_token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling running jobs");
            cancel_handle.cancel();
        }
    });

    let maximal_semaphore = Arc::new(Semaphore::new(run_config.max_concurrent_jobs));
    let tasks = jobs.into_iter().map(|job| {
        let orchestrator = orchestrator.clone();
        let semaphore = maximal_semaphore.clone();
        let cancel = cancel_token.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Other(anyhow!("Job semaphore closed: {}", e)))?;
            orchestrator.run_with_cancel(&job, &cancel).await
        })
    });

    for outcome in join_all(tasks).await {
        match outcome {
            Ok(Ok(manifest)) => {
                if !manifest.succeeded() {
                    failures += 1;
                }
                if let Err(e) = emit_manifest(&manifest, manifest_dir.as_deref()) {
                    error!("Failed to write manifest for job {}: {}", manifest.job_id(), e);
                    failures += 1;
                }
            }
            Ok(Err(e)) => {
                error!("Job could not start: {}", e);
                failures += 1;
            }
            Err(e) => {
                error!("Job task panicked: {}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        error!(
            "Pipeline failed: {} of {} jobs failed at {} milliseconds.",
            failures,
            total_jobs,
            run_start.elapsed().as_millis()
        );
        std::process::exit(1);
    }

    info!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Prints the manifest JSON, or writes it to `manifest_dir` and prints the path.
fn emit_manifest(manifest: &Manifest, manifest_dir: Option<&Path>) -> Result<()> {
    match manifest_dir {
        Some(dir) => {
            let path = manifest.write_to_dir(dir)?;
            println!("{}", path.display());
        }
        None => println!("{}", manifest.to_json()?),
    }
    Ok(())
}

/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `alignment_out_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &cli::Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => resolve_path(Path::new(out), cwd),
        None => {
            let date = chrono::Local::now().format("%Y%m%d");
            cwd.join(format!("alignment_out_{}", date))
        }
    };
    fs::create_dir_all(&out_dir)
        .map_err(|e| anyhow!("Failed to create output directory {}: {}", out_dir.display(), e))?;
    info!("Output directory: {}", out_dir.display());
    Ok(out_dir)
}
