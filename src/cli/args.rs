use clap::Parser;

use crate::config::defs::DEFAULT_STAGE_TIMEOUT_SECS;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "reads-alignment-pipelines",
    version,
    about = "Runs samtools/Picard alignment pipelines and reports a manifest per job"
)]
pub struct Arguments {

    #[arg(
        short = 'j',
        long = "job",
        required = true,
        help = "JobSpec JSON file; repeat for several jobs"
    )]
    pub jobs: Vec<String>,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(
        short = 'o',
        long = "out",
        help = "Output directory for exported files. If not specified, a directory named \
                'alignment_out_YYYYMMDD' will be created in the current working directory."
    )]
    pub out_dir: Option<String>,

    #[arg(long, help = "Directory for per-job workspaces; defaults to the system temp dir")]
    pub staging_root: Option<String>,

    #[arg(long = "tools", help = "TOML tool registry overriding program paths and pinned versions")]
    pub tools: Option<String>,

    #[arg(
        long,
        default_value_t = DEFAULT_STAGE_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Default per-stage timeout in seconds"
    )]
    pub stage_timeout_secs: u64,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long, default_value_t = 2)]
    pub max_concurrent_jobs: usize,

    #[arg(long, help = "Write <job_id>.manifest.json here and print its path instead of the JSON")]
    pub manifest_dir: Option<String>,

    #[arg(long, default_value_t = false, help = "Check tool versions before running any job")]
    pub check_tools: bool,
}
