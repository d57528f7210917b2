// Shared fixtures for the integration tests: synthetic alignment files and a scripted tool runner.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use noodles::{bam, sam};

use reads_alignment_pipelines::config::defs::RunConfig;
use reads_alignment_pipelines::config::registry::ToolRegistry;
use reads_alignment_pipelines::pipelines::Orchestrator;
use reads_alignment_pipelines::utils::runner::{
    CancelToken, Invocation, RunnerError, ToolOutput, ToolRunner,
};

pub const SAM: &[u8] = b"@HD\tVN:1.6\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n\
r1\t0\tchr1\t100\t60\t4M\t*\t0\t0\tACGT\tIIII\n\
r2\t0\tchr1\t10\t60\t4M\t*\t0\t0\tTGCA\tIIII\n";

pub const FLAGSTAT: &str = "\
2 + 0 in total (QC-passed reads + QC-failed reads)
2 + 0 primary
0 + 0 secondary
0 + 0 supplementary
0 + 0 duplicates
0 + 0 primary duplicates
2 + 0 mapped (100.00% : N/A)
2 + 0 primary mapped (100.00% : N/A)
0 + 0 paired in sequencing
0 + 0 read1
0 + 0 read2
0 + 0 properly paired (N/A : N/A)
0 + 0 with itself and mate mapped
0 + 0 singletons (N/A : N/A)
0 + 0 with mate mapped to a different chr
0 + 0 with mate mapped to a different chr (mapQ>=5)
";

/// Empty BAI: magic, zero references, zero unplaced reads.
pub const EMPTY_BAI: &[u8] = b"BAI\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";

/// BAM holding only `header`, its reference dictionary and no records.
pub fn write_bam(path: &Path, header: &str) -> std::io::Result<()> {
    let header: sam::Header = header.parse().unwrap();
    let mut writer = bam::io::Writer::new(fs::File::create(path)?);
    writer.write_header(&header)?;
    drop(writer);
    Ok(())
}

pub fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

/// Stands in for samtools and Picard: writes a plausible output for each tool label.
#[derive(Default)]
pub struct FakeTools {
    pub calls: Mutex<Vec<String>>,
    /// Tool label that exits 1.
    pub fail: Option<&'static str>,
    /// Tool label that waits for cancellation.
    pub hang: Option<&'static str>,
    /// ValidateSamFile summary; "No errors found" when unset.
    pub validation_report: Option<&'static str>,
    /// Artificial per-call latency.
    pub delay: Option<Duration>,
}

impl FakeTools {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn produce(&self, invocation: &Invocation) -> std::io::Result<()> {
        let stdout_target = invocation
            .stdout_path
            .clone()
            .unwrap_or_else(|| invocation.output.clone());
        match invocation.tool.as_str() {
            "samtools sort" => write_bam(
                &invocation.output,
                "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n",
            ),
            "picard MarkDuplicates" => write_bam(
                &invocation.output,
                "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n\
                 @PG\tID:MarkDuplicates\tPN:MarkDuplicates\tCL:MarkDuplicates I=in.bam\n",
            ),
            "samtools index" => fs::write(&invocation.output, EMPTY_BAI),
            "samtools view" => fs::write(&invocation.output, SAM),
            "samtools flagstat" => fs::write(&stdout_target, FLAGSTAT),
            "picard ValidateSamFile" => fs::write(
                &stdout_target,
                self.validation_report.unwrap_or("No errors found\n"),
            ),
            other => panic!("unexpected tool {}", other),
        }
    }
}

#[async_trait]
impl ToolRunner for FakeTools {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, RunnerError> {
        self.calls.lock().unwrap().push(invocation.tool.clone());
        assert!(invocation.cwd.is_dir(), "stage directory must exist before the tool starts");
        if invocation.tool.starts_with("picard") {
            let tmp_dir = invocation
                .args
                .iter()
                .find_map(|a| a.strip_prefix("TMP_DIR="))
                .unwrap_or_else(|| panic!("{} has no TMP_DIR", invocation.tool));
            assert_eq!(
                Path::new(tmp_dir),
                invocation.cwd,
                "Picard spills outside its stage directory"
            );
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang == Some(invocation.tool.as_str()) {
            let err = tokio::select! {
                _ = cancel.cancelled() => RunnerError::Cancelled,
                _ = tokio::time::sleep(invocation.timeout) => {
                    RunnerError::Timeout(invocation.timeout)
                }
            };
            return Err(err);
        }
        if self.fail == Some(invocation.tool.as_str()) {
            return Ok(ToolOutput {
                code: Some(1),
                stdout: Vec::new(),
                stderr: format!("{}: simulated failure\n", invocation.tool),
            });
        }
        self.produce(invocation).map_err(|e| RunnerError::Io {
            tool: invocation.tool.clone(),
            source: e,
        })?;
        Ok(ToolOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

pub fn orchestrator(
    base: &Path,
    registry: ToolRegistry,
    runner: Arc<dyn ToolRunner>,
) -> Orchestrator {
    let config = RunConfig::with_root(base);
    Orchestrator::new(Arc::new(config), Arc::new(registry), runner)
}

/// Entries left directly under the staging root.
pub fn staging_leftovers(base: &Path) -> usize {
    match fs::read_dir(base.join("staging")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
