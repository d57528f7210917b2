use anyhow::{anyhow, Result};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};


/// Read counts extracted from `samtools flagstat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentStats {
    pub total_reads: u64,
    pub mapped_reads: u64,
    pub unmapped_reads: u64,
    pub properly_paired: u64,
    pub singletons: u64,
    pub multiple_alignments: u64,
    pub alignment_rate: f64,
}

/// Parses flagstat text output by line label rather than line position, so both the
/// older 13-line and the newer 16-line layouts are accepted.
///
/// # Arguments
///
/// * `text` - Full stdout of `samtools flagstat`.
///
/// # Returns
/// AlignmentStats
pub fn parse_flagstat(text: &str) -> Result<AlignmentStats> {
    let mut total: Option<u64> = None;
    let mut mapped: Option<u64> = None;
    let mut properly_paired = 0u64;
    let mut singletons = 0u64;

    let two_nums = Regex::new(r"^(\d+) \+ (\d+) (.+)$")?;
    for line in text.lines() {
        let Some(caps) = two_nums.captures(line.trim_end()) else {
            continue;
        };
        let passed: u64 = caps[1].parse()?;
        let failed: u64 = caps[2].parse()?;
        let label = &caps[3];

        if label.starts_with("in total") {
            total = Some(passed + failed);
        } else if label.starts_with("mapped") && mapped.is_none() {
            mapped = Some(passed);
        } else if label.starts_with("properly paired") {
            properly_paired = passed;
        } else if label.starts_with("singletons") {
            singletons = passed;
        }
    }

    let total_reads = total.ok_or_else(|| anyhow!("flagstat output has no 'in total' line"))?;
    let mapped_reads = mapped.ok_or_else(|| anyhow!("flagstat output has no 'mapped' line"))?;

    let alignment_rate = if total_reads == 0 {
        warn!("Alignment stats don't look right: total reads = 0. Setting alignment rate to 0.");
        0.0
    } else {
        (mapped_reads as f64 / total_reads as f64 * 100.0).min(100.0)
    };

    Ok(AlignmentStats {
        total_reads,
        mapped_reads,
        unmapped_reads: total_reads.saturating_sub(mapped_reads),
        properly_paired,
        singletons,
        multiple_alignments: 0,
        alignment_rate,
    })
}

/// Errors listed in a ValidateSamFile SUMMARY report that are not in `ignore`.
/// A Java exception anywhere in the report counts as an error.
///
/// # Returns
/// Distinct error codes in report order; empty means the file passed.
pub fn validation_errors(report: &str, ignore: &[String]) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();
    if report.contains("Exception") {
        errors.push("EXCEPTION".to_string());
    }
    for rest in report.split("ERROR:").skip(1) {
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let code = &rest[..end];
        if code.is_empty() {
            continue;
        }
        if ignore.iter().any(|i| i == code) || errors.iter().any(|e| e == code) {
            continue;
        }
        errors.push(code.to_string());
    }
    errors
}
