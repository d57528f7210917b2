use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use noodles::bam;
use noodles::bam::bai;
use noodles::sam;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::header::record::value::map::program::tag as program_tag;
use regex::Regex;
use xxhash_rust::xxh3::Xxh3;

use crate::config::defs::{
    FileFormat, PicardSubcommand, BAM_EXT, GZIP_MAGIC, SAM_EXT, SAM_REQUIRED_FIELDS,
};

const FLAGSTAT_FIRST_LINE: &str = r"^\d+ \+ \d+ ";

const SAM_SNIFF_BYTES: u64 = 64 * 1024;
const CHECKSUM_BUFFER: usize = 1 << 20;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    let mut read = 0;
    while read < buffer.len() {
        let n = file.read(&mut buffer[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(buffer == GZIP_MAGIC)
}

/// Resolves a caller-supplied path against the working directory.
pub fn resolve_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Name for a tool output derived from the file it was produced from:
/// `sample.sam` -> `sample.bam`, `sample.bam` -> `sample.bai`.
///
/// # Arguments
///
/// * `input` - Path of the consumed input.
/// * `format` - Format of the produced output.
///
/// # Returns
/// File name (no directory).
pub fn derive_output_name(input: &Path, format: FileFormat) -> String {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());

    let base = [SAM_EXT, BAM_EXT]
        .iter()
        .find_map(|ext| {
            let suffix = format!(".{}", ext);
            name.strip_suffix(suffix.as_str()).map(|s| s.to_string())
        })
        .unwrap_or(name);

    format!("{}.{}", base, format.extension())
}

/// Streaming xxh3-64 digest of a file, lower-case hex.
pub fn checksum(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(CHECKSUM_BUFFER, File::open(path)?);
    let mut hasher = Xxh3::new();
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(chunk);
        let len = chunk.len();
        reader.consume(len);
    }
    Ok(format!("{:016x}", hasher.digest()))
}

/// Reads the complete header of a BAM file: SAM header text and reference dictionary.
/// Alignment records are never decoded.
pub fn read_bam_header(path: &Path) -> Result<sam::Header, String> {
    if !is_gzipped(path).map_err(|e| e.to_string())? {
        return Err("not BGZF compressed".to_string());
    }
    let mut reader = bam::io::reader::Builder::default()
        .build_from_path(path)
        .map_err(|e| e.to_string())?;
    reader
        .read_header()
        .map_err(|e| format!("unreadable BAM header: {}", e))
}

pub fn is_coordinate_sorted(header: &sam::Header) -> bool {
    header
        .header()
        .and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER))
        .map(|order| {
            let order: &[u8] = order.as_ref();
            order == b"coordinate"
        })
        .unwrap_or(false)
}

/// True if any @PG record was written by Picard MarkDuplicates or `samtools markdup`.
pub fn has_duplicate_marking_record(header: &sam::Header) -> bool {
    header.programs().as_ref().iter().any(|(id, program)| {
        let fields = program.other_fields();
        let name = fields
            .get(&program_tag::NAME)
            .map(|v| String::from_utf8_lossy(v.as_ref()).into_owned())
            .unwrap_or_default();
        let command_line = fields
            .get(&program_tag::COMMAND_LINE)
            .map(|v| String::from_utf8_lossy(v.as_ref()).into_owned())
            .unwrap_or_default();
        is_duplicate_marker(&String::from_utf8_lossy(id.as_ref()), &name, &command_line)
    })
}

// Picard uses ID/PN MarkDuplicates, with a `.N` suffix on ID clashes. samtools
// records PN:samtools and the subcommand only in CL.
fn is_duplicate_marker(id: &str, name: &str, command_line: &str) -> bool {
    let picard = PicardSubcommand::MarkDuplicates.as_str();
    if id.split('.').next() == Some(picard) || name == picard {
        return true;
    }
    name == "samtools" && command_line.split_whitespace().nth(1) == Some("markdup")
}

fn check_sam(path: &Path) -> Result<(), String> {
    if is_gzipped(path).map_err(|e| e.to_string())? {
        return Err("compressed data where SAM text was expected".to_string());
    }
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut head = Vec::new();
    file.take(SAM_SNIFF_BYTES)
        .read_to_end(&mut head)
        .map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&head);

    let first = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| "no SAM content".to_string())?;

    if let Some(tag) = first.strip_prefix('@') {
        let code: String = tag.chars().take(2).collect();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(());
        }
        return Err(format!("malformed SAM header line: {}", truncate(first)));
    }

    let fields = first.split('\t').count();
    if fields < SAM_REQUIRED_FIELDS {
        return Err(format!(
            "SAM record has {} fields, expected at least {}",
            fields, SAM_REQUIRED_FIELDS
        ));
    }
    Ok(())
}

fn check_bai(path: &Path) -> Result<(), String> {
    bai::fs::read(path)
        .map(|_| ())
        .map_err(|e| format!("unreadable BAI index: {}", e))
}

fn check_flagstat(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(|e| e.to_string())?;
    let counts = Regex::new(FLAGSTAT_FIRST_LINE).map_err(|e| format!("Regex error: {}", e))?;
    if !counts.is_match(&first) {
        return Err(format!("unexpected flagstat line: {}", truncate(first.trim_end())));
    }
    Ok(())
}

/// Structural check of a file against its declared format. Headers and indexes are
/// parsed; alignment records are not.
///
/// # Returns
/// Err with a human readable reason on mismatch.
pub fn check_structure(path: &Path, format: FileFormat) -> Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("cannot stat: {}", e))?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.len() == 0 {
        return Err("file is empty".to_string());
    }

    match format {
        FileFormat::Sam => check_sam(path),
        FileFormat::Bam => read_bam_header(path).map(|_| ()),
        FileFormat::MarkedBam => {
            let header = read_bam_header(path)?;
            if has_duplicate_marking_record(&header) {
                Ok(())
            } else {
                Err("BAM header has no duplicate-marking @PG record".to_string())
            }
        }
        FileFormat::Bai => check_bai(path),
        FileFormat::Flagstat => check_flagstat(path),
        FileFormat::ValidationReport => Ok(()),
    }
}

fn truncate(line: &str) -> String {
    line.chars().take(80).collect()
}
