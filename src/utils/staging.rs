// src/utils/staging.rs: per-job workspaces, input materialisation and export

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile, TempDir};
use tokio::task;

use crate::config::defs::{FileFormat, StageError};
use crate::utils::file::{check_structure, checksum};

const INPUTS_DIR: &str = "inputs";
const STAGES_DIR: &str = "stages";

/// A file under the staging manager's control, tagged with its role and format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFile {
    pub role: String,
    pub path: PathBuf,
    pub format: FileFormat,
    pub size: u64,
    pub checksum: String,
}

impl StagedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Isolated temporary directory owned by one job. Removed exactly once: by `close`,
/// or on drop if the job never got that far.
#[derive(Debug)]
pub struct Workspace {
    job_id: String,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.path.join(INPUTS_DIR)
    }

    /// Working directory for one stage, created on demand.
    pub fn stage_dir(&self, index: usize, stage: &str) -> io::Result<PathBuf> {
        let dir = self
            .path
            .join(STAGES_DIR)
            .join(format!("{:02}_{}", index + 1, stage));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// True if `path` lies inside this workspace.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }

    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                debug!("Removing workspace {} of job {}", self.path.display(), self.job_id);
                dir.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            warn!(
                "Workspace {} of job {} dropped without close; removing",
                self.path.display(),
                self.job_id
            );
            if let Err(e) = dir.close() {
                warn!("Failed to remove workspace {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Owns the staging root. The only shared state between jobs is the root's directory
/// namespace, and the lock is held solely while a job's directory is allocated.
#[derive(Debug)]
pub struct StagingManager {
    root: PathBuf,
    alloc_lock: Mutex<()>,
}

impl StagingManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StagingManager {
            root: root.into(),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocates a fresh `<root>/<job_id>-XXXXXX` directory.
    pub fn scoped_workspace(&self, job_id: &str) -> io::Result<Workspace> {
        let dir = {
            let _guard = self
                .alloc_lock
                .lock()
                .map_err(|_| io::Error::other("staging allocation lock poisoned"))?;
            fs::create_dir_all(&self.root)?;
            Builder::new()
                .prefix(&format!("{}-", job_id))
                .tempdir_in(&self.root)?
        };
        fs::create_dir_all(dir.path().join(INPUTS_DIR))?;
        fs::create_dir_all(dir.path().join(STAGES_DIR))?;
        let path = dir.path().to_path_buf();
        debug!("Allocated workspace {} for job {}", path.display(), job_id);
        Ok(Workspace {
            job_id: job_id.to_string(),
            path,
            dir: Some(dir),
        })
    }

    /// Materialises one job input into the workspace and verifies it.
    ///
    /// # Arguments
    ///
    /// * `workspace` - Job workspace.
    /// * `role` - Logical role, e.g. "aligned-reads".
    /// * `location` - Absolute source path.
    /// * `format` - Declared format, checked structurally.
    ///
    /// # Returns
    /// StagedFile inside the workspace.
    pub async fn stage_in(
        &self,
        workspace: &Workspace,
        role: &str,
        location: &Path,
        format: FileFormat,
    ) -> Result<StagedFile, StageError> {
        if !location.is_file() {
            return Err(StageError::InvalidInput(format!(
                "input '{}' not found at {}",
                role,
                location.display()
            )));
        }
        let name = location
            .file_name()
            .ok_or_else(|| StageError::InvalidInput(format!("input '{}' has no file name", role)))?;
        if name.to_str().is_none() {
            return Err(StageError::InvalidInput(format!(
                "input '{}' file name is not valid UTF-8: {}",
                role,
                location.display()
            )));
        }
        let target = workspace.inputs_dir().join(name);

        let source = location.to_path_buf();
        let dest = target.clone();
        task::spawn_blocking(move || materialise(&source, &dest))
            .await
            .map_err(|e| StageError::StagingIo(e.to_string()))?
            .map_err(|e| {
                StageError::StagingIo(format!("failed to stage {}: {}", location.display(), e))
            })?;

        let staged = seal_blocking(role, &target, format).await.map_err(|err| match err {
            SealError::Structure(reason) => StageError::StagingCorruptInput {
                path: location.to_path_buf(),
                reason,
            },
            SealError::Io(e) => StageError::StagingIo(e.to_string()),
        })?;
        info!("Staged {} ({}, {} bytes) as '{}'", location.display(), format, staged.size, role);
        Ok(staged)
    }

    /// Wraps a freshly produced tool output. Structural failures are reported as
    /// `ToolOutputInvalid` for `tool`.
    pub async fn seal(
        &self,
        tool: &str,
        role: &str,
        path: &Path,
        format: FileFormat,
    ) -> Result<StagedFile, StageError> {
        seal_blocking(role, path, format).await.map_err(|err| match err {
            SealError::Structure(reason) => StageError::ToolOutputInvalid {
                tool: tool.to_string(),
                reason,
            },
            SealError::Io(e) => StageError::StagingIo(e.to_string()),
        })
    }

    /// Exports a staged file to `destination` (a directory), verifying the copy.
    ///
    /// # Returns
    /// Path of the exported file.
    pub async fn stage_out(
        &self,
        file: &StagedFile,
        destination: &Path,
    ) -> Result<PathBuf, StageError> {
        let source = file.path.clone();
        let dest_dir = destination.to_path_buf();
        let expected = file.checksum.clone();
        let name = file.file_name();

        let exported = task::spawn_blocking(move || export(&source, &dest_dir, &name, &expected))
            .await
            .map_err(|e| StageError::StagingIo(e.to_string()))?
            .map_err(|e| {
                StageError::StagingIo(format!("failed to export {}: {}", file.path.display(), e))
            })?;
        info!("Exported {} to {}", file.role, exported.display());
        Ok(exported)
    }
}

enum SealError {
    Structure(String),
    Io(io::Error),
}

async fn seal_blocking(
    role: &str,
    path: &Path,
    format: FileFormat,
) -> Result<StagedFile, SealError> {
    let role = role.to_string();
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        check_structure(&path, format).map_err(SealError::Structure)?;
        let size = fs::metadata(&path).map_err(SealError::Io)?.len();
        let checksum = checksum(&path).map_err(SealError::Io)?;
        Ok(StagedFile {
            role,
            path,
            format,
            size,
            checksum,
        })
    })
    .await
    .map_err(|e| SealError::Io(io::Error::other(e.to_string())))?
}

/// Hard link where possible so large inputs are not duplicated; copy otherwise.
fn materialise(source: &Path, dest: &Path) -> io::Result<()> {
    if dest.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} staged twice", dest.display()),
        ));
    }
    if fs::hard_link(source, dest).is_err() {
        fs::copy(source, dest)?;
    }
    Ok(())
}

fn export(source: &Path, dest_dir: &Path, name: &str, expected: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let mut tmp = NamedTempFile::new_in(dest_dir)?;
    {
        let mut reader = fs::File::open(source)?;
        io::copy(&mut reader, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
    }
    let copied = checksum(tmp.path())?;
    if copied != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("checksum mismatch after copy ({} != {})", copied, expected),
        ));
    }
    let target = dest_dir.join(name);
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    const SAM: &[u8] = b"@HD\tVN:1.6\tSO:unsorted\nr1\t0\tchr1\t1\t60\t4M\t*\t0\t0\tACGT\tIIII\n";

    #[test]
    fn test_workspace_removed_on_close() {
        let root = tempdir().unwrap();
        let manager = StagingManager::new(root.path().join("staging"));
        let ws = manager.scoped_workspace("job1").unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.join(INPUTS_DIR).is_dir());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("job1-"));
        ws.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempdir().unwrap();
        let manager = StagingManager::new(root.path());
        let path = {
            let ws = manager.scoped_workspace("job2").unwrap();
            fs::write(ws.stage_dir(0, "sort_bam").unwrap().join("x.bam"), b"x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let root = tempdir().unwrap();
        let manager = Arc::new(StagingManager::new(root.path()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.scoped_workspace("same-id").unwrap())
            })
            .collect();
        let workspaces: Vec<Workspace> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let paths: HashSet<PathBuf> = workspaces.iter().map(|w| w.path().to_path_buf()).collect();
        assert_eq!(paths.len(), 16);
        for ws in workspaces {
            ws.close().unwrap();
        }
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stage_in_valid_and_corrupt() {
        let root = tempdir().unwrap();
        let data = tempdir().unwrap();
        let manager = StagingManager::new(root.path());
        let ws = manager.scoped_workspace("job3").unwrap();

        let good = data.path().join("reads.sam");
        fs::write(&good, SAM).unwrap();
        let staged = manager.stage_in(&ws, "aligned-reads", &good, FileFormat::Sam).await.unwrap();
        assert!(ws.contains(&staged.path));
        assert_eq!(staged.size, SAM.len() as u64);
        assert_eq!(staged.role, "aligned-reads");

        let empty = data.path().join("empty.sam");
        fs::write(&empty, b"").unwrap();
        let err = manager
            .stage_in(&ws, "aligned-reads", &empty, FileFormat::Sam)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::StagingCorruptInput { .. }));

        let missing = data.path().join("nope.sam");
        let err = manager
            .stage_in(&ws, "aligned-reads", &missing, FileFormat::Sam)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));

        ws.close().unwrap();
        assert!(good.exists(), "staging must never touch the caller's file");
    }

    #[tokio::test]
    async fn test_stage_out_round_trip() {
        let root = tempdir().unwrap();
        let data = tempdir().unwrap();
        let manager = StagingManager::new(root.path().join("staging"));
        let ws = manager.scoped_workspace("job4").unwrap();

        let src = data.path().join("reads.sam");
        fs::write(&src, SAM).unwrap();
        let staged = manager.stage_in(&ws, "aligned-reads", &src, FileFormat::Sam).await.unwrap();

        let dest = root.path().join("export");
        let exported = manager.stage_out(&staged, &dest).await.unwrap();
        ws.close().unwrap();

        assert_eq!(exported, dest.join("reads.sam"));
        assert_eq!(fs::read(&exported).unwrap(), SAM);
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_stage_out_failures_are_staging_io() {
        let root = tempdir().unwrap();
        let data = tempdir().unwrap();
        let manager = StagingManager::new(root.path().join("staging"));
        let ws = manager.scoped_workspace("job6").unwrap();
        let src = data.path().join("reads.sam");
        fs::write(&src, SAM).unwrap();
        let staged = manager.stage_in(&ws, "aligned-reads", &src, FileFormat::Sam).await.unwrap();

        let not_a_dir = root.path().join("export-file");
        fs::write(&not_a_dir, b"occupied").unwrap();
        let err = manager.stage_out(&staged, &not_a_dir).await.unwrap_err();
        assert!(matches!(err, StageError::StagingIo(_)));

        let tampered = StagedFile {
            checksum: "0".repeat(16),
            ..staged.clone()
        };
        let dest = root.path().join("export");
        let err = manager.stage_out(&tampered, &dest).await.unwrap_err();
        match err {
            StageError::StagingIo(reason) => assert!(reason.contains("checksum mismatch")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
        ws.close().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stage_in_rejects_non_utf8_name() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = tempdir().unwrap();
        let data = tempdir().unwrap();
        let manager = StagingManager::new(root.path());
        let ws = manager.scoped_workspace("job7").unwrap();
        let src = data.path().join(OsStr::from_bytes(b"reads\xff.sam"));
        fs::write(&src, SAM).unwrap();

        let err = manager.stage_in(&ws, "aligned-reads", &src, FileFormat::Sam).await.unwrap_err();
        match err {
            StageError::InvalidInput(reason) => assert!(reason.contains("not valid UTF-8")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_dir(ws.inputs_dir()).unwrap().count(), 0);
        ws.close().unwrap();
    }

    #[tokio::test]
    async fn test_seal_reports_tool_output_invalid() {
        let root = tempdir().unwrap();
        let manager = StagingManager::new(root.path());
        let ws = manager.scoped_workspace("job5").unwrap();
        let out = ws.stage_dir(0, "index_bam").unwrap().join("x.bai");
        fs::write(&out, b"").unwrap();
        let err = manager
            .seal("samtools index", "alignment-index", &out, FileFormat::Bai)
            .await
            .unwrap_err();
        match err {
            StageError::ToolOutputInvalid { tool, reason } => {
                assert_eq!(tool, "samtools index");
                assert_eq!(reason, "file is empty");
            }
            other => panic!("unexpected error: {other}"),
        }
        ws.close().unwrap();
    }
}
