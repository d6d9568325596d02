//! External archive tool driver and path containment checks.
//!
//! The tool is invoked with the 7-Zip command shapes:
//!
//! ```text
//! <program> x <archive> -o<dir> -aos
//! <program> a -t<format> -m0=<method> <archive> <source>
//! ```
//!
//! Exit code 0 is success. Every path handed to the tool must first pass
//! [`safe_resolve`] against the store's base directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use ember_core::constants::{
    DEFAULT_ARCHIVE_FORMAT, DEFAULT_ARCHIVE_METHOD, DEFAULT_ARCHIVE_TOOL,
    DEFAULT_COMPRESS_TIMEOUT_SECS, DEFAULT_DECOMPRESS_TIMEOUT_SECS,
};
use ember_core::{ArchiveError, EmberResult, PersistenceConfig, ValidationError};
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTool {
    pub program: String,
    pub format: String,
    pub method: String,
    pub decompress_timeout: Duration,
    pub compress_timeout: Duration,
}

impl Default for ArchiveTool {
    fn default() -> Self {
        Self {
            program: DEFAULT_ARCHIVE_TOOL.to_string(),
            format: DEFAULT_ARCHIVE_FORMAT.to_string(),
            method: DEFAULT_ARCHIVE_METHOD.to_string(),
            decompress_timeout: Duration::from_secs(DEFAULT_DECOMPRESS_TIMEOUT_SECS),
            compress_timeout: Duration::from_secs(DEFAULT_COMPRESS_TIMEOUT_SECS),
        }
    }
}

impl From<&PersistenceConfig> for ArchiveTool {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            program: config.archive_tool.clone(),
            format: config.archive_format.clone(),
            method: config.archive_method.clone(),
            decompress_timeout: config.decompress_timeout,
            compress_timeout: config.compress_timeout,
        }
    }
}

impl ArchiveTool {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_decompress_timeout(mut self, timeout: Duration) -> Self {
        self.decompress_timeout = timeout;
        self
    }

    /// Extract `archive` into `out_dir`, never overwriting existing files.
    pub async fn extract(&self, archive: &Path, out_dir: &Path) -> EmberResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("x")
            .arg(archive)
            .arg(format!("-o{}", out_dir.display()))
            .arg("-aos");
        self.run(cmd, archive, self.decompress_timeout).await
    }

    /// Add `source` to `archive`.
    pub async fn compress(&self, archive: &Path, source: &Path) -> EmberResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("a")
            .arg(format!("-t{}", self.format))
            .arg(format!("-m0={}", self.method))
            .arg(archive)
            .arg(source);
        self.run(cmd, archive, self.compress_timeout).await
    }

    async fn run(&self, mut cmd: Command, target: &Path, timeout: Duration) -> EmberResult<()> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ArchiveError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ArchiveError::Io {
                path: target.to_path_buf(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                tracing::error!(
                    program = %self.program,
                    path = %target.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Archive tool timed out, process killed"
                );
                return Err(ArchiveError::Timeout {
                    path: target.to_path_buf(),
                    timeout,
                }
                .into());
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(
                program = %self.program,
                path = %target.display(),
                code = ?output.status.code(),
                stderr = %stderr,
                "Archive tool failed"
            );
            Err(ArchiveError::ToolFailed {
                path: target.to_path_buf(),
                code: output.status.code(),
                stderr,
            }
            .into())
        }
    }
}

/// Resolve `target` and require it to be a strict descendant of `base`.
///
/// Symlinks are followed. A target that does not exist yet is resolved
/// through its parent directory.
pub fn safe_resolve(base: &Path, target: &Path) -> EmberResult<PathBuf> {
    let base_resolved = base.canonicalize().map_err(|e| ArchiveError::Io {
        path: base.to_path_buf(),
        reason: e.to_string(),
    })?;

    let traversal = || ValidationError::PathTraversal {
        path: target.to_path_buf(),
        base: base_resolved.clone(),
    };

    let resolved = if target.exists() {
        target.canonicalize().map_err(|e| ArchiveError::Io {
            path: target.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        let name = target.file_name().ok_or_else(traversal)?;
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let parent = parent.canonicalize().map_err(|_| traversal())?;
        parent.join(name)
    };

    if resolved != base_resolved && resolved.starts_with(&base_resolved) {
        Ok(resolved)
    } else {
        tracing::error!(
            path = %target.display(),
            base = %base_resolved.display(),
            "Rejected path outside managed directory"
        );
        Err(traversal().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::EmberError;

    #[test]
    fn test_safe_resolve_accepts_child() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("log_202401.db");
        std::fs::write(&file, b"x").unwrap();

        let resolved = safe_resolve(dir.path(), &file).unwrap();
        assert_eq!(resolved, file.canonicalize().unwrap());
    }

    #[test]
    fn test_safe_resolve_accepts_missing_child() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("log_202401.7z");
        let resolved = safe_resolve(dir.path(), &file).unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap().join("log_202401.7z"));
    }

    #[test]
    fn test_safe_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("log");
        std::fs::create_dir_all(&base).unwrap();

        let escape = base.join("..").join("secrets.db");
        let err = safe_resolve(&base, &escape).unwrap_err();
        assert!(matches!(
            err,
            EmberError::Validation(ValidationError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_safe_resolve_rejects_base_itself() {
        let dir = tempfile::tempdir().unwrap();
        let err = safe_resolve(dir.path(), dir.path()).unwrap_err();
        assert!(matches!(err, EmberError::Validation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_safe_resolve_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("log");
        std::fs::create_dir_all(&base).unwrap();
        let outside = dir.path().join("outside.db");
        std::fs::write(&outside, b"x").unwrap();
        let link = base.join("link.db");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        assert!(safe_resolve(&base, &link).is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ArchiveTool::default().with_program("ember-no-such-archiver");
        let err = tool
            .extract(&dir.path().join("a.7z"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::Archive(ArchiveError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compress_then_extract_with_scripted_tool() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install(dir.path()).unwrap();
        let tool = ArchiveTool::default().with_program(fake.program_str());

        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let source = data.join("log_202401.db");
        let archive = data.join("log_202401.7z");
        std::fs::write(&source, b"payload").unwrap();

        tool.compress(&archive, &source).await.unwrap();
        std::fs::remove_file(&source).unwrap();
        tool.extract(&archive, &data).await.unwrap();

        assert_eq!(std::fs::read(&source).unwrap(), b"payload");
        assert_eq!(fake.invocations("a"), 1);
        assert_eq!(fake.invocations("x"), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failed() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install_failing(dir.path(), 2).unwrap();
        let tool = ArchiveTool::default().with_program(fake.program_str());

        let err = tool
            .extract(&dir.path().join("a.7z"), dir.path())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        match err {
            EmberError::Archive(ArchiveError::ToolFailed { code, .. }) => {
                assert_eq!(code, Some(2))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_tool() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install_slow(dir.path(), 30).unwrap();
        let tool = ArchiveTool::default()
            .with_program(fake.program_str())
            .with_decompress_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = tool
            .extract(&dir.path().join("a.7z"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::Archive(ArchiveError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
