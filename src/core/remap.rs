use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("cannot run remap command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("remap command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("remap command produced no output file")]
    MissingOutput,
    #[error("remap command did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Upper bound for one remap run
const REMAP_TIMEOUT: Duration = Duration::from_secs(600);

/// Rewrites feature identifiers in an uploaded expression file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeatureRemapper: Send + Sync {
    /// Remap `path` in place
    async fn remap(&self, path: &Path) -> Result<(), RemapError>;
}

/// Runs `<program> <gene_map> <input> <output>` and swaps the output in
pub struct CommandRemapper {
    command: String,
    gene_map: PathBuf,
    timeout: Duration,
}

impl CommandRemapper {
    pub fn new(command: impl Into<String>, gene_map: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            gene_map: gene_map.into(),
            timeout: REMAP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FeatureRemapper for CommandRemapper {
    async fn remap(&self, path: &Path) -> Result<(), RemapError> {
        let output = path.with_extension("remapped.h5ad");
        debug!("Remapping {} with {}", path.display(), self.command);

        // kill_on_drop stops the child when the timeout drops the future
        let run = Command::new(&self.command)
            .arg(&self.gene_map)
            .arg(path)
            .arg(&output)
            .kill_on_drop(true)
            .output();
        let result = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&output).await;
                return Err(RemapError::TimedOut(self.timeout));
            }
        };

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(RemapError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(RemapError::MissingOutput);
        }

        tokio::fs::rename(&output, path).await?;
        info!("Remapped feature names in {}", path.display());
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_command_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.h5ad");
        tokio::fs::write(&input, b"original").await.unwrap();

        let remapper = CommandRemapper::new("false", dir.path().join("map.csv"));
        let err = remapper.remap(&input).await.unwrap_err();
        assert!(matches!(err, RemapError::Failed { .. }));
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_command_output_replaces_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.h5ad");
        tokio::fs::write(&input, b"original").await.unwrap();
        let map = dir.path().join("map.csv");
        tokio::fs::write(&map, b"remapped").await.unwrap();

        let script = dir.path().join("remap.sh");
        tokio::fs::write(&script, "#!/bin/sh\ncat \"$1\" > \"$3\"\n").await.unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let remapper = CommandRemapper::new(script.display().to_string(), &map);
        remapper.remap(&input).await.unwrap();
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"remapped");
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.h5ad");
        tokio::fs::write(&input, b"original").await.unwrap();

        let script = dir.path().join("hang.sh");
        tokio::fs::write(&script, "#!/bin/sh\nsleep 30\n").await.unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let remapper = CommandRemapper::new(script.display().to_string(), "map.csv")
            .with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = remapper.remap(&input).await.unwrap_err();
        assert!(matches!(err, RemapError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.h5ad");
        tokio::fs::write(&input, b"original").await.unwrap();
        let remapper = CommandRemapper::new("/nonexistent/remap-tool", "map.csv");
        assert!(matches!(remapper.remap(&input).await, Err(RemapError::Spawn(_))));
    }
}
