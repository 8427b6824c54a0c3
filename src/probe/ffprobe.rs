use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::probe::Probe;

/// [Probe] backed by the `ffprobe` binary.
///
/// Each call spawns one process. A process that outlives `timeout` is killed and the
/// probe reported as failed.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn args(reference: &str) -> Vec<String> {
        vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            reference.to_string(),
        ]
    }
}

/// Parse ffprobe's bare `format=duration` output. `N/A` and garbage yield `None`.
pub(crate) fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|duration| duration.is_finite())
}

#[async_trait]
impl Probe for FfprobeProbe {
    #[instrument(skip(self))]
    async fn duration(&self, reference: &str) -> Result<f64> {
        let failure = |reason: String| Error::ProbeFailure {
            reference: reference.to_string(),
            reason,
        };

        let child = Command::new(&self.binary)
            .args(Self::args(reference))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(format!("spawn {}: {e}", self.binary.display())))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| failure(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| failure(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration = parse_duration(&stdout)
            .ok_or_else(|| failure(format!("unparseable duration {:?}", stdout.trim())))?;

        debug!(duration, "probed asset");
        Ok(duration)
    }
}
