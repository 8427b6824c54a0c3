use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::sink::OutputSink;

pub mod ffmpeg;

/// One bounded run of the packager over a single asset.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub reference: String,
    /// Seconds to seek into the asset before playing.
    pub seek: f64,
    /// Upper bound on how many seconds to play.
    pub duration: f64,
    pub overlays: Vec<PathBuf>,
    pub sink: OutputSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeExit {
    pub code: Option<i32>,
}

impl TranscodeExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a running transcode process.
#[async_trait]
pub trait TranscodeProcess: Send {
    /// OS process id, if the process is still running.
    fn id(&self) -> Option<u32>;

    /// Ask the process to finish gracefully.
    async fn interrupt(&mut self) -> Result<()>;

    /// Terminate the process immediately.
    async fn force_kill(&mut self) -> Result<()>;

    /// Wait for the process to exit. Cancel safe, so it can sit in a `select!`.
    async fn join(&mut self) -> Result<TranscodeExit>;
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, request: &TranscodeRequest) -> Result<Box<dyn TranscodeProcess>>;
}

/// Interrupt `process`, wait up to `grace` for it to exit, then kill it.
///
/// Always waits for the process to exit, so nothing else writes the sink afterwards.
pub async fn stop(process: &mut dyn TranscodeProcess, grace: Duration) -> Result<TranscodeExit> {
    let pid = process.id();
    if let Err(e) = process.interrupt().await {
        warn!(pid, error = %e, "failed to interrupt transcode");
    }

    match tokio::time::timeout(grace, process.join()).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!(pid, ?grace, "transcode ignored interrupt, killing it");
            // Even a failed kill must be waited out: the sink has a single writer.
            if let Err(e) = process.force_kill().await {
                error!(pid, error = %e, "failed to kill transcode, waiting for it to exit");
            }
            let exit = process.join().await?;
            info!(pid, code = exit.code, "transcode killed");
            Ok(exit)
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{Error, Result};
    use crate::transcode::{stop, TranscodeExit, TranscodeProcess};

    /// Ignores interrupts, and reports an error from a kill that still lands.
    #[derive(Default)]
    struct Stubborn {
        killed: bool,
        joins: usize,
    }

    #[async_trait]
    impl TranscodeProcess for Stubborn {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn interrupt(&mut self) -> Result<()> {
            Ok(())
        }

        async fn force_kill(&mut self) -> Result<()> {
            self.killed = true;
            Err(Error::Io(std::io::Error::other("signal lost")))
        }

        async fn join(&mut self) -> Result<TranscodeExit> {
            self.joins += 1;
            if !self.killed {
                std::future::pending::<()>().await;
            }
            Ok(TranscodeExit { code: None })
        }
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_failed_kill_still_waits_for_exit() {
        let mut process = Stubborn::default();

        let exit = stop(&mut process, Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, TranscodeExit { code: None });
        assert!(process.killed);
        assert_eq!(process.joins, 2);
    }
}
