use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;

/// The directory a transcode writes its rolling HLS output into.
///
/// The output server only ever reads from it. Only the scheduler writes to or clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSink {
    directory: PathBuf,
    manifest: String,
}

impl OutputSink {
    pub fn new(directory: impl AsRef<Path>, manifest: impl Into<String>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            manifest: manifest.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(&self.manifest)
    }

    /// printf-style pattern for segment files, numbered by the packager.
    pub fn segment_pattern(&self) -> PathBuf {
        self.directory.join("segment_%05d.ts")
    }

    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    /// Remove every file in the sink, keeping the directory itself. Returns how many
    /// files were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                debug!(path = %entry.path().display(), "removing output file");
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }

        info!(removed, directory = %self.directory.display(), "cleared output sink");
        Ok(removed)
    }
}
