use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::probe::Probe;
use crate::schedule::ShowId;

/// File extensions picked up when a show's source is a directory.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "ts", "webm", "avi", "m4v", "flv"];

/// A show as configured in the channel file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Show {
    #[serde(skip)]
    pub id: ShowId,
    /// Either a playlist file (one reference per line) or a directory of media files.
    pub source: PathBuf,
    /// Images composited over the video, in placement order.
    #[serde(default)]
    pub overlays: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub reference: String,
    /// Probed duration in seconds, always > 0.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub show: ShowId,
    pub assets: Vec<Asset>,
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Asset> {
        self.assets.get(index)
    }

    pub fn total_duration(&self) -> f64 {
        self.assets.iter().map(|asset| asset.duration).sum()
    }
}

/// Resolves shows to playlists of probed assets.
pub struct PlaylistLoader {
    shows: HashMap<ShowId, Show>,
    probe: Arc<dyn Probe>,
}

impl PlaylistLoader {
    pub fn new(shows: impl IntoIterator<Item = Show>, probe: Arc<dyn Probe>) -> Self {
        let shows = shows
            .into_iter()
            .map(|show| (show.id.clone(), show))
            .collect();

        Self { shows, probe }
    }

    pub fn show(&self, id: &str) -> Option<&Show> {
        self.shows.get(id)
    }

    /// Load the playlist of `show`, probing every asset once.
    ///
    /// Assets whose probe fails or reports a non-positive duration are dropped. A show
    /// with nothing left to play is [Error::PlaylistUnavailable].
    #[instrument(skip(self))]
    pub async fn load(&self, show: &str) -> Result<Playlist> {
        let unavailable = |reason: String| Error::PlaylistUnavailable {
            show: show.to_string(),
            reason,
        };

        let config = self
            .shows
            .get(show)
            .ok_or_else(|| unavailable("show is not configured".to_string()))?;

        let references = read_references(&config.source)
            .await
            .map_err(|e| unavailable(format!("{}: {e}", config.source.display())))?;
        if references.is_empty() {
            return Err(unavailable("source lists no assets".to_string()));
        }

        let mut assets = Vec::with_capacity(references.len());
        for reference in references {
            match self.probe.duration(&reference).await {
                Ok(duration) if duration > 0.0 => assets.push(Asset {
                    reference,
                    duration,
                }),
                Ok(duration) => {
                    warn!(reference = %reference, duration, "skipping asset without a playable duration")
                }
                Err(e) => warn!(error = %e, "skipping asset that failed to probe"),
            }
        }

        if assets.is_empty() {
            return Err(unavailable("no asset could be probed".to_string()));
        }

        let playlist = Playlist {
            show: show.to_string(),
            assets,
        };
        info!(
            assets = playlist.len(),
            total_secs = playlist.total_duration(),
            "loaded playlist"
        );

        Ok(playlist)
    }
}

async fn read_references(source: &Path) -> Result<Vec<String>> {
    let metadata = tokio::fs::metadata(source).await?;

    if metadata.is_dir() {
        let dir = source.to_path_buf();
        return tokio::task::spawn_blocking(move || list_directory(&dir))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    }

    let text = tokio::fs::read_to_string(source).await?;
    let base = source.parent().unwrap_or_else(|| Path::new(""));
    Ok(parse_playlist(&text, base))
}

fn list_directory(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_media = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_media {
            files.push(entry.path().to_string_lossy().into_owned());
        }
    }

    Ok(files)
}

/// Parse a playlist file. Blank lines and `#` lines (M3U tags included) are skipped;
/// relative paths are taken relative to the playlist file.
fn parse_playlist(text: &str, base: &Path) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let path = Path::new(line);
            if line.contains("://") || path.is_absolute() {
                line.to_string()
            } else {
                base.join(path).to_string_lossy().into_owned()
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::error::{Error, Result};
    use crate::playlist::{parse_playlist, PlaylistLoader, Show};
    use crate::probe::Probe;

    /// Probe answering from a fixed table and counting calls.
    struct TableProbe {
        durations: HashMap<String, f64>,
        calls: Mutex<Vec<String>>,
    }

    impl TableProbe {
        fn new(durations: &[(&str, f64)]) -> Self {
            Self {
                durations: durations
                    .iter()
                    .map(|(name, duration)| (name.to_string(), *duration))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Probe for TableProbe {
        async fn duration(&self, reference: &str) -> Result<f64> {
            self.calls.lock().unwrap().push(reference.to_string());

            let name = Path::new(reference)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.durations
                .get(&name)
                .copied()
                .ok_or_else(|| Error::ProbeFailure {
                    reference: reference.to_string(),
                    reason: "not in table".to_string(),
                })
        }
    }

    fn show(id: &str, source: PathBuf) -> Show {
        Show {
            id: id.to_string(),
            source,
            overlays: Vec::new(),
        }
    }

    #[test]
    pub fn test_parse_playlist() {
        let text = "#EXTM3U\n#EXTINF:-1,Pilot\nepisode1.mp4\n\n  /abs/episode2.mp4 \nhttps://cdn.example/ep3.mp4\n";
        assert_eq!(
            parse_playlist(text, Path::new("/shows/pokemon")),
            vec![
                "/shows/pokemon/episode1.mp4".to_string(),
                "/abs/episode2.mp4".to_string(),
                "https://cdn.example/ep3.mp4".to_string(),
            ]
        );
    }

    #[tokio::test]
    pub async fn test_load_playlist_file_skips_failed_probes() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("morning.m3u");
        std::fs::write(&list, "ep1.mp4\nbroken.mp4\nzero.mp4\nep2.mp4\n").unwrap();

        let probe = Arc::new(TableProbe::new(&[
            ("ep1.mp4", 1200.0),
            ("zero.mp4", 0.0),
            ("ep2.mp4", 1300.5),
        ]));
        let loader = PlaylistLoader::new([show("morning", list)], probe.clone());

        let playlist = loader.load("morning").await.unwrap();
        let names: Vec<_> = playlist
            .assets
            .iter()
            .map(|asset| Path::new(&asset.reference).file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["ep1.mp4", "ep2.mp4"]);
        assert_eq!(playlist.total_duration(), 2500.5);

        // every reference probed exactly once
        assert_eq!(probe.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    pub async fn test_load_directory_sorted_media_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mkv", "a.mp4", "notes.txt", "c.MOV"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let probe = Arc::new(TableProbe::new(&[
            ("a.mp4", 10.0),
            ("b.mkv", 20.0),
            ("c.MOV", 30.0),
        ]));
        let loader = PlaylistLoader::new([show("uploads", dir.path().to_path_buf())], probe);

        let playlist = loader.load("uploads").await.unwrap();
        let durations: Vec<f64> = playlist.assets.iter().map(|asset| asset.duration).collect();
        assert_eq!(durations, vec![10.0, 20.0, 30.0]);
    }

    #[tokio::test]
    pub async fn test_all_probes_failing_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        std::fs::write(&list, "x.mp4\ny.mp4\n").unwrap();

        let loader = PlaylistLoader::new([show("dead", list)], Arc::new(TableProbe::new(&[])));
        assert!(matches!(
            loader.load("dead").await,
            Err(Error::PlaylistUnavailable { show, .. }) if show == "dead"
        ));
    }

    #[tokio::test]
    pub async fn test_missing_source_or_show_is_unavailable() {
        let loader = PlaylistLoader::new(
            [show("gone", PathBuf::from("/nonexistent/playlist.m3u"))],
            Arc::new(TableProbe::new(&[])),
        );

        assert!(matches!(
            loader.load("gone").await,
            Err(Error::PlaylistUnavailable { .. })
        ));
        assert!(matches!(
            loader.load("unknown").await,
            Err(Error::PlaylistUnavailable { .. })
        ));
    }
}
