use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::transcode::{TranscodeExit, TranscodeProcess, TranscodeRequest, Transcoder};

/// Logos are scaled to this height before being composited.
const OVERLAY_HEIGHT: u32 = 60;
const OVERLAY_MARGIN: u32 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FfmpegSettings {
    pub binary: PathBuf,
    /// Read input at native frame rate, so wall time tracks media time.
    pub realtime: bool,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    /// Target HLS segment length in seconds.
    pub segment_seconds: u32,
    /// Number of segments kept in the live manifest.
    pub list_size: u32,
    pub extra_output_args: Vec<String>,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            realtime: true,
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            audio_codec: "aac".to_string(),
            segment_seconds: 6,
            list_size: 10,
            extra_output_args: Vec::new(),
        }
    }
}

/// [Transcoder] that runs `ffmpeg` and packages its output as HLS in the sink.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    settings: FfmpegSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, request: &TranscodeRequest) -> Vec<String> {
        let settings = &self.settings;
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-y"]
            .into_iter()
            .map(String::from)
            .collect();

        if settings.realtime {
            args.push("-re".to_string());
        }

        // Input seeking is fast and keyframe-aligned, good enough for playout.
        args.extend([
            "-ss".to_string(),
            format!("{:.3}", request.seek),
            "-i".to_string(),
            request.reference.clone(),
        ]);
        for overlay in &request.overlays {
            args.extend(["-i".to_string(), overlay.to_string_lossy().into_owned()]);
        }

        args.extend(["-t".to_string(), format!("{:.3}", request.duration)]);

        match overlay_filter(request.overlays.len()) {
            Some(graph) => args.extend([
                "-filter_complex".to_string(),
                graph,
                "-map".to_string(),
                "[vout]".to_string(),
            ]),
            None => args.extend(["-map".to_string(), "0:v:0".to_string()]),
        }
        args.extend(["-map".to_string(), "0:a:0?".to_string()]);

        args.extend([
            "-c:v".to_string(),
            settings.video_codec.clone(),
            "-preset".to_string(),
            settings.preset.clone(),
            "-c:a".to_string(),
            settings.audio_codec.clone(),
        ]);
        args.extend(settings.extra_output_args.iter().cloned());

        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            settings.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            settings.list_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+append_list+discont_start+omit_endlist".to_string(),
            "-hls_segment_filename".to_string(),
            request.sink.segment_pattern().to_string_lossy().into_owned(),
            request.sink.manifest_path().to_string_lossy().into_owned(),
        ]);

        args
    }
}

/// Filter graph placing `count` logos over input 0: the first top-left, the second
/// top-right, further ones stacked below those two.
fn overlay_filter(count: usize) -> Option<String> {
    if count == 0 {
        return None;
    }

    let mut graph = Vec::with_capacity(count * 2);
    let mut base = "0:v".to_string();
    for i in 0..count {
        let logo = format!("logo{i}");
        let out = if i + 1 == count {
            "vout".to_string()
        } else {
            format!("v{i}")
        };
        let x = if i % 2 == 0 {
            OVERLAY_MARGIN.to_string()
        } else {
            format!("W-w-{OVERLAY_MARGIN}")
        };
        let y = OVERLAY_MARGIN + (i as u32 / 2) * (OVERLAY_HEIGHT + OVERLAY_MARGIN);

        graph.push(format!("[{}:v]scale=-1:{OVERLAY_HEIGHT}[{logo}]", i + 1));
        graph.push(format!("[{base}][{logo}]overlay={x}:{y}[{out}]"));
        base = out;
    }

    Some(graph.join(";"))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[instrument(skip_all, fields(reference = %request.reference, seek = request.seek, duration = request.duration))]
    async fn start(&self, request: &TranscodeRequest) -> Result<Box<dyn TranscodeProcess>> {
        let args = self.build_args(request);
        debug!(?args, "spawning ffmpeg");

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::TranscodeLaunch {
                reference: request.reference.clone(),
                source,
            })?;

        // Drain stderr so ffmpeg never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "ffmpeg", "{line}");
                }
            });
        }

        let stdin = child.stdin.take();
        info!(pid = child.id(), "transcode started");

        Ok(Box::new(FfmpegProcess {
            child,
            stdin,
            exit: None,
        }))
    }
}

pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    exit: Option<TranscodeExit>,
}

#[async_trait]
impl TranscodeProcess for FfmpegProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// ffmpeg finishes the current segment and writes its manifest when it reads `q`
    /// on stdin.
    async fn interrupt(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(b"q").await?;
            stdin.flush().await?;
        }

        Ok(())
    }

    async fn force_kill(&mut self) -> Result<()> {
        if self.exit.is_none() {
            self.child.kill().await?;
        }

        Ok(())
    }

    async fn join(&mut self) -> Result<TranscodeExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let status = self.child.wait().await?;
        let exit = TranscodeExit {
            code: status.code(),
        };
        self.exit = Some(exit);

        Ok(exit)
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use crate::sink::OutputSink;
    use crate::transcode::ffmpeg::{overlay_filter, FfmpegSettings, FfmpegTranscoder};
    use crate::transcode::TranscodeRequest;

    fn request(overlays: Vec<PathBuf>) -> TranscodeRequest {
        TranscodeRequest {
            reference: "/media/episode1.mp4".to_string(),
            seek: 125.5,
            duration: 10800.0,
            overlays,
            sink: OutputSink::new("/srv/live", "stream.m3u8"),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    pub fn test_args_seek_and_bound() {
        let args = FfmpegTranscoder::default().build_args(&request(Vec::new()));

        assert!(args.contains(&"-re".to_string()));
        assert_eq!(value_after(&args, "-ss"), Some("125.500"));
        assert_eq!(value_after(&args, "-i"), Some("/media/episode1.mp4"));
        assert_eq!(value_after(&args, "-t"), Some("10800.000"));
        assert_eq!(value_after(&args, "-map"), Some("0:v:0"));
        assert_eq!(value_after(&args, "-f"), Some("hls"));
        assert_eq!(
            value_after(&args, "-hls_segment_filename"),
            Some("/srv/live/segment_%05d.ts")
        );
        assert_eq!(args.last().map(String::as_str), Some("/srv/live/stream.m3u8"));
        assert!(!args.contains(&"-filter_complex".to_string()));

        // seek must precede the asset input
        let ss = args.iter().position(|arg| arg == "-ss").unwrap();
        let input = args.iter().position(|arg| arg == "-i").unwrap();
        assert!(ss < input);
    }

    #[test]
    pub fn test_args_with_logos() {
        let transcoder = FfmpegTranscoder::new(FfmpegSettings {
            realtime: false,
            ..FfmpegSettings::default()
        });
        let args = transcoder.build_args(&request(vec![
            PathBuf::from("static/pokemon_logo.png"),
            PathBuf::from("static/channel_logo.png"),
        ]));

        assert!(!args.contains(&"-re".to_string()));
        assert_eq!(args.iter().filter(|arg| *arg == "-i").count(), 3);
        assert_eq!(
            value_after(&args, "-filter_complex"),
            overlay_filter(2).as_deref()
        );
        assert_eq!(value_after(&args, "-map"), Some("[vout]"));
    }

    #[test]
    pub fn test_overlay_filter_layout() {
        assert_eq!(overlay_filter(0), None);
        assert_eq!(
            overlay_filter(1).unwrap(),
            "[1:v]scale=-1:60[logo0];[0:v][logo0]overlay=10:10[vout]"
        );
        assert_eq!(
            overlay_filter(3).unwrap(),
            "[1:v]scale=-1:60[logo0];[0:v][logo0]overlay=10:10[v0];\
             [2:v]scale=-1:60[logo1];[v0][logo1]overlay=W-w-10:10[v1];\
             [3:v]scale=-1:60[logo2];[v1][logo2]overlay=10:80[vout]"
        );
    }

    #[cfg(unix)]
    mod process {
        use std::path::PathBuf;
        use std::time::{Duration, Instant};

        use crate::transcode::ffmpeg::{FfmpegSettings, FfmpegTranscoder};
        use crate::transcode::{stop, Transcoder};

        fn fake_ffmpeg(dir: &tempfile::TempDir, body: &str) -> FfmpegTranscoder {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.path().join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            FfmpegTranscoder::new(FfmpegSettings {
                binary: path,
                ..FfmpegSettings::default()
            })
        }

        #[tokio::test]
        pub async fn test_graceful_interrupt() {
            let dir = tempfile::tempdir().unwrap();
            let transcoder = fake_ffmpeg(&dir, "read line\nexit 0");

            let mut process = transcoder.start(&super::request(Vec::new())).await.unwrap();
            let exit = stop(process.as_mut(), Duration::from_secs(5)).await.unwrap();
            assert!(exit.success());
        }

        #[tokio::test]
        pub async fn test_hung_process_is_killed() {
            let dir = tempfile::tempdir().unwrap();
            let transcoder = fake_ffmpeg(&dir, "exec sleep 30");

            let mut process = transcoder.start(&super::request(Vec::new())).await.unwrap();
            let started = Instant::now();
            let exit = stop(process.as_mut(), Duration::from_millis(200)).await.unwrap();

            assert!(!exit.success());
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        pub async fn test_launch_failure() {
            let transcoder = FfmpegTranscoder::new(FfmpegSettings {
                binary: PathBuf::from("/nonexistent/ffmpeg"),
                ..FfmpegSettings::default()
            });
            assert!(transcoder.start(&super::request(Vec::new())).await.is_err());
        }
    }
}
