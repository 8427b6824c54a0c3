//! Channel file loading.
//!
//! ```toml
//! timezone = "Europe/Paris"
//!
//! [[schedule]]
//! start = "09:00"
//! show = "cartoons"
//!
//! [[schedule]]
//! start = "12:00"
//! show = "news"
//!
//! [shows.cartoons]
//! source = "uploads/cartoons"
//! overlays = ["static/pokemon_logo.png", "static/channel_logo.png"]
//!
//! [shows.news]
//! source = "playlists/news.m3u"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::playlist::Show;
use crate::schedule::{Schedule, ScheduleEntry};
use crate::scheduler::SchedulerSettings;
use crate::transcode::ffmpeg::FfmpegSettings;

/// The schedule must be re-resolved at least this often.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// IANA time zone the schedule is written in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub schedule: Vec<ScheduleRow>,
    #[serde(default)]
    pub shows: BTreeMap<String, Show>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegSettings,
    #[serde(default)]
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRow {
    pub start: String,
    pub show: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// URL path segment under which the sink directory is served.
    pub output_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            output_path: "live".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub manifest: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            manifest: "stream.m3u8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_secs: f64,
    pub supervise_interval_secs: f64,
    pub idle_backoff_secs: f64,
    pub retry_backoff_secs: f64,
    pub grace_period_secs: f64,
    pub playlist_retry_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10.0,
            supervise_interval_secs: 1.0,
            idle_backoff_secs: 5.0,
            retry_backoff_secs: 5.0,
            grace_period_secs: 5.0,
            playlist_retry_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub binary: PathBuf,
    pub timeout_secs: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffprobe"),
            timeout_secs: 15.0,
        }
    }
}

/// Where progress is persisted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ProgressConfig {
    /// A SQLite database file.
    Sqlite { path: PathBuf },
    /// One JSON file per show in a directory.
    Directory { path: PathBuf },
    /// One JSON object per show in an S3 bucket. Credentials come from the environment.
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        prefix: String,
    },
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("progress.db"),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative number of seconds")))
}

impl ChannelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        for (id, show) in config.shows.iter_mut() {
            show.id = id.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.timezone()?;
        self.poll_interval()?;
        self.scheduler_settings()?;
        seconds("probe.timeout_secs", self.probe.timeout_secs)?;
        self.schedule()?;

        if self.server.output_path.is_empty() || self.server.output_path.contains('/') {
            return Err(Error::Config(format!(
                "server.output_path must be a single path segment, got {:?}",
                self.server.output_path
            )));
        }

        for row in &self.schedule {
            if !self.shows.contains_key(&row.show) {
                // Valid: the slot simply idles.
                warn!(show = %row.show, start = %row.start, "scheduled show has no [shows] entry");
            }
        }

        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| Error::Config(format!("{:?} is not a valid IANA time zone", self.timezone)))
    }

    pub fn schedule(&self) -> Result<Schedule> {
        let entries = self
            .schedule
            .iter()
            .map(|row| ScheduleEntry::parse(&row.start, row.show.as_str()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Schedule::from_entries(entries))
    }

    pub fn shows(&self) -> Vec<Show> {
        self.shows.values().cloned().collect()
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        let interval = seconds("timing.poll_interval_secs", self.timing.poll_interval_secs)?;
        if interval.is_zero() || interval > MAX_POLL_INTERVAL {
            return Err(Error::Config(format!(
                "timing.poll_interval_secs must be in (0, {}]",
                MAX_POLL_INTERVAL.as_secs()
            )));
        }

        Ok(interval)
    }

    pub fn probe_timeout(&self) -> Result<Duration> {
        seconds("probe.timeout_secs", self.probe.timeout_secs)
    }

    pub fn scheduler_settings(&self) -> Result<SchedulerSettings> {
        let timing = &self.timing;
        let supervise_interval =
            seconds("timing.supervise_interval_secs", timing.supervise_interval_secs)?;
        if supervise_interval.is_zero() {
            return Err(Error::Config(
                "timing.supervise_interval_secs must be positive".to_string(),
            ));
        }

        Ok(SchedulerSettings {
            supervise_interval,
            idle_backoff: seconds("timing.idle_backoff_secs", timing.idle_backoff_secs)?,
            retry_backoff: seconds("timing.retry_backoff_secs", timing.retry_backoff_secs)?,
            grace_period: seconds("timing.grace_period_secs", timing.grace_period_secs)?,
            playlist_retry: seconds("timing.playlist_retry_secs", timing.playlist_retry_secs)?,
        })
    }
}
