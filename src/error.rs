use thiserror::Error;

/// Errors raised by the playout engine and its collaborators.
///
/// None of these are fatal to the scheduling loop. The scheduler logs them and
/// backs off; only startup code in `main` turns them into a process exit.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no show is scheduled")]
    ScheduleUnresolved,

    #[error("playlist for show {show} is unavailable: {reason}")]
    PlaylistUnavailable { show: String, reason: String },

    #[error("failed to probe {reference}: {reason}")]
    ProbeFailure { reference: String, reason: String },

    #[error("failed to launch transcode for {reference}: {source}")]
    TranscodeLaunch {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode exited abnormally (code {code:?})")]
    TranscodeCrash { code: Option<i32> },

    #[error("failed to persist progress: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
