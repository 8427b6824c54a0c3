//! The playout state machine.
//!
//! One [Scheduler] task decides what plays. Each cycle it resolves the current slot,
//! works out a [PlayoutWindow] from the show's playlist and progress, runs a single
//! transcode bounded to that window, supervises it until it ends or must be cut short,
//! and writes the new progress back. At most one transcode process is alive at any time:
//! a cycle never returns before its process has exited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::Error;
use crate::playlist::{Asset, Playlist, PlaylistLoader};
use crate::progress::{ProgressRecord, ProgressStore, END_TOLERANCE_SECS};
use crate::schedule::{Schedule, ShowId, Slot};
use crate::sink::OutputSink;
use crate::transcode::{self, TranscodeExit, TranscodeProcess, TranscodeRequest, Transcoder};

/// A transcode that exits sooner than this is treated as failing and backed off.
const MIN_HEALTHY_RUN_SECS: f64 = 1.0;

/// The packager stops on its own `-t` bound, usually a little before the wall-clock
/// deadline since `-re` reads ahead at startup.
const BOUND_EXIT_SLACK_SECS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// How often a running transcode is checked against the schedule.
    pub supervise_interval: Duration,
    /// Pause before polling again when nothing can be played.
    pub idle_backoff: Duration,
    /// Pause after a transcode failed to launch or crashed.
    pub retry_backoff: Duration,
    /// How long an interrupted transcode may take to exit before it is killed.
    pub grace_period: Duration,
    /// Minimum time between reload attempts of an unavailable playlist.
    pub playlist_retry: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            supervise_interval: Duration::from_secs(1),
            idle_backoff: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            playlist_retry: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayoutState {
    /// No show resolves, or the scheduled show has nothing playable.
    Idle,
    /// Nothing streaming until the next tick.
    AwaitingSlot,
    Streaming,
    /// A transcode is being torn down.
    Interrupted,
}

/// Snapshot of the scheduler published for the status page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayoutStatus {
    pub state: PlayoutState,
    pub show: Option<ShowId>,
    pub asset: Option<String>,
    pub index: Option<usize>,
    pub start_offset: Option<f64>,
    pub play_duration: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub slot_end: Option<DateTime<Utc>>,
}

impl Default for PlayoutStatus {
    fn default() -> Self {
        Self {
            state: PlayoutState::Idle,
            show: None,
            asset: None,
            index: None,
            start_offset: None,
            play_duration: None,
            started_at: None,
            slot_end: None,
        }
    }
}

/// What to play next and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayoutWindow {
    pub show: ShowId,
    pub index: usize,
    pub asset: Asset,
    pub start_offset: f64,
    pub play_duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowPlan {
    Play(PlayoutWindow),
    /// Nothing left of the current episode; advance without playing.
    Exhausted,
    /// The slot has no time left.
    SlotOver,
}

/// Plan the next window for a record that has already been wrapped to the playlist.
pub fn plan_window(
    show: &str,
    record: &ProgressRecord,
    playlist: &Playlist,
    slot_remaining: f64,
) -> WindowPlan {
    let Some(asset) = playlist.get(record.index) else {
        return WindowPlan::Exhausted;
    };

    let start_offset = record.start_offset();
    let residual = asset.duration - start_offset;
    if residual <= 0.0 {
        return WindowPlan::Exhausted;
    }
    if slot_remaining <= 0.0 {
        return WindowPlan::SlotOver;
    }

    WindowPlan::Play(PlayoutWindow {
        show: show.to_string(),
        index: record.index,
        asset: asset.clone(),
        start_offset,
        play_duration: residual.min(slot_remaining),
    })
}

/// How a supervised segment ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentOutcome {
    /// The process exited on its own before the window elapsed. `exit` is `None` when
    /// it never launched or could not be waited on.
    Exited {
        elapsed: f64,
        exit: Option<TranscodeExit>,
    },
    /// The window elapsed; the segment is taken as fully played.
    Consumed,
    /// Cut short by a slot change or shutdown after `elapsed` seconds.
    Interrupted { elapsed: f64 },
}

/// Apply the outcome of playing `window` to `record`.
pub fn settle(record: &mut ProgressRecord, window: &PlayoutWindow, outcome: &SegmentOutcome) {
    record.index = window.index;
    match outcome {
        SegmentOutcome::Exited { elapsed, exit } if reached_bound(window, *elapsed, *exit) => {
            record.stop_at(
                window.start_offset + window.play_duration,
                window.asset.duration,
            )
        }
        SegmentOutcome::Exited { .. } => record.advance(),
        SegmentOutcome::Consumed => record.stop_at(
            window.start_offset + window.play_duration,
            window.asset.duration,
        ),
        SegmentOutcome::Interrupted { elapsed } => record.stop_at(
            window.start_offset + elapsed.min(window.play_duration),
            window.asset.duration,
        ),
    }
}

/// Whether a clean exit is the packager finishing a window that the slot cut short,
/// rather than the episode running out or the process giving up.
fn reached_bound(window: &PlayoutWindow, elapsed: f64, exit: Option<TranscodeExit>) -> bool {
    let residual = window.asset.duration - window.start_offset;

    exit.is_some_and(|exit| exit.success())
        && window.play_duration < residual - END_TOLERANCE_SECS
        && elapsed >= window.play_duration - BOUND_EXIT_SLACK_SECS
}

/// A slot being served, with its playlist cached for as long as it lasts.
struct Activation {
    slot: Slot,
    playlist: Option<Arc<Playlist>>,
    last_load: Option<Instant>,
}

/// Everything the scheduler task owns between cycles.
pub struct SchedulerState {
    phase: PlayoutState,
    activation: Option<Activation>,
    records: HashMap<ShowId, ProgressRecord>,
    /// Wall-clock start of the running transcode.
    streaming_since: Option<DateTime<Utc>>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            phase: PlayoutState::Idle,
            activation: None,
            records: HashMap::new(),
            streaming_since: None,
        }
    }
}

/// External collaborators driven by the scheduler.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub loader: PlaylistLoader,
    pub store: Arc<dyn ProgressStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub sink: OutputSink,
}

enum Next {
    Now,
    After(Duration),
}

enum Halt {
    Exited(crate::error::Result<TranscodeExit>),
    Deadline,
    Interrupt(&'static str),
}

pub struct Scheduler {
    schedule: Arc<Schedule>,
    clock: Arc<dyn Clock>,
    loader: PlaylistLoader,
    store: Arc<dyn ProgressStore>,
    transcoder: Arc<dyn Transcoder>,
    sink: OutputSink,
    settings: SchedulerSettings,
    slots: watch::Receiver<Option<Slot>>,
    status: watch::Sender<PlayoutStatus>,
    state: SchedulerState,
}

impl Scheduler {
    /// `slots` is the channel published by the schedule watcher; a change on it interrupts
    /// the running transcode.
    pub fn new(
        schedule: Arc<Schedule>,
        collaborators: Collaborators,
        settings: SchedulerSettings,
        slots: watch::Receiver<Option<Slot>>,
    ) -> Self {
        let (status, _) = watch::channel(PlayoutStatus::default());

        Self {
            schedule,
            clock: collaborators.clock,
            loader: collaborators.loader,
            store: collaborators.store,
            transcoder: collaborators.transcoder,
            sink: collaborators.sink,
            settings,
            slots,
            status,
            state: SchedulerState::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayoutStatus> {
        self.status.subscribe()
    }

    /// Run until `cancel` fires. A transcode in flight at shutdown is interrupted and its
    /// progress saved before this returns.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(entries = self.schedule.entries().len(), "scheduler started");

        while !cancel.is_cancelled() {
            match self.cycle(&cancel).await {
                Next::Now => {}
                Next::After(pause) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        self.publish(PlayoutState::Idle, None, None);
        info!("scheduler stopped");
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Next {
        let now = self.clock.now();
        let Some(slot) = self.schedule.resolve(&now) else {
            if self.state.activation.take().is_some() || self.state.phase != PlayoutState::Idle {
                info!(error = %Error::ScheduleUnresolved, "going idle");
            }
            self.publish(PlayoutState::Idle, None, None);
            return Next::After(self.settings.idle_backoff);
        };

        self.activate(&slot).await;

        let Some(playlist) = self.playlist().await else {
            self.publish(PlayoutState::Idle, None, Some(&slot));
            return Next::After(self.settings.idle_backoff);
        };

        let show = slot.show.clone();
        let mut record = self.record(&show).await;
        if record.wrap(playlist.len()) {
            info!(show = %show, "playlist played through, starting over");
        }

        let remaining = slot.remaining(&now).as_secs_f64();
        let window = match plan_window(&show, &record, &playlist, remaining) {
            WindowPlan::Play(window) => window,
            WindowPlan::Exhausted => {
                debug!(show = %show, index = record.index, "nothing left of episode, advancing");
                record.advance();
                self.commit(&show, record).await;
                return Next::Now;
            }
            WindowPlan::SlotOver => {
                self.publish(PlayoutState::AwaitingSlot, None, Some(&slot));
                return Next::After(self.settings.supervise_interval);
            }
        };
        self.state.records.insert(show.clone(), record);

        let outcome = self.play(&window, &slot, cancel).await;
        settle(&mut record, &window, &outcome);
        info!(
            show = %show,
            ?outcome,
            index = record.index,
            offset = record.offset,
            "segment finished"
        );
        self.commit(&show, record).await;
        self.publish(PlayoutState::AwaitingSlot, None, Some(&slot));

        match outcome {
            SegmentOutcome::Exited { elapsed, exit }
                if elapsed < MIN_HEALTHY_RUN_SECS || !exit.is_some_and(|exit| exit.success()) =>
            {
                Next::After(self.settings.retry_backoff)
            }
            _ => Next::Now,
        }
    }

    /// Switch to `slot` if it is not the one being served. A different show clears the
    /// sink; the previous transcode has always exited by now.
    async fn activate(&mut self, slot: &Slot) {
        let previous = match &self.state.activation {
            Some(activation) if activation.slot == *slot => return,
            Some(activation) => Some(activation.slot.show.clone()),
            None => None,
        };

        if previous.as_deref() == Some(slot.show.as_str()) {
            info!(show = %slot.show, end = %slot.end, "new slot for the same show");
        } else {
            info!(show = %slot.show, ?previous, end = %slot.end, "show change");
            if let Err(e) = self.sink.clear().await {
                warn!(error = %e, "failed to clear output sink");
            }
        }

        self.state.activation = Some(Activation {
            slot: slot.clone(),
            playlist: None,
            last_load: None,
        });
    }

    /// The playlist of the current activation, loading it on first use.
    async fn playlist(&mut self) -> Option<Arc<Playlist>> {
        let activation = self.state.activation.as_mut()?;
        if let Some(playlist) = &activation.playlist {
            return Some(Arc::clone(playlist));
        }
        if let Some(last_load) = activation.last_load {
            if last_load.elapsed() < self.settings.playlist_retry {
                return None;
            }
        }

        activation.last_load = Some(Instant::now());
        match self.loader.load(&activation.slot.show).await {
            Ok(playlist) => {
                let playlist = Arc::new(playlist);
                activation.playlist = Some(Arc::clone(&playlist));
                Some(playlist)
            }
            Err(e) => {
                warn!(error = %e, "show cannot be played");
                None
            }
        }
    }

    /// In-memory record of `show`, seeded from the store the first time it is needed.
    async fn record(&mut self, show: &str) -> ProgressRecord {
        if let Some(record) = self.state.records.get(show) {
            return *record;
        }

        let record = match self.store.get(show).await {
            Ok(Some(record)) => {
                info!(show, index = record.index, offset = record.offset, "resuming show");
                record
            }
            Ok(None) => ProgressRecord::default(),
            Err(e) => {
                warn!(show, error = %e, "failed to load progress, starting from the top");
                ProgressRecord::default()
            }
        };

        self.state.records.insert(show.to_string(), record);
        record
    }

    async fn commit(&mut self, show: &str, record: ProgressRecord) {
        self.state.records.insert(show.to_string(), record);

        if let Err(e) = self.store.put(show, &record).await {
            warn!(show, error = %e, "failed to persist progress, keeping it in memory");
        }
    }

    #[instrument(skip_all, fields(show = %window.show, index = window.index))]
    async fn play(
        &mut self,
        window: &PlayoutWindow,
        slot: &Slot,
        cancel: &CancellationToken,
    ) -> SegmentOutcome {
        let overlays = self
            .loader
            .show(&window.show)
            .map(|show| show.overlays.clone())
            .unwrap_or_default();
        let request = TranscodeRequest {
            reference: window.asset.reference.clone(),
            seek: window.start_offset,
            duration: window.play_duration,
            overlays,
            sink: self.sink.clone(),
        };

        let mut process = match self.transcoder.start(&request).await {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, asset = %window.asset.reference, "skipping asset");
                return SegmentOutcome::Exited {
                    elapsed: 0.0,
                    exit: None,
                };
            }
        };

        info!(
            asset = %window.asset.reference,
            start_offset = window.start_offset,
            play_duration = window.play_duration,
            "streaming"
        );
        self.state.streaming_since = Some(self.clock.now().with_timezone(&Utc));
        self.publish(PlayoutState::Streaming, Some(window), Some(slot));

        let started = Instant::now();
        let deadline = started + Duration::from_secs_f64(window.play_duration);
        let mut watching = true;

        let halt = loop {
            let wake = (Instant::now() + self.settings.supervise_interval).min(deadline);

            tokio::select! {
                biased;
                exit = process.join() => break Halt::Exited(exit),
                _ = cancel.cancelled() => break Halt::Interrupt("shutdown"),
                changed = self.slots.changed(), if watching => {
                    if changed.is_err() {
                        // watcher gone; the clock check below still catches boundaries
                        watching = false;
                        continue;
                    }
                    let published = self.slots.borrow_and_update().clone();
                    if published.as_ref() != Some(slot) {
                        break Halt::Interrupt("slot changed");
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= deadline {
                        break Halt::Deadline;
                    }
                    if self.schedule.resolve(&self.clock.now()).as_ref() != Some(slot) {
                        break Halt::Interrupt("slot boundary");
                    }
                }
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match halt {
            Halt::Exited(exit) => {
                let exit = match exit {
                    Ok(exit) if exit.success() => Some(exit),
                    Ok(exit) => {
                        let crash = Error::TranscodeCrash { code: exit.code };
                        warn!(error = %crash, elapsed, "transcode ended early");
                        Some(exit)
                    }
                    Err(e) => {
                        warn!(error = %e, elapsed, "lost track of transcode");
                        None
                    }
                };
                SegmentOutcome::Exited { elapsed, exit }
            }
            Halt::Deadline => {
                self.teardown(process.as_mut()).await;
                SegmentOutcome::Consumed
            }
            Halt::Interrupt(reason) => {
                info!(reason, elapsed, "interrupting transcode");
                self.publish(PlayoutState::Interrupted, Some(window), Some(slot));
                self.teardown(process.as_mut()).await;
                SegmentOutcome::Interrupted { elapsed }
            }
        }
    }

    async fn teardown(&self, process: &mut dyn TranscodeProcess) {
        if let Err(e) = transcode::stop(process, self.settings.grace_period).await {
            error!(error = %e, "failed to stop transcode");
        }
    }

    fn publish(&mut self, state: PlayoutState, window: Option<&PlayoutWindow>, slot: Option<&Slot>) {
        self.state.phase = state;
        self.status.send_replace(PlayoutStatus {
            state,
            show: slot.map(|slot| slot.show.clone()),
            asset: window.map(|window| window.asset.reference.clone()),
            index: window.map(|window| window.index),
            start_offset: window.map(|window| window.start_offset),
            play_duration: window.map(|window| window.play_duration),
            started_at: window.and(self.state.streaming_since),
            slot_end: slot.map(|slot| slot.end.with_timezone(&Utc)),
        });
    }
}
