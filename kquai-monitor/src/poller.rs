//! Poll controller.
//!
//! Decides when to rebuild the window from scratch and when to extend it
//! with newly mined blocks, and owns the window while doing so. State moves
//! `Idle → Fetching → {Idle, Error}`; `Error` clears on the next trigger.
//!
//! A failed fetch never touches the window: data is fetched first and only
//! applied once everything needed has arrived.
//!
//! [`PollController::run`] drives the controller from a command channel and
//! an optional interval timer, one trigger at a time.

use std::time::Duration;

use strum::AsRefStr;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::node::ChainSource;
use crate::ratio::RatioEngine;
use crate::report::Report;
use crate::tracing::prelude::*;
use crate::window::{AppendOutcome, Window};

/// Controller state.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum PollState {
    Idle,
    Fetching,
    /// Last trigger failed with this message
    Error(String),
}

impl PollState {
    pub fn error(&self) -> Option<&str> {
        match self {
            PollState::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    /// Maximum number of entries, `W`
    pub size: usize,
    /// Entries per display chunk
    pub chunk_size: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            size: 4000,
            chunk_size: 200,
        }
    }
}

/// What a timer tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Latest block was not beyond the tail
    Unchanged,
    Appended(AppendOutcome),
    /// No usable window existed, so one was built
    Rebuilt { entries: usize, lost: usize },
}

/// Block range of a window of `size` entries ending at `latest`.
pub fn window_range(latest: u64, size: usize) -> (u64, u64) {
    let span = (size.max(1) as u64).saturating_sub(1);
    (latest.saturating_sub(span), latest)
}

/// Build a window over `start..=end` from `source`.
///
/// Only the newest `capacity` blocks of the range are requested. Entries
/// for blocks caught in a failed batch slice are flagged as lost.
pub async fn rebuild<S>(
    source: &S,
    start: u64,
    end: u64,
    capacity: usize,
    engine: &RatioEngine,
) -> Result<Window>
where
    S: ChainSource + ?Sized,
{
    if start > end {
        return Err(Error::EmptyWindow { start, end });
    }
    let (first, _) = window_range(end, capacity);
    let numbers: Vec<u64> = (start.max(first)..=end).collect();

    debug!(start, end, blocks = numbers.len(), "Rebuilding window");
    let fetched = source.fetch_blocks(&numbers).await?;
    let lost = fetched.lost_blocks();
    let mut window = Window::rebuild(start, end, fetched.blocks, capacity, engine)?;
    if !lost.is_empty() {
        let marked = window.mark_lost(&lost);
        warn!(
            start,
            end,
            failed_slices = fetched.failed_slices.len(),
            lost = marked,
            "Window rebuilt from partial data"
        );
    }
    Ok(window)
}

/// Extend `window` up to `latest`, fetching only blocks beyond its tail.
///
/// At most the newest `capacity` blocks are requested. The window is left
/// as it was if the fetch fails; blocks caught in a failed batch slice are
/// appended flagged as lost and counted in [`AppendOutcome::lost`].
pub async fn append_latest<S>(
    source: &S,
    window: &mut Window,
    latest: u64,
    engine: &RatioEngine,
) -> Result<AppendOutcome>
where
    S: ChainSource + ?Sized,
{
    let from = match window.tail_block() {
        Some(tail) if latest <= tail => return Ok(AppendOutcome::default()),
        Some(tail) => tail + 1,
        None => 0,
    };
    let (first, _) = window_range(latest, window.capacity());
    let numbers: Vec<u64> = (from.max(first)..=latest).collect();

    let fetched = source.fetch_blocks(&numbers).await?;
    let lost = fetched.lost_blocks();
    let mut outcome = window.append_latest(fetched.blocks, engine);
    if !lost.is_empty() {
        outcome.lost = window.mark_lost(&lost);
        warn!(
            block = latest,
            failed_slices = fetched.failed_slices.len(),
            lost = outcome.lost,
            "Window extended from partial data"
        );
    }
    debug!(
        block = latest,
        appended = outcome.appended,
        evicted = outcome.evicted,
        "Window extended"
    );
    Ok(outcome)
}

/// Owns the window and the chain source it is fed from.
#[derive(Debug)]
pub struct PollController<S> {
    source: S,
    engine: RatioEngine,
    settings: WindowSettings,
    window: Option<Window>,
    state: PollState,
}

impl<S: ChainSource> PollController<S> {
    pub fn new(source: S, engine: RatioEngine, settings: WindowSettings) -> Self {
        Self {
            source,
            engine,
            settings: WindowSettings {
                size: settings.size.max(1),
                chunk_size: settings.chunk_size.max(1),
            },
            window: None,
            state: PollState::Idle,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_ref()
    }

    pub fn settings(&self) -> WindowSettings {
        self.settings
    }

    /// Report over the current window, if there is one.
    pub fn report(&self) -> Option<Report> {
        self.window
            .as_ref()
            .map(|w| Report::build(w, self.settings.chunk_size))
    }

    /// Rebuild the whole window ending at the latest block.
    ///
    /// Returns the new entry count.
    pub async fn refresh(&mut self) -> Result<usize> {
        self.state = PollState::Fetching;
        let result = self.build_window().await.map(|window| {
            let entries = window.len();
            self.window = Some(window);
            entries
        });
        self.settle(result)
    }

    /// Change `W` and rebuild. The previous window stays until the rebuild
    /// succeeds.
    pub async fn set_window_size(&mut self, size: usize) -> Result<usize> {
        self.settings.size = size.max(1);
        info!(size = self.settings.size, "Window size changed");
        self.refresh().await
    }

    /// Change the chunk size and rebuild.
    pub async fn set_chunk_size(&mut self, chunk_size: usize) -> Result<usize> {
        self.settings.chunk_size = chunk_size.max(1);
        info!(chunk_size = self.settings.chunk_size, "Chunk size changed");
        self.refresh().await
    }

    /// Timer tick: extend the window if the chain has advanced.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.state = PollState::Fetching;
        let result = self.advance().await;
        self.settle(result)
    }

    /// Return to idle. The window is kept.
    pub fn stop(&mut self) {
        self.state = PollState::Idle;
    }

    /// Point at a different chain source. The window is discarded and the
    /// next trigger rebuilds.
    pub fn replace_source(&mut self, source: S) -> S {
        self.window = None;
        self.state = PollState::Idle;
        std::mem::replace(&mut self.source, source)
    }

    async fn build_window(&self) -> Result<Window> {
        let latest = self.source.latest_block_number().await?;
        let (start, end) = window_range(latest, self.settings.size);
        rebuild(&self.source, start, end, self.settings.size, &self.engine).await
    }

    async fn advance(&mut self) -> Result<TickOutcome> {
        let latest = self.source.latest_block_number().await?;
        let size = self.settings.size;
        if let Some(window) = self.window.as_mut().filter(|w| w.capacity() == size) {
            if window.tail_block().is_some_and(|tail| latest <= tail) {
                trace!(block = latest, "No new blocks");
                return Ok(TickOutcome::Unchanged);
            }
            return append_latest(&self.source, window, latest, &self.engine)
                .await
                .map(TickOutcome::Appended);
        }

        let (start, end) = window_range(latest, size);
        let window = rebuild(&self.source, start, end, size, &self.engine).await?;
        let entries = window.len();
        let lost = window.lost_entries();
        self.window = Some(window);
        Ok(TickOutcome::Rebuilt { entries, lost })
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.state = PollState::Idle,
            Err(e) => {
                warn!(error = %e, "Poll failed, keeping previous window");
                self.state = PollState::Error(e.to_string());
            }
        }
        result
    }
}

/// Requests to a running controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollCommand {
    Refresh,
    SetWindowSize(usize),
    SetChunkSize(usize),
    /// Refresh, then poll on the timer
    StartAuto,
    StopAuto,
}

/// Published after every trigger that did something.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Updated(Report),
    Unchanged,
    Failed { message: String },
}

enum Trigger {
    Command(PollCommand),
    Tick,
}

impl<S: ChainSource + 'static> PollController<S> {
    /// Run until `running` is cancelled or the command channel closes.
    ///
    /// Starts with a full refresh. Commands are queued while a trigger is in
    /// progress; timer ticks that fall due meanwhile are skipped. Returns the
    /// controller so its final window can be inspected.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<PollCommand>,
        events: mpsc::Sender<PollEvent>,
        poll_interval: Duration,
        auto: bool,
        running: CancellationToken,
    ) -> Self {
        trace!("Poll loop started.");
        let mut auto = auto;
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.reset();

        let mut pending = Some(PollCommand::Refresh);
        loop {
            let trigger = match pending.take() {
                Some(command) => Trigger::Command(command),
                None => tokio::select! {
                    _ = running.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => Trigger::Command(command),
                        None => break,
                    },
                    _ = ticker.tick(), if auto => Trigger::Tick,
                },
            };

            let event = tokio::select! {
                _ = running.cancelled() => break,
                event = self.handle(trigger, &mut auto, &mut ticker) => event,
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    debug!("Event receiver dropped");
                    break;
                }
            }
        }

        self.stop();
        trace!("Poll loop stopped.");
        self
    }

    async fn handle(
        &mut self,
        trigger: Trigger,
        auto: &mut bool,
        ticker: &mut Interval,
    ) -> Option<PollEvent> {
        let result = match trigger {
            Trigger::Command(PollCommand::Refresh) => self.refresh().await.map(|_| true),
            Trigger::Command(PollCommand::SetWindowSize(size)) => {
                self.set_window_size(size).await.map(|_| true)
            }
            Trigger::Command(PollCommand::SetChunkSize(size)) => {
                self.set_chunk_size(size).await.map(|_| true)
            }
            Trigger::Command(PollCommand::StartAuto) => {
                *auto = true;
                let result = self.refresh().await.map(|_| true);
                ticker.reset();
                result
            }
            Trigger::Command(PollCommand::StopAuto) => {
                *auto = false;
                self.stop();
                return None;
            }
            Trigger::Tick => self
                .tick()
                .await
                .map(|outcome| outcome != TickOutcome::Unchanged),
        };

        Some(match result {
            Ok(true) => match self.report() {
                Some(report) => PollEvent::Updated(report),
                None => PollEvent::Unchanged,
            },
            Ok(false) => PollEvent::Unchanged,
            Err(e) => PollEvent::Failed {
                message: e.to_string(),
            },
        })
    }
}
