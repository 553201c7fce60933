//! Pipeline lifecycle: the source element driven by state transitions.
//!
//! `Ready -> Paused` allocates the frame slot, negotiates the output format
//! and starts the rendering session. `Paused -> Ready` stops it, frees the
//! slot and signals end-of-stream. Between the two, downstream pulls frames
//! through [`ChromiumSource::need_data`].

use crate::bridge::{Consumed, FrameBridge};
use crate::host::HostRuntime;
use crate::launch::LaunchConfig;
use crate::session::{LoadError, RenderHostSession, SessionState};
use crate::sink::{FlowError, FrameSink, VideoBuffer, VideoFormat};
use crate::{Error, Result, SourceConfig};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// The four pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// A transition between adjacent states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    pub fn between(from: PipelineState, to: PipelineState) -> Option<Self> {
        use PipelineState::*;
        match (from, to) {
            (Null, Ready) => Some(Self::NullToReady),
            (Ready, Paused) => Some(Self::ReadyToPaused),
            (Paused, Playing) => Some(Self::PausedToPlaying),
            (Playing, Paused) => Some(Self::PlayingToPaused),
            (Paused, Ready) => Some(Self::PausedToReady),
            (Ready, Null) => Some(Self::ReadyToNull),
            _ => None,
        }
    }

    pub fn from_state(self) -> PipelineState {
        match self {
            Self::NullToReady => PipelineState::Null,
            Self::ReadyToPaused | Self::ReadyToNull => PipelineState::Ready,
            Self::PausedToPlaying | Self::PausedToReady => PipelineState::Paused,
            Self::PlayingToPaused => PipelineState::Playing,
        }
    }

    pub fn to_state(self) -> PipelineState {
        match self {
            Self::NullToReady | Self::PausedToReady => PipelineState::Ready,
            Self::ReadyToPaused | Self::PlayingToPaused => PipelineState::Paused,
            Self::PausedToPlaying => PipelineState::Playing,
            Self::ReadyToNull => PipelineState::Null,
        }
    }
}

/// Result of one pull cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Pushed { sequence: u64, pts: Duration },
    /// Downstream refused the buffer; advisory only
    PushFailed(FlowError),
    /// No frame within the pull timeout; retried on the next demand
    Timeout,
    Stopped,
    NotRunning,
}

/// Delivery counters, reset on every start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub frames_pushed: u64,
    pub pull_timeouts: u64,
    pub push_failures: u64,
    pub frames_dropped: u64,
    pub frames_overwritten: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    timeouts: AtomicU64,
    push_failures: AtomicU64,
    dropped_base: AtomicU64,
    overwritten_base: AtomicU64,
}

/// Offscreen browser as a live video source
pub struct ChromiumSource {
    config: Mutex<SourceConfig>,
    sink: Arc<dyn FrameSink>,
    bridge: Arc<FrameBridge>,
    session: Mutex<RenderHostSession>,
    state: Mutex<PipelineState>,
    format: Mutex<Option<VideoFormat>>,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ChromiumSource {
    pub fn new(config: SourceConfig, runtime: Arc<HostRuntime>, sink: Arc<dyn FrameSink>) -> Self {
        let bridge = Arc::new(FrameBridge::new());
        Self {
            config: Mutex::new(config),
            sink,
            session: Mutex::new(RenderHostSession::new(runtime, bridge.clone())),
            bridge,
            state: Mutex::new(PipelineState::Null),
            format: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> SourceConfig {
        lock(&self.config).clone()
    }

    /// Replace the configuration; only allowed while not started
    pub fn set_config(&self, config: SourceConfig) -> Result<()> {
        let state = *lock(&self.state);
        if state > PipelineState::Ready {
            return Err(Error::Config(format!(
                "cannot reconfigure while {:?}",
                state
            )));
        }
        *lock(&self.config) = config;
        Ok(())
    }

    /// A live stream source: buffers carry running time, never byte offsets
    pub const fn is_live(&self) -> bool {
        true
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    pub fn session_state(&self) -> SessionState {
        lock(&self.session).state()
    }

    pub fn bridge(&self) -> &Arc<FrameBridge> {
        &self.bridge
    }

    /// Output format negotiated by the last start
    pub fn format(&self) -> Option<VideoFormat> {
        *lock(&self.format)
    }

    pub fn launch_config(&self) -> Option<LaunchConfig> {
        lock(&self.session).launch_config().cloned()
    }

    /// Navigation errors seen by the current session
    pub fn load_errors(&self) -> Vec<LoadError> {
        lock(&self.session)
            .client()
            .map(|c| c.load_errors())
            .unwrap_or_default()
    }

    pub fn page_loaded(&self) -> bool {
        lock(&self.session)
            .client()
            .map(|c| c.page_loaded())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SourceStats {
        let bridge = self.bridge.stats();
        SourceStats {
            frames_pushed: self.counters.pushed.load(Ordering::Relaxed),
            pull_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            push_failures: self.counters.push_failures.load(Ordering::Relaxed),
            frames_dropped: bridge
                .dropped
                .saturating_sub(self.counters.dropped_base.load(Ordering::Relaxed)),
            frames_overwritten: bridge
                .overwritten
                .saturating_sub(self.counters.overwritten_base.load(Ordering::Relaxed)),
        }
    }

    /// Perform one adjacent state transition
    pub fn change_state(&self, transition: StateChange) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != transition.from_state() {
            return Err(Error::InvalidTransition {
                from: *state,
                to: transition.to_state(),
            });
        }
        debug!("State change {:?}", transition);
        match transition {
            StateChange::ReadyToPaused => self.start()?,
            StateChange::PausedToReady => self.stop(),
            StateChange::NullToReady
            | StateChange::PausedToPlaying
            | StateChange::PlayingToPaused
            | StateChange::ReadyToNull => {}
        }
        *state = transition.to_state();
        Ok(())
    }

    /// Walk through adjacent transitions until `target` is reached
    pub fn set_state(&self, target: PipelineState) -> Result<()> {
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }
            let next = if target > current {
                next_up(current)
            } else {
                next_down(current)
            };
            let change = StateChange::between(current, next).ok_or(Error::InvalidTransition {
                from: current,
                to: next,
            })?;
            self.change_state(change)?;
        }
    }

    fn start(&self) -> Result<()> {
        let config = self.config();
        let params = config.session_params()?;
        info!("Starting browser source: {}", params.url);

        self.bridge.allocate(params.width, params.height)?;

        let format = VideoFormat::bgra(params.width, params.height, params.framerate);
        info!("Setting caps: {}", format.caps_string());
        if let Err(e) = self.sink.set_output_format(&format) {
            self.bridge.release();
            return Err(match e {
                Error::Negotiation(_) => e,
                other => Error::Negotiation(other.to_string()),
            });
        }
        *lock(&self.format) = Some(format);
        self.reset_counters();

        if let Err(e) = lock(&self.session).start(&params) {
            self.bridge.set_running(false);
            self.bridge.release();
            *lock(&self.format) = None;
            return Err(e);
        }
        info!("Browser source started");
        Ok(())
    }

    fn stop(&self) {
        info!("Stopping browser source");
        // Wake a blocked pull with `Stopped` before joining anything
        self.bridge.set_running(false);
        lock(&self.session).stop();
        self.bridge.release();
        self.sink.end_of_stream();
        info!("Browser source stopped");
    }

    fn reset_counters(&self) {
        let bridge = self.bridge.stats();
        self.counters.pushed.store(0, Ordering::Relaxed);
        self.counters.timeouts.store(0, Ordering::Relaxed);
        self.counters.push_failures.store(0, Ordering::Relaxed);
        self.counters.dropped_base.store(bridge.dropped, Ordering::Relaxed);
        self.counters
            .overwritten_base
            .store(bridge.overwritten, Ordering::Relaxed);
    }

    /// Serve one downstream demand: wait for a frame, timestamp it and push it.
    pub fn need_data(&self, length_hint: u32) -> PullOutcome {
        debug!("need-data: length={}", length_hint);
        if !self.bridge.is_running() {
            return PullOutcome::NotRunning;
        }
        let (timeout, framerate) = {
            let config = lock(&self.config);
            (config.pull_timeout(), config.framerate)
        };

        let frame = match self.bridge.consume(timeout) {
            Consumed::Frame(frame) => frame,
            Consumed::Timeout => {
                warn!("Timeout waiting for frame");
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return PullOutcome::Timeout;
            }
            Consumed::Stopped => return PullOutcome::Stopped,
        };

        let duration = framerate.frame_duration();
        let pts = framerate.timestamp(frame.sequence);
        let sequence = frame.sequence;
        debug!("Pushing buffer: ts={:?} dur={:?}", pts, duration);

        let buffer = VideoBuffer {
            data: frame.data,
            pts,
            dts: pts,
            duration,
            sequence,
        };
        match self.sink.push_frame(buffer) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                PullOutcome::Pushed { sequence, pts }
            }
            Err(e) => {
                warn!("push-buffer returned {}", e);
                self.counters.push_failures.fetch_add(1, Ordering::Relaxed);
                PullOutcome::PushFailed(e)
            }
        }
    }

    /// Downstream queue is full. Advisory only.
    pub fn enough_data(&self) {
        debug!("enough-data");
    }
}

impl Drop for ChromiumSource {
    fn drop(&mut self) {
        if self.state() >= PipelineState::Paused {
            let _ = self.set_state(PipelineState::Ready);
        }
    }
}

fn next_up(s: PipelineState) -> PipelineState {
    match s {
        PipelineState::Null => PipelineState::Ready,
        PipelineState::Ready => PipelineState::Paused,
        PipelineState::Paused | PipelineState::Playing => PipelineState::Playing,
    }
}

fn next_down(s: PipelineState) -> PipelineState {
    match s {
        PipelineState::Playing => PipelineState::Paused,
        PipelineState::Paused => PipelineState::Ready,
        PipelineState::Ready | PipelineState::Null => PipelineState::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceScanner;
    use crate::launch::Environment;
    use crate::pattern::PatternHost;
    use crate::settings::HostSettings;
    use crate::sink::MemorySink;

    fn runtime(host: Arc<PatternHost>) -> Arc<HostRuntime> {
        let tmp = std::env::temp_dir();
        Arc::new(
            HostRuntime::new(host)
                .with_scanner(DeviceScanner::new(tmp.join("chromiumsrc-no-such-dri")))
                .with_environment(Environment::headless())
                .with_settings(HostSettings::in_memory(tmp)),
        )
    }

    fn config() -> SourceConfig {
        SourceConfig {
            url: Some("http://x".into()),
            width: 8,
            height: 4,
            pull_timeout_ms: 500,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn transitions_must_be_adjacent() {
        let src = ChromiumSource::new(config(), runtime(Arc::new(PatternHost::new())), Arc::new(MemorySink::new()));
        let err = src.change_state(StateChange::ReadyToPaused).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { from: PipelineState::Null, to: PipelineState::Paused }
        ));
        assert_eq!(StateChange::between(PipelineState::Null, PipelineState::Playing), None);
    }

    #[test]
    fn missing_url_fails_fast_without_allocating() {
        let host = Arc::new(PatternHost::new());
        let src = ChromiumSource::new(
            SourceConfig { url: None, ..config() },
            runtime(host.clone()),
            Arc::new(MemorySink::new()),
        );
        let err = src.set_state(PipelineState::Paused).unwrap_err();
        assert!(err.is_config());
        assert_eq!(src.state(), PipelineState::Ready);
        assert!(!src.bridge().is_allocated());
        assert!(!src.bridge().is_running());
        assert_eq!(host.init_count(), 0);
    }

    #[test]
    fn host_init_failure_frees_buffer() {
        let host = Arc::new(PatternHost::new());
        host.fail_next_initialize();
        let sink = MemorySink::new();
        let src = ChromiumSource::new(config(), runtime(host), Arc::new(sink));
        let err = src.set_state(PipelineState::Paused).unwrap_err();
        assert!(matches!(err, Error::HostInit(_)));
        assert!(!src.bridge().is_allocated());
        assert!(!src.bridge().is_running());
        assert_eq!(src.format(), None);
    }

    #[test]
    fn need_data_before_start_is_not_running() {
        let src = ChromiumSource::new(config(), runtime(Arc::new(PatternHost::new())), Arc::new(MemorySink::new()));
        assert_eq!(src.need_data(0), PullOutcome::NotRunning);
        src.enough_data();
    }

    #[test]
    fn stop_signals_eos_and_frees() {
        let sink = MemorySink::new();
        let src = ChromiumSource::new(config(), runtime(Arc::new(PatternHost::new())), Arc::new(sink.clone()));
        src.set_state(PipelineState::Playing).unwrap();
        assert!(matches!(src.need_data(4096), PullOutcome::Pushed { sequence: 0, .. }));
        src.set_state(PipelineState::Null).unwrap();
        assert!(sink.is_eos());
        assert!(!src.bridge().is_allocated());
        assert_eq!(src.session_state(), SessionState::Idle);
        assert_eq!(src.need_data(0), PullOutcome::NotRunning);
    }

    #[test]
    fn reconfigure_rejected_while_paused() {
        let src = ChromiumSource::new(config(), runtime(Arc::new(PatternHost::new())), Arc::new(MemorySink::new()));
        src.set_state(PipelineState::Paused).unwrap();
        assert!(src.set_config(config()).is_err());
        src.set_state(PipelineState::Ready).unwrap();
        assert!(src.set_config(config()).is_ok());
    }
}
