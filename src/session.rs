//! Rendering host session: browser creation, the redraw loop and teardown.
//!
//! Teardown order: stop accepting paints, join the redraw thread, close the
//! browser, drop the handles. The frame buffer itself belongs to the
//! pipeline and is freed after the session has stopped.

use crate::bridge::{FrameBridge, PublishOutcome};
use crate::host::{
    BrowserHandle, BrowserId, BrowserSettings, HostClient, HostRuntime, PaintElementType, Rect,
    RenderHost, WindowInfo,
};
use crate::launch::{GpuPreference, LaunchConfig};
use crate::{Error, Framerate, Result};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// When the redraw loop requests a full repaint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidateWhen {
    /// Once the main frame has finished loading
    PageLoaded,
    Always,
    Never,
}

/// Redraw-loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedrawPolicy {
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub invalidate: InvalidateWhen,
    /// Log a heartbeat every N iterations (0 disables)
    pub heartbeat_every: u64,
}

impl Default for RedrawPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            invalidate: InvalidateWhen::PageLoaded,
            heartbeat_every: 60,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Everything needed to start one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    pub gpu: GpuPreference,
    pub single_process: bool,
    pub redraw: RedrawPolicy,
}

/// A main-frame navigation failure, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub code: i32,
    pub message: String,
    pub url: String,
}

/// Adapter receiving all host callbacks for one browser
pub struct SessionClient {
    host: Arc<dyn RenderHost>,
    bridge: Arc<FrameBridge>,
    width: u32,
    height: u32,
    page_loaded: AtomicBool,
    closed: AtomicBool,
    browser: Mutex<Option<BrowserHandle>>,
    load_errors: Mutex<Vec<LoadError>>,
    paints: AtomicU64,
}

impl SessionClient {
    fn new(host: Arc<dyn RenderHost>, bridge: Arc<FrameBridge>, width: u32, height: u32) -> Self {
        Self {
            host,
            bridge,
            width,
            height,
            page_loaded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            browser: Mutex::new(None),
            load_errors: Mutex::new(Vec::new()),
            paints: AtomicU64::new(0),
        }
    }

    fn lock_browser(&self) -> MutexGuard<'_, Option<BrowserHandle>> {
        self.browser.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take ownership of a freshly created browser
    fn adopt(&self, id: BrowserId) {
        let handle = BrowserHandle::adopt(self.host.clone(), id);
        // `closed` is only flipped under the browser lock
        let mut slot = self.lock_browser();
        if self.closed.load(Ordering::Acquire) {
            drop(slot);
            debug!("{} arrived after stop, closing", id);
            handle.close(true);
            return;
        }
        if slot.is_some() {
            drop(slot);
            warn!("Ignoring second browser {} for one session", id);
            handle.close(true);
            return;
        }
        debug!("Captured {}", id);
        *slot = Some(handle);
    }

    pub fn browser_id(&self) -> Option<BrowserId> {
        self.lock_browser().as_ref().map(BrowserHandle::id)
    }

    pub fn page_loaded(&self) -> bool {
        self.page_loaded.load(Ordering::Acquire)
    }

    pub fn load_errors(&self) -> Vec<LoadError> {
        self.load_errors.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn paint_count(&self) -> u64 {
        self.paints.load(Ordering::Relaxed)
    }

    fn should_invalidate(&self, when: InvalidateWhen) -> bool {
        match when {
            InvalidateWhen::PageLoaded => self.page_loaded(),
            InvalidateWhen::Always => true,
            InvalidateWhen::Never => false,
        }
    }

    /// Request a full view repaint; a no-op without a captured browser
    fn invalidate(&self) {
        if let Some(id) = self.browser_id() {
            self.host.invalidate(id, PaintElementType::View);
        }
    }

    /// Mark closed and close the browser, if any
    fn shutdown(&self) {
        let handle = {
            let mut slot = self.lock_browser();
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(handle) = handle {
            debug!("Closing {}", handle.id());
            handle.close(true);
        }
    }
}

impl HostClient for SessionClient {
    fn view_rect(&self) -> Rect {
        Rect { x: 0, y: 0, width: self.width, height: self.height }
    }

    fn on_paint(&self, element: PaintElementType, buffer: &[u8], width: u32, height: u32) {
        if element != PaintElementType::View || self.closed.load(Ordering::Acquire) {
            return;
        }
        self.paints.fetch_add(1, Ordering::Relaxed);
        if let PublishOutcome::Dropped(reason) = self.bridge.publish(buffer, width, height) {
            trace!("Dropped paint {}x{}: {:?}", width, height, reason);
        }
    }

    fn on_load_end(&self, is_main_frame: bool, http_status: i32) {
        if is_main_frame {
            info!("Page loaded (HTTP {})", http_status);
            self.page_loaded.store(true, Ordering::Release);
        }
    }

    fn on_load_error(&self, is_main_frame: bool, code: i32, message: &str, failed_url: &str) {
        if !is_main_frame {
            return;
        }
        warn!("Load error: {} ({}) - {}", message, code, failed_url);
        self.load_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(LoadError {
                code,
                message: message.to_string(),
                url: failed_url.to_string(),
            });
    }

    fn on_browser_created(&self, browser: BrowserId) {
        self.adopt(browser);
    }
}

/// Owns one browser, its client and the redraw-loop thread.
pub struct RenderHostSession {
    runtime: Arc<HostRuntime>,
    bridge: Arc<FrameBridge>,
    state: SessionState,
    client: Option<Arc<SessionClient>>,
    redraw_thread: Option<JoinHandle<()>>,
    launch: Option<LaunchConfig>,
}

impl RenderHostSession {
    pub fn new(runtime: Arc<HostRuntime>, bridge: Arc<FrameBridge>) -> Self {
        Self {
            runtime,
            bridge,
            state: SessionState::Idle,
            client: None,
            redraw_thread: None,
            launch: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> Option<&Arc<SessionClient>> {
        self.client.as_ref()
    }

    /// Launch config the host was initialized with
    pub fn launch_config(&self) -> Option<&LaunchConfig> {
        self.launch.as_ref()
    }

    /// Start the browser and the redraw loop.
    ///
    /// Rejected with [`Error::AlreadyRunning`] unless the session is idle.
    /// Any failure rolls back what was already created.
    pub fn start(&mut self, params: &SessionParams) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::AlreadyRunning);
        }
        self.state = SessionState::Starting;

        match self.try_start(params) {
            Ok(()) => {
                self.state = SessionState::Running;
                info!("Session started for {}", params.url);
                Ok(())
            }
            Err(e) => {
                warn!("Session start failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn try_start(&mut self, params: &SessionParams) -> Result<()> {
        let launch = self
            .runtime
            .ensure_initialized(params.gpu, params.single_process)?;

        let host = self.runtime.host().clone();
        let client = Arc::new(SessionClient::new(
            host.clone(),
            self.bridge.clone(),
            params.width,
            params.height,
        ));
        self.client = Some(client.clone());
        self.bridge.set_running(true);

        let window = WindowInfo::windowless();
        let settings = BrowserSettings {
            windowless_frame_rate: params.framerate.rounded_fps(),
        };
        if launch.single_process {
            let id = host
                .create_browser_sync(&window, client.clone(), &params.url, &settings)
                .map_err(into_create_error)?;
            client.adopt(id);
        } else {
            host.create_browser(&window, client.clone(), &params.url, &settings)
                .map_err(into_create_error)?;
        }
        self.launch = Some(launch);

        let bridge = self.bridge.clone();
        let policy = params.redraw;
        let handle = thread::Builder::new()
            .name("cef-message-loop".to_string())
            .spawn(move || redraw_loop(host, bridge, client, policy))
            .map_err(Error::ThreadSpawn)?;
        self.redraw_thread = Some(handle);
        Ok(())
    }

    /// Stop the redraw loop and close the browser. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle && self.client.is_none() {
            return;
        }
        self.state = SessionState::Stopping;
        self.teardown();
        info!("Session stopped");
    }

    fn teardown(&mut self) {
        self.bridge.set_running(false);

        if let Some(handle) = self.redraw_thread.take() {
            if handle.join().is_err() {
                warn!("Redraw thread panicked");
            }
        }
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        self.launch = None;
        self.state = SessionState::Idle;
    }
}

impl Drop for RenderHostSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn into_create_error(e: Error) -> Error {
    match e {
        Error::BrowserCreate(_) => e,
        other => Error::BrowserCreate(other.to_string()),
    }
}

fn redraw_loop(
    host: Arc<dyn RenderHost>,
    bridge: Arc<FrameBridge>,
    client: Arc<SessionClient>,
    policy: RedrawPolicy,
) {
    debug!("Redraw loop started");
    let mut iterations: u64 = 0;
    while bridge.is_running() {
        iterations += 1;
        redraw_step(host.as_ref(), &client, &policy, iterations);
        thread::sleep(policy.poll_interval);
    }
    debug!("Redraw loop exited after {} iterations", iterations);
}

/// One loop iteration without the pacing sleep: pump host work, then
/// request a repaint if the policy says so.
fn redraw_step(
    host: &dyn RenderHost,
    client: &SessionClient,
    policy: &RedrawPolicy,
    iteration: u64,
) {
    host.do_message_loop_work();
    if policy.heartbeat_every > 0 && iteration % policy.heartbeat_every == 0 {
        trace!(
            "Redraw iteration #{} (page_loaded={}, browser={:?})",
            iteration,
            client.page_loaded(),
            client.browser_id()
        );
    }
    if client.should_invalidate(policy.invalidate) {
        client.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Consumed;
    use crate::gpu::DeviceScanner;
    use crate::launch::Environment;
    use crate::pattern::PatternHost;
    use crate::settings::HostSettings;

    fn setup() -> (Arc<PatternHost>, RenderHostSession, Arc<FrameBridge>) {
        let host = Arc::new(PatternHost::new());
        let tmp = std::env::temp_dir();
        let runtime = Arc::new(
            HostRuntime::new(host.clone())
                .with_scanner(DeviceScanner::new(tmp.join("chromiumsrc-no-such-dri")))
                .with_environment(Environment::headless())
                .with_settings(HostSettings::in_memory(tmp)),
        );
        let bridge = Arc::new(FrameBridge::new());
        bridge.allocate(16, 8).unwrap();
        let session = RenderHostSession::new(runtime, bridge.clone());
        (host, session, bridge)
    }

    fn params() -> SessionParams {
        SessionParams {
            url: "http://x".to_string(),
            width: 16,
            height: 8,
            framerate: Framerate::new(30, 1),
            gpu: GpuPreference::Auto,
            single_process: false,
            redraw: RedrawPolicy {
                poll_interval: Duration::from_millis(2),
                ..RedrawPolicy::default()
            },
        }
    }

    #[test]
    fn start_produces_frames_and_stop_releases() {
        let (host, mut session, bridge) = setup();
        session.start(&params()).unwrap();
        assert_eq!(session.state(), SessionState::Running);

        match bridge.consume(Duration::from_secs(2)) {
            Consumed::Frame(f) => assert_eq!((f.width, f.height), (16, 8)),
            other => panic!("expected frame, got {:?}", other),
        }
        let client = session.client().cloned().unwrap();
        assert!(client.page_loaded());
        let id = client.browser_id().unwrap();
        assert_eq!(host.ref_count(id), 1);

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!bridge.is_running());
        assert_eq!(host.ref_count(id), 0);
        assert!(host.is_closed(id));
        assert_eq!(client.browser_id(), None);

        // Second stop is a no-op
        session.stop();
    }

    #[test]
    fn start_twice_is_rejected() {
        let (_host, mut session, _bridge) = setup();
        session.start(&params()).unwrap();
        assert!(matches!(session.start(&params()), Err(Error::AlreadyRunning)));
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn browser_creation_failure_rolls_back() {
        let (host, mut session, bridge) = setup();
        host.fail_next_create();
        let err = session.start(&params()).unwrap_err();
        assert!(matches!(err, Error::BrowserCreate(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.client().is_none());
        assert!(!bridge.is_running());
        assert_eq!(host.live_refs(), 0);

        // The session can start cleanly afterwards
        session.start(&params()).unwrap();
    }

    #[test]
    fn single_process_creates_synchronously() {
        let (host, mut session, _bridge) = setup();
        let mut p = params();
        p.single_process = true;
        session.start(&p).unwrap();
        let client = session.client().cloned().unwrap();
        // Captured before the redraw loop ran anything
        assert!(client.browser_id().is_some());
        assert!(session.launch_config().unwrap().single_process);
        session.stop();
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn late_browser_after_stop_is_closed() {
        let host = Arc::new(PatternHost::new());
        let bridge = Arc::new(FrameBridge::new());
        let client = SessionClient::new(host.clone(), bridge, 4, 4);
        client.shutdown();
        client.on_browser_created(BrowserId(42));
        assert_eq!(client.browser_id(), None);
        assert_eq!(host.ref_count(BrowserId(42)), 0);
        assert!(host.is_closed(BrowserId(42)));
        // Paints after shutdown are absorbed
        client.on_paint(PaintElementType::View, &[0; 64], 4, 4);
        assert_eq!(client.paint_count(), 0);
    }

    #[test]
    fn load_errors_are_recorded_not_fatal() {
        let host = Arc::new(PatternHost::new());
        let bridge = Arc::new(FrameBridge::new());
        let client = SessionClient::new(host, bridge, 4, 4);
        client.on_load_error(false, -2, "sub frame", "http://x/ad");
        client.on_load_error(true, -105, "ERR_NAME_NOT_RESOLVED", "http://x");
        client.on_load_end(true, 0);
        let errors = client.load_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, -105);
        assert!(client.page_loaded());
    }

    #[test]
    fn never_invalidate_produces_only_host_triggered_paints() {
        let (host, mut session, bridge) = setup();
        let mut p = params();
        p.redraw.invalidate = InvalidateWhen::Never;
        session.start(&p).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        session.stop();
        // The pattern host paints once on load by itself
        assert_eq!(host.invalidations(), 0);
        assert!(bridge.stats().published <= 1);
    }

    fn stepped_client(host: &Arc<PatternHost>) -> Arc<SessionClient> {
        let bridge = Arc::new(FrameBridge::new());
        bridge.allocate(4, 4).unwrap();
        bridge.set_running(true);
        let client = Arc::new(SessionClient::new(host.clone(), bridge, 4, 4));
        let settings = BrowserSettings { windowless_frame_rate: 30 };
        let id = host
            .create_browser_sync(&WindowInfo::windowless(), client.clone(), "http://x", &settings)
            .unwrap();
        client.adopt(id);
        client
    }

    #[test]
    fn page_loaded_policy_waits_for_load_end() {
        let host = Arc::new(PatternHost::new());
        host.hold_page_load(true);
        let client = stepped_client(&host);
        let policy = RedrawPolicy::default();

        for i in 1..=5 {
            redraw_step(host.as_ref(), &client, &policy, i);
        }
        assert!(!client.page_loaded());
        assert_eq!(host.invalidations(), 0);
        assert_eq!(client.paint_count(), 0);

        host.hold_page_load(false);
        redraw_step(host.as_ref(), &client, &policy, 6);
        assert!(client.page_loaded());
        assert_eq!(host.invalidations(), 1);
        assert_eq!(client.paint_count(), 1);

        // Every later step paints the previous invalidation and asks again
        redraw_step(host.as_ref(), &client, &policy, 7);
        assert_eq!(client.paint_count(), 2);
        assert_eq!(host.invalidations(), 2);

        client.shutdown();
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn always_policy_invalidates_before_load() {
        let host = Arc::new(PatternHost::new());
        host.hold_page_load(true);
        let client = stepped_client(&host);
        let policy = RedrawPolicy { invalidate: InvalidateWhen::Always, ..RedrawPolicy::default() };

        redraw_step(host.as_ref(), &client, &policy, 1);
        redraw_step(host.as_ref(), &client, &policy, 2);
        assert!(!client.page_loaded());
        assert_eq!(host.invalidations(), 2);
        assert_eq!(client.paint_count(), 1);
        client.shutdown();
    }

    #[test]
    fn concurrent_adopt_and_shutdown_never_leak() {
        for round in 0..200u64 {
            let host = Arc::new(PatternHost::new());
            let client = Arc::new(SessionClient::new(host.clone(), Arc::new(FrameBridge::new()), 4, 4));
            let id = BrowserId(round + 1);
            let gate = Arc::new(std::sync::Barrier::new(2));

            let creator = {
                let (client, gate) = (client.clone(), gate.clone());
                std::thread::spawn(move || {
                    gate.wait();
                    client.on_browser_created(id);
                })
            };
            gate.wait();
            client.shutdown();
            creator.join().unwrap();

            assert_eq!(client.browser_id(), None, "round {}", round);
            assert_eq!(host.ref_count(id), 0, "round {}", round);
            assert!(host.is_closed(id), "round {}", round);
        }
    }

    #[test]
    fn redraw_policy_serde_uses_millis() {
        let json = serde_json::to_string(&RedrawPolicy::default()).unwrap();
        assert!(json.contains("\"poll_interval\":10"));
        let back: RedrawPolicy = serde_json::from_str(r#"{"poll_interval":5,"invalidate":"always"}"#).unwrap();
        assert_eq!(back.poll_interval, Duration::from_millis(5));
        assert_eq!(back.invalidate, InvalidateWhen::Always);
        assert_eq!(back.heartbeat_every, 60);
    }
}
