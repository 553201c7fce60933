//! Software test-pattern rendering host.
//!
//! Implements the full host contract without a browser engine: it records
//! the command lines it would launch processes with, delivers the
//! browser-created and load-end callbacks from its message-loop step, and
//! paints a moving BGRA pattern whenever a browser is invalidated. Browser
//! reference counts are tracked so leaks are observable.

use crate::bridge::frame_size;
use crate::host::{
    AppHandler, BrowserId, BrowserSettings, HostClient, PaintElementType, RenderHost, WindowInfo,
};
use crate::launch::CommandLine;
use crate::settings::HostSettings;
use crate::{Error, Result};
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Child process types whose launch the host simulates during init
const SIMULATED_CHILDREN: &[&str] = &["renderer", "gpu-process", "utility"];

struct PatternBrowser {
    // Dropped on close, like the host releasing its client reference
    client: Option<Arc<dyn HostClient>>,
    url: String,
    announced: bool,
    loaded: bool,
    invalidated: bool,
    closed: bool,
    frames: u64,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    browsers: BTreeMap<BrowserId, PatternBrowser>,
    refs: BTreeMap<BrowserId, i64>,
    closed: Vec<BrowserId>,
    browser_command_line: Option<CommandLine>,
    child_command_lines: Vec<(String, CommandLine)>,
    settings: Option<HostSettings>,
}

enum Action {
    Created(Arc<dyn HostClient>, BrowserId),
    Loaded(Arc<dyn HostClient>),
    Paint(Arc<dyn HostClient>, u64),
}

/// A deterministic in-process rendering host
#[derive(Default)]
pub struct PatternHost {
    state: Mutex<HostState>,
    init_count: AtomicU64,
    invalidations: AtomicU64,
    fail_initialize: AtomicBool,
    fail_create: AtomicBool,
    load_status: Mutex<Option<(i32, String)>>,
    hold_load: AtomicBool,
}

impl PatternHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `initialize` fail
    pub fn fail_next_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    /// Make the next browser creation fail
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Report the next navigations as failed with `code`
    pub fn fail_navigation(&self, code: i32, message: &str) {
        *self.load_status.lock().unwrap_or_else(|p| p.into_inner()) =
            Some((code, message.to_string()));
    }

    /// While held, browsers never finish loading (no load-end, no first paint)
    pub fn hold_page_load(&self, hold: bool) {
        self.hold_load.store(hold, Ordering::SeqCst);
    }

    pub fn init_count(&self) -> u64 {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// References held on `id` through `add_ref`/`release`
    pub fn ref_count(&self, id: BrowserId) -> i64 {
        self.lock().refs.get(&id).copied().unwrap_or(0)
    }

    /// Sum of all outstanding references
    pub fn live_refs(&self) -> i64 {
        self.lock().refs.values().sum()
    }

    pub fn is_closed(&self, id: BrowserId) -> bool {
        self.lock().closed.contains(&id)
    }

    pub fn browser_count(&self) -> usize {
        self.lock().browsers.len()
    }

    pub fn url_of(&self, id: BrowserId) -> Option<String> {
        self.lock().browsers.get(&id).map(|b| b.url.clone())
    }

    /// Command line the browser process was initialized with
    pub fn browser_command_line(&self) -> Option<CommandLine> {
        self.lock().browser_command_line.clone()
    }

    /// Command lines of the simulated child processes
    pub fn child_command_lines(&self) -> Vec<(String, CommandLine)> {
        self.lock().child_command_lines.clone()
    }

    pub fn settings(&self) -> Option<HostSettings> {
        self.lock().settings.clone()
    }

    fn register(&self, client: Arc<dyn HostClient>, url: &str, announced: bool) -> Result<BrowserId> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::BrowserCreate("pattern host refused browser".into()));
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = BrowserId(state.next_id);
        state.browsers.insert(
            id,
            PatternBrowser {
                client: Some(client),
                url: url.to_string(),
                announced,
                loaded: false,
                invalidated: false,
                closed: false,
                frames: 0,
            },
        );
        debug!("Pattern host created {} for {}", id, url);
        Ok(id)
    }

    fn paint(client: &Arc<dyn HostClient>, frame: u64) {
        let rect = client.view_rect();
        let Some(size) = frame_size(rect.width, rect.height) else {
            return;
        };
        let mut pixels = vec![0u8; size];
        let shift = frame as usize;
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            let x = i % rect.width.max(1) as usize;
            let y = i / rect.width.max(1) as usize;
            // BGRA: diagonal bands moving one pixel per frame
            px[0] = ((x + shift) & 0xff) as u8;
            px[1] = ((y + shift) & 0xff) as u8;
            px[2] = ((x + y) & 0xff) as u8;
            px[3] = 0xff;
        }
        client.on_paint(PaintElementType::View, &pixels, rect.width, rect.height);
    }
}

impl RenderHost for PatternHost {
    fn initialize(&self, settings: &HostSettings, app: Arc<dyn AppHandler>) -> Result<()> {
        if self.fail_initialize.swap(false, Ordering::SeqCst) {
            return Err(Error::HostInit("pattern host refused to initialize".into()));
        }
        let mut browser_cmd = CommandLine::new();
        app.on_before_command_line_processing("", &mut browser_cmd);

        let children: Vec<(String, CommandLine)> = SIMULATED_CHILDREN
            .iter()
            .map(|t| {
                let mut cmd = CommandLine::new();
                cmd.append_switch_with_value("type", t);
                app.on_before_child_process_launch(t, &mut cmd);
                (t.to_string(), cmd)
            })
            .collect();

        let mut state = self.lock();
        state.browser_command_line = Some(browser_cmd);
        state.child_command_lines = children;
        state.settings = Some(settings.clone());
        drop(state);

        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_browser(
        &self,
        _window: &WindowInfo,
        client: Arc<dyn HostClient>,
        url: &str,
        _settings: &BrowserSettings,
    ) -> Result<()> {
        self.register(client, url, false).map(|_| ())
    }

    fn create_browser_sync(
        &self,
        _window: &WindowInfo,
        client: Arc<dyn HostClient>,
        url: &str,
        _settings: &BrowserSettings,
    ) -> Result<BrowserId> {
        self.register(client, url, true)
    }

    fn do_message_loop_work(&self) {
        let failure = self.load_status.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let hold_load = self.hold_load.load(Ordering::SeqCst);
        let mut actions = Vec::new();
        {
            let mut state = self.lock();
            for (id, b) in state.browsers.iter_mut() {
                let Some(client) = b.client.clone() else {
                    continue;
                };
                if !b.announced {
                    b.announced = true;
                    actions.push(Action::Created(client, *id));
                    continue;
                }
                if !b.loaded && !hold_load {
                    b.loaded = true;
                    actions.push(Action::Loaded(client.clone()));
                    // First paint happens without an invalidation
                    b.invalidated = true;
                }
                if b.invalidated {
                    b.invalidated = false;
                    actions.push(Action::Paint(client, b.frames));
                    b.frames += 1;
                }
            }
        }

        // Callbacks run without the host lock held
        for action in actions {
            match action {
                Action::Created(client, id) => client.on_browser_created(id),
                Action::Loaded(client) => {
                    if let Some((code, message)) = &failure {
                        client.on_load_error(true, *code, message, "");
                    }
                    client.on_load_end(true, if failure.is_some() { 0 } else { 200 });
                }
                Action::Paint(client, frame) => Self::paint(&client, frame),
            }
        }
    }

    fn invalidate(&self, browser: BrowserId, element: PaintElementType) {
        if element != PaintElementType::View {
            return;
        }
        if let Some(b) = self.lock().browsers.get_mut(&browser) {
            if !b.closed {
                b.invalidated = true;
                self.invalidations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn close_browser(&self, browser: BrowserId, force_close: bool) {
        let mut state = self.lock();
        let client = state.browsers.get_mut(&browser).and_then(|b| {
            b.closed = true;
            b.client.take()
        });
        if !state.closed.contains(&browser) {
            state.closed.push(browser);
        }
        drop(state);
        // The client may hold the last references back into this host
        drop(client);
        debug!("Pattern host closed {} (force={})", browser, force_close);
    }

    fn add_ref(&self, browser: BrowserId) {
        *self.lock().refs.entry(browser).or_insert(0) += 1;
    }

    fn release(&self, browser: BrowserId) {
        *self.lock().refs.entry(browser).or_insert(0) -= 1;
    }
}
