//! Contract with the external offscreen rendering host.
//!
//! The host is driven only through [`RenderHost`] and reports back through
//! [`HostClient`] (paint, load and lifespan callbacks) and [`AppHandler`]
//! (command-line hooks for the browser process and its children).
//!
//! [`HostRuntime`] performs the process-wide one-time initialization. It is
//! an injected service object rather than a global, so tests can run
//! against a fake host.

use crate::gpu::{DeviceScanner, GpuConfig};
use crate::launch::{
    log_display_environment, CommandLine, Environment, GpuPreference, LaunchConfig, LaunchPolicy,
    ProcessRole,
};
use crate::settings::HostSettings;
use crate::{Error, Result};
use log::{debug, info};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Host-assigned browser identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrowserId(pub u64);

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browser#{}", self.0)
    }
}

/// Surface a paint or invalidation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintElementType {
    View,
    Popup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// How the browser is hosted; always windowless here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub windowless: bool,
    pub parent: u64,
}

impl WindowInfo {
    pub fn windowless() -> Self {
        Self { windowless: true, parent: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserSettings {
    /// Upper bound on the host's own paint rate
    pub windowless_frame_rate: u32,
}

/// Command-line hooks the host invokes before launching processes
pub trait AppHandler: Send + Sync {
    /// Called for the process being initialized; `process_type` is empty for
    /// the browser process.
    fn on_before_command_line_processing(&self, process_type: &str, cmd: &mut CommandLine);

    /// Called before the host spawns a renderer, GPU or utility process
    fn on_before_child_process_launch(&self, process_type: &str, cmd: &mut CommandLine);
}

/// Callbacks the host dispatches for one browser
pub trait HostClient: Send + Sync {
    /// Size of the offscreen surface
    fn view_rect(&self) -> Rect;

    /// A full BGRA frame is available. Called on a host thread.
    fn on_paint(&self, element: PaintElementType, buffer: &[u8], width: u32, height: u32);

    /// A navigation finished, successfully or not
    fn on_load_end(&self, is_main_frame: bool, http_status: i32);

    /// A navigation failed
    fn on_load_error(&self, is_main_frame: bool, code: i32, message: &str, failed_url: &str);

    /// The browser created by an asynchronous `create_browser` is ready
    fn on_browser_created(&self, browser: BrowserId);
}

/// The offscreen rendering host
pub trait RenderHost: Send + Sync {
    /// Global initialization. Runs at most once per process.
    fn initialize(&self, settings: &HostSettings, app: Arc<dyn AppHandler>) -> Result<()>;

    /// Create a browser; the handle arrives later via
    /// [`HostClient::on_browser_created`].
    fn create_browser(
        &self,
        window: &WindowInfo,
        client: Arc<dyn HostClient>,
        url: &str,
        settings: &BrowserSettings,
    ) -> Result<()>;

    /// Create a browser and return its handle immediately
    fn create_browser_sync(
        &self,
        window: &WindowInfo,
        client: Arc<dyn HostClient>,
        url: &str,
        settings: &BrowserSettings,
    ) -> Result<BrowserId>;

    /// Run one step of pending host work
    fn do_message_loop_work(&self);

    /// Request a full repaint of `element`
    fn invalidate(&self, browser: BrowserId, element: PaintElementType);

    fn close_browser(&self, browser: BrowserId, force_close: bool);

    fn add_ref(&self, browser: BrowserId);

    fn release(&self, browser: BrowserId);
}

/// Owning reference to a host browser.
///
/// Holds exactly one host reference, taken in [`BrowserHandle::adopt`] and
/// given back on drop.
pub struct BrowserHandle {
    host: Arc<dyn RenderHost>,
    id: BrowserId,
}

impl BrowserHandle {
    pub(crate) fn adopt(host: Arc<dyn RenderHost>, id: BrowserId) -> Self {
        host.add_ref(id);
        Self { host, id }
    }

    pub fn id(&self) -> BrowserId {
        self.id
    }

    pub fn invalidate(&self, element: PaintElementType) {
        self.host.invalidate(self.id, element);
    }

    /// Close the browser and drop the reference
    pub fn close(self, force_close: bool) {
        self.host.close_browser(self.id, force_close);
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        self.host.release(self.id);
    }
}

impl fmt::Debug for BrowserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserHandle").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct InitState {
    launch: Option<LaunchConfig>,
}

/// Process-wide host service: GPU detection and one-time initialization.
pub struct HostRuntime {
    host: Arc<dyn RenderHost>,
    scanner: DeviceScanner,
    environment: Environment,
    settings: Option<HostSettings>,
    gpu: OnceLock<GpuConfig>,
    init: Mutex<InitState>,
}

impl HostRuntime {
    pub fn new(host: Arc<dyn RenderHost>) -> Self {
        Self {
            host,
            scanner: DeviceScanner::default(),
            environment: Environment::from_process(),
            settings: None,
            gpu: OnceLock::new(),
            init: Mutex::new(InitState::default()),
        }
    }

    pub fn with_scanner(mut self, scanner: DeviceScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Use fixed settings instead of probing the process at init time
    pub fn with_settings(mut self, settings: HostSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn host(&self) -> &Arc<dyn RenderHost> {
        &self.host
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// GPU selection, resolved on first use and fixed for the runtime's life.
    ///
    /// Later calls return the first result regardless of `preference`.
    pub fn gpu_config(&self, preference: GpuPreference) -> &GpuConfig {
        self.gpu.get_or_init(|| {
            let config = match preference {
                GpuPreference::Off => GpuConfig::disabled(),
                GpuPreference::On | GpuPreference::Auto => {
                    let mut config = GpuConfig::new();
                    if self.scanner.is_available() {
                        config.detect(&self.scanner);
                    } else {
                        config = GpuConfig::disabled();
                    }
                    config
                }
            };
            debug!(
                "GPU config: enabled={} device={}",
                config.enabled,
                config
                    .device_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            config
        })
    }

    /// Launch policy for the given preference and topology
    pub fn policy(&self, preference: GpuPreference, single_process: bool) -> LaunchPolicy {
        LaunchPolicy {
            preference,
            gpu_available: self.gpu_config(preference).enabled,
            display_attached: self.environment.display_attached(),
            single_process,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_init().launch.is_some()
    }

    /// Browser-process launch config, once initialized
    pub fn launch_config(&self) -> Option<LaunchConfig> {
        self.lock_init().launch.clone()
    }

    /// Initialize the host once.
    ///
    /// The first caller performs the setup under the lock; later callers get
    /// the already-resolved browser launch config back. A failed init leaves
    /// the runtime uninitialized.
    pub fn ensure_initialized(
        &self,
        preference: GpuPreference,
        single_process: bool,
    ) -> Result<LaunchConfig> {
        let mut state = self.lock_init();
        if let Some(launch) = &state.launch {
            debug!("Rendering host already initialized");
            return Ok(launch.clone());
        }

        log_display_environment(&self.environment);
        let policy = self.policy(preference, single_process);
        let launch = policy.resolve_for(ProcessRole::Browser);
        let settings = match &self.settings {
            Some(s) => s.clone(),
            None => HostSettings::for_current_process()?,
        };

        info!(
            "Initializing rendering host (accelerated={}, headless={}, single_process={})",
            launch.accelerated, launch.headless, launch.single_process
        );
        self.host
            .initialize(&settings, Arc::new(policy))
            .map_err(|e| match e {
                Error::HostInit(_) => e,
                other => Error::HostInit(other.to_string()),
            })?;

        state.launch = Some(launch.clone());
        Ok(launch)
    }

    fn lock_init(&self) -> std::sync::MutexGuard<'_, InitState> {
        // The guarded state is a plain Option; a panic mid-init leaves it unset
        self.init.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRuntime")
            .field("scanner", &self.scanner)
            .field("environment", &self.environment)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
