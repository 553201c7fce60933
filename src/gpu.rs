//! GPU capability probing.
//!
//! Render nodes live under `/dev/dri` as `renderD<N>`. The highest numbered
//! node is treated as the preferred device (most capable or most recently
//! attached). Detection runs at most once per [`GpuConfig`]; callers check
//! [`GpuConfig::is_detected`] before calling [`GpuConfig::detect`] again.

use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Platform directory holding DRM device nodes
pub const DEFAULT_DEVICE_DIR: &str = "/dev/dri";

const RENDER_NODE_PREFIX: &str = "renderD";

/// Index of a DRM render node (`renderD128` => 128)
pub type DeviceId = u32;

/// Scans a device directory for render nodes.
///
/// The directory is configurable so tests can point it at a temporary tree.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    dir: PathBuf,
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_DIR)
    }
}

impl DeviceScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the node for `device`
    pub fn device_path(&self, device: DeviceId) -> PathBuf {
        self.dir.join(format!("{}{}", RENDER_NODE_PREFIX, device))
    }

    /// Return the highest render node index in the directory, or `None` when
    /// the directory is missing or holds no render nodes.
    pub fn detect_best_device(&self) -> Option<DeviceId> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot open {}: {}", self.dir.display(), e);
                return None;
            }
        };

        let names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();

        let best = best_render_node(names.iter().map(String::as_str));
        debug!(
            "Scanned {} ({} entries), best render node: {:?}",
            self.dir.display(),
            names.len(),
            best
        );
        best
    }

    /// True iff the directory exists and holds at least one render node
    pub fn is_available(&self) -> bool {
        self.dir.is_dir() && self.detect_best_device().is_some()
    }
}

/// Pick the highest `renderD<N>` index from a set of directory entry names.
///
/// Independent of the order entries are supplied in.
pub fn best_render_node<'a, I>(names: I) -> Option<DeviceId>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(parse_render_node)
        .max()
}

fn parse_render_node(name: &str) -> Option<DeviceId> {
    let digits = name.strip_prefix(RENDER_NODE_PREFIX)?;
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

/// Detect the best device in the default platform directory
pub fn detect_best_device() -> Option<DeviceId> {
    DeviceScanner::default().detect_best_device()
}

/// True iff the default platform directory holds a render node
pub fn is_available() -> bool {
    DeviceScanner::default().is_available()
}

/// Resolved GPU selection for the process
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GpuConfig {
    pub enabled: bool,
    pub device_index: Option<DeviceId>,
    pub device_path: Option<PathBuf>,
    #[serde(skip)]
    detected: bool,
}

impl GpuConfig {
    /// A config with acceleration disabled and no device
    pub fn new() -> Self {
        Self::default()
    }

    /// A config explicitly marked as resolved without probing (used when the
    /// user forces acceleration off).
    pub fn disabled() -> Self {
        Self {
            detected: true,
            ..Self::default()
        }
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    /// Populate the config from `scanner`.
    ///
    /// When no device exists the config is explicitly reset so no stale
    /// device path survives.
    pub fn detect(&mut self, scanner: &DeviceScanner) {
        self.detected = true;
        match scanner.detect_best_device() {
            Some(index) => {
                let path = scanner.device_path(index);
                debug!("GPU detected and enabled: {}", path.display());
                if !path.exists() {
                    // Enumeration raced with removal; not fatal
                    warn!("GPU device node {} does not exist", path.display());
                }
                self.enabled = true;
                self.device_index = Some(index);
                self.device_path = Some(path);
            }
            None => {
                debug!("No GPU render node found, GPU disabled");
                self.enabled = false;
                self.device_index = None;
                self.device_path = None;
            }
        }
    }
}
