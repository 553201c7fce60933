//! Process-wide settings handed to the rendering host at initialization.

use crate::Result;
use log::{debug, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Default location of the helper binary used for host subprocesses
pub const DEFAULT_SUBPROCESS_PATH: &str = "/usr/local/lib/chromiumsrc-subprocess";

/// Host log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Verbose,
    Info,
    Warning,
    Error,
    Disable,
}

/// Settings for the one-time host initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSettings {
    pub windowless_rendering_enabled: bool,
    /// The host's message loop is pumped by the redraw thread instead
    pub multi_threaded_message_loop: bool,
    pub no_sandbox: bool,
    pub log_severity: LogSeverity,
    pub browser_subprocess_path: PathBuf,
    pub cache_path: PathBuf,
    pub resources_dir_path: Option<PathBuf>,
}

impl HostSettings {
    /// Settings for this process.
    ///
    /// Creates the per-process cache directory and searches the standard
    /// locations for host resources.
    pub fn for_current_process() -> Result<Self> {
        let cache_path = std::env::temp_dir().join(format!("chromiumsrc-{}", std::process::id()));
        create_private_dir(&cache_path)?;
        let resources_dir_path = find_resources_dir(&resource_search_paths());
        if resources_dir_path.is_none() {
            warn!("No host resources directory (Resources/icudtl.dat) found");
        }
        Ok(Self {
            windowless_rendering_enabled: true,
            multi_threaded_message_loop: false,
            no_sandbox: true,
            log_severity: LogSeverity::Warning,
            browser_subprocess_path: PathBuf::from(DEFAULT_SUBPROCESS_PATH),
            cache_path,
            resources_dir_path,
        })
    }

    /// Settings that touch nothing on disk
    pub fn in_memory(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            windowless_rendering_enabled: true,
            multi_threaded_message_loop: false,
            no_sandbox: true,
            log_severity: LogSeverity::Warning,
            browser_subprocess_path: PathBuf::from(DEFAULT_SUBPROCESS_PATH),
            cache_path: cache_path.into(),
            resources_dir_path: None,
        }
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}

/// Candidate roots for the host `Resources/` directory, in priority order
pub fn resource_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for var in ["CHROMIUMSRC_RESOURCES_PATH", "GST_PLUGIN_PATH"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                paths.push(PathBuf::from(v));
            }
        }
    }
    paths.extend(
        [
            "/usr/local/lib/gstreamer-1.0",
            "/usr/lib/gstreamer-1.0",
            "/usr/lib/x86_64-linux-gnu/gstreamer-1.0",
        ]
        .iter()
        .map(PathBuf::from),
    );
    if let Ok(home) = std::env::var("HOME") {
        paths.push(Path::new(&home).join(".local/share/gstreamer-1.0/plugins"));
    }
    paths
}

/// First `<root>/Resources` that contains `icudtl.dat`
pub fn find_resources_dir(roots: &[PathBuf]) -> Option<PathBuf> {
    roots.iter().map(|r| r.join("Resources")).find(|dir| {
        let found = dir.is_dir() && dir.join("icudtl.dat").exists();
        if found {
            debug!("Using host resources at {}", dir.display());
        }
        found
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_dir_requires_icu_data() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        // `a` has Resources/ but no ICU data; `b` is complete
        std::fs::create_dir(a.path().join("Resources")).unwrap();
        std::fs::create_dir(b.path().join("Resources")).unwrap();
        std::fs::write(b.path().join("Resources/icudtl.dat"), b"icu").unwrap();

        let roots = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        assert_eq!(find_resources_dir(&roots), Some(b.path().join("Resources")));
        assert_eq!(find_resources_dir(&roots[..1]), None);
    }

    #[test]
    fn in_memory_settings_defaults() {
        let s = HostSettings::in_memory("/tmp/x");
        assert!(s.windowless_rendering_enabled);
        assert!(!s.multi_threaded_message_loop);
        assert_eq!(s.log_severity, LogSeverity::Warning);
        assert_eq!(s.browser_subprocess_path, PathBuf::from(DEFAULT_SUBPROCESS_PATH));
    }

    #[test]
    fn private_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a/b");
        create_private_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
