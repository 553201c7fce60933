//! Launch configuration for the rendering host and its subprocesses.
//!
//! [`resolve`] is a pure function of the GPU preference, GPU availability,
//! display availability and process role. It runs once for the browser
//! process and again for every child process the host spawns, because
//! children do not inherit the parent's resolved switches.

use crate::host::AppHandler;
use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User GPU preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuPreference {
    /// Use the GPU when one is available
    #[default]
    #[serde(alias = "unset")]
    Auto,
    /// Use the GPU; silently fall back to software when none is available
    #[serde(alias = "true")]
    On,
    /// Never use the GPU
    #[serde(alias = "false")]
    Off,
}

impl FromStr for GpuPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" | "unset" => Ok(Self::Auto),
            "on" | "true" | "1" => Ok(Self::On),
            "off" | "false" | "0" => Ok(Self::Off),
            other => Err(Error::Config(format!("unknown GPU preference '{}'", other))),
        }
    }
}

/// Which process a command line is being prepared for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Browser,
    Renderer,
    Gpu,
    Utility,
    Other(String),
}

impl ProcessRole {
    /// Map a host process-type string (empty for the browser process)
    pub fn from_process_type(process_type: &str) -> Self {
        match process_type {
            "" => Self::Browser,
            "renderer" => Self::Renderer,
            "gpu-process" | "gpu" => Self::Gpu,
            "utility" => Self::Utility,
            other => Self::Other(other.to_string()),
        }
    }

    /// Detect the role from process arguments (`--type=<role>`)
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter()
            .find_map(|a| a.as_ref().strip_prefix("--type=").map(str::to_string))
            .map(|t| Self::from_process_type(&t))
            .unwrap_or(Self::Browser)
    }

    pub fn is_subprocess(&self) -> bool {
        !matches!(self, Self::Browser)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browser => f.write_str("browser"),
            Self::Renderer => f.write_str("renderer"),
            Self::Gpu => f.write_str("gpu-process"),
            Self::Utility => f.write_str("utility"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Snapshot of the environment variables the launch decision depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub display: Option<String>,
    pub wayland_display: Option<String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            display: std::env::var("DISPLAY").ok(),
            wayland_display: std::env::var("WAYLAND_DISPLAY").ok(),
        }
    }

    /// An environment with no display server
    pub fn headless() -> Self {
        Self::default()
    }

    /// Only an X11 display counts as attached
    pub fn display_attached(&self) -> bool {
        self.display.is_some()
    }
}

/// Log the display environment at debug level
pub fn log_display_environment(env: &Environment) {
    debug!("DISPLAY env: {}", env.display.as_deref().unwrap_or("(not set)"));
    debug!(
        "WAYLAND_DISPLAY env: {}",
        env.wayland_display.as_deref().unwrap_or("(not set)")
    );
}

/// A single command-line switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Switch {
    pub name: String,
    pub value: Option<String>,
}

impl Switch {
    pub fn flag(name: &str) -> Self {
        Self { name: name.to_string(), value: None }
    }

    pub fn with_value(name: &str, value: &str) -> Self {
        Self { name: name.to_string(), value: Some(value.to_string()) }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "--{}={}", self.name, v),
            None => write!(f, "--{}", self.name),
        }
    }
}

/// Ordered, append-only command line handed to hooks by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    switches: Vec<Switch>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_switch(&mut self, name: &str) {
        self.switches.push(Switch::flag(name));
    }

    pub fn append_switch_with_value(&mut self, name: &str, value: &str) {
        self.switches.push(Switch::with_value(name, value));
    }

    pub fn has_switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s.name == name)
    }

    pub fn switch_value(&self, name: &str) -> Option<&str> {
        self.switches
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.value.as_deref())
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn to_args(&self) -> Vec<String> {
        self.switches.iter().map(Switch::to_string).collect()
    }
}

/// Inputs to [`resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInputs {
    pub preference: GpuPreference,
    pub gpu_available: bool,
    pub display_attached: bool,
    pub role: ProcessRole,
    pub single_process: bool,
}

/// Concrete launch configuration for one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub accelerated: bool,
    pub headless: bool,
    pub single_process: bool,
    pub role: ProcessRole,
    pub switches: Vec<Switch>,
}

impl LaunchConfig {
    pub fn apply_to(&self, cmd: &mut CommandLine) {
        for s in &self.switches {
            match &s.value {
                Some(v) => cmd.append_switch_with_value(&s.name, v),
                None => cmd.append_switch(&s.name),
            }
        }
    }

    pub fn has_switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s.name == name)
    }
}

const BROWSER_BASELINE: &[&str] = &[
    "disable-extensions",
    "disable-sync",
    "disable-background-networking",
    "no-first-run",
];

const SANDBOX_RELAXATION: &[&str] = &[
    "disable-gpu-sandbox",
    "disable-seccomp-filter-sandbox",
    "no-sandbox",
];

const SINGLE_PROCESS: &[&str] = &["single-process", "disable-zygote", "in-process-gpu"];

/// Resolve the launch configuration for one process.
pub fn resolve(inputs: &LaunchInputs) -> LaunchConfig {
    let accelerated = match inputs.preference {
        GpuPreference::Off => false,
        GpuPreference::On | GpuPreference::Auto => inputs.gpu_available,
    };
    let headless = !inputs.display_attached;
    let is_browser = !inputs.role.is_subprocess();

    let mut switches = Vec::new();
    let flags = |switches: &mut Vec<Switch>, names: &[&str]| {
        switches.extend(names.iter().map(|n| Switch::flag(n)));
    };

    if is_browser {
        flags(&mut switches, BROWSER_BASELINE);
        flags(&mut switches, SANDBOX_RELAXATION);
        switches.push(Switch::with_value("log-severity", "warning"));
        // Topology switches only take effect before host initialization
        if inputs.single_process {
            flags(&mut switches, SINGLE_PROCESS);
        }
    }

    if accelerated {
        switches.push(Switch::with_value("use-gl", "egl-angle"));
        switches.push(Switch::with_value("use-angle", "egl"));
        switches.push(Switch::flag("enable-gpu-rasterization"));
        if is_browser {
            switches.push(Switch::flag("enable-zero-copy"));
        }
        switches.push(Switch::flag("ignore-gpu-blocklist"));
        if headless {
            push_headless_platform(&mut switches);
        }
    } else if headless {
        push_headless_platform(&mut switches);
        switches.push(Switch::flag("disable-gpu"));
        switches.push(Switch::flag("disable-gpu-compositing"));
        if is_browser {
            switches.push(Switch::flag("disable-software-rasterizer"));
        }
    }

    if !is_browser {
        flags(&mut switches, SANDBOX_RELAXATION);
        switches.push(Switch::with_value("log-severity", "warning"));
    }

    debug!(
        "Launch config for {}: accelerated={} headless={} single_process={}",
        inputs.role, accelerated, headless, inputs.single_process
    );

    LaunchConfig {
        accelerated,
        headless,
        single_process: inputs.single_process,
        role: inputs.role.clone(),
        switches,
    }
}

fn push_headless_platform(switches: &mut Vec<Switch>) {
    switches.push(Switch::with_value("ozone-platform", "headless"));
    switches.push(Switch::with_value("headless", "new"));
}

/// Process-level launch policy installed into the rendering host.
///
/// The host calls back into it before processing the browser command line
/// and before every child process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPolicy {
    pub preference: GpuPreference,
    pub gpu_available: bool,
    pub display_attached: bool,
    pub single_process: bool,
}

impl LaunchPolicy {
    pub fn inputs(&self, role: ProcessRole) -> LaunchInputs {
        LaunchInputs {
            preference: self.preference,
            gpu_available: self.gpu_available,
            display_attached: self.display_attached,
            role,
            single_process: self.single_process,
        }
    }

    pub fn resolve_for(&self, role: ProcessRole) -> LaunchConfig {
        resolve(&self.inputs(role))
    }
}

impl AppHandler for LaunchPolicy {
    fn on_before_command_line_processing(&self, process_type: &str, cmd: &mut CommandLine) {
        self.resolve_for(ProcessRole::from_process_type(process_type))
            .apply_to(cmd);
    }

    fn on_before_child_process_launch(&self, process_type: &str, cmd: &mut CommandLine) {
        let role = match ProcessRole::from_process_type(process_type) {
            // A child never gets browser-only switches
            ProcessRole::Browser => ProcessRole::Other("child".to_string()),
            role => role,
        };
        self.resolve_for(role).apply_to(cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pref: GpuPreference, available: bool, display: bool) -> LaunchInputs {
        LaunchInputs {
            preference: pref,
            gpu_available: available,
            display_attached: display,
            role: ProcessRole::Browser,
            single_process: false,
        }
    }

    #[test]
    fn force_off_wins_over_available_gpu() {
        let cfg = resolve(&inputs(GpuPreference::Off, true, true));
        assert!(!cfg.accelerated);
        assert!(!cfg.headless);
        // Display attached, software: no rendering switches at all
        assert!(!cfg.has_switch("disable-gpu"));
        assert!(!cfg.has_switch("use-gl"));
        assert!(!cfg.has_switch("ozone-platform"));
        assert!(cfg.has_switch("no-sandbox"));
    }

    #[test]
    fn force_on_without_gpu_falls_back_to_software_headless() {
        let cfg = resolve(&inputs(GpuPreference::On, false, false));
        assert!(!cfg.accelerated);
        assert!(cfg.headless);
        assert!(cfg.has_switch("disable-gpu"));
        assert!(cfg.has_switch("disable-gpu-compositing"));
        assert!(cfg.has_switch("disable-software-rasterizer"));
        assert!(cfg.has_switch("ozone-platform"));
    }

    #[test]
    fn auto_with_gpu_and_no_display_is_accelerated_headless() {
        let cfg = resolve(&inputs(GpuPreference::Auto, true, false));
        assert!(cfg.accelerated);
        assert!(cfg.headless);
        assert!(cfg.has_switch("enable-gpu-rasterization"));
        assert!(cfg.has_switch("enable-zero-copy"));
        assert!(cfg.switches.contains(&Switch::with_value("use-gl", "egl-angle")));
        assert!(cfg.switches.contains(&Switch::with_value("headless", "new")));
        assert!(!cfg.has_switch("disable-gpu"));
    }

    #[test]
    fn always_emits_sandbox_and_log_severity() {
        for pref in [GpuPreference::Auto, GpuPreference::On, GpuPreference::Off] {
            for role in [ProcessRole::Browser, ProcessRole::Renderer] {
                let mut i = inputs(pref, true, false);
                i.role = role;
                let cfg = resolve(&i);
                assert!(cfg.has_switch("disable-gpu-sandbox"));
                assert!(cfg.has_switch("disable-seccomp-filter-sandbox"));
                assert!(cfg.has_switch("no-sandbox"));
                assert!(cfg.switches.contains(&Switch::with_value("log-severity", "warning")));
            }
        }
    }

    #[test]
    fn single_process_switches_only_for_browser() {
        let mut i = inputs(GpuPreference::Auto, false, true);
        i.single_process = true;
        let browser = resolve(&i);
        assert!(browser.single_process);
        for s in ["single-process", "disable-zygote", "in-process-gpu"] {
            assert!(browser.has_switch(s), "missing {}", s);
        }

        i.role = ProcessRole::Renderer;
        let child = resolve(&i);
        assert!(!child.has_switch("single-process"));
    }

    #[test]
    fn subprocess_gets_rendering_backend_without_browser_only_switches() {
        let policy = LaunchPolicy {
            preference: GpuPreference::Auto,
            gpu_available: true,
            display_attached: false,
            single_process: false,
        };
        let mut cmd = CommandLine::new();
        policy.on_before_child_process_launch("gpu-process", &mut cmd);
        assert_eq!(cmd.switch_value("use-gl"), Some("egl-angle"));
        assert_eq!(cmd.switch_value("ozone-platform"), Some("headless"));
        assert!(!cmd.has_switch("enable-zero-copy"));
        assert!(!cmd.has_switch("disable-extensions"));
        assert!(cmd.has_switch("no-sandbox"));
    }

    #[test]
    fn role_detection_from_args() {
        assert_eq!(ProcessRole::from_args(["prog"]), ProcessRole::Browser);
        assert_eq!(
            ProcessRole::from_args(["prog", "--type=renderer", "--lang=en"]),
            ProcessRole::Renderer
        );
        assert_eq!(ProcessRole::from_args(["prog", "--type=gpu-process"]), ProcessRole::Gpu);
        assert!(ProcessRole::from_args(["p", "--type=zygote"]).is_subprocess());
    }

    #[test]
    fn gpu_preference_parsing() {
        assert_eq!("auto".parse::<GpuPreference>().unwrap(), GpuPreference::Auto);
        assert_eq!("ON".parse::<GpuPreference>().unwrap(), GpuPreference::On);
        assert_eq!("false".parse::<GpuPreference>().unwrap(), GpuPreference::Off);
        assert!("maybe".parse::<GpuPreference>().is_err());
    }

    #[test]
    fn command_line_renders_args_in_order() {
        let cfg = resolve(&inputs(GpuPreference::Off, false, true));
        let mut cmd = CommandLine::new();
        cfg.apply_to(&mut cmd);
        let args = cmd.to_args();
        assert_eq!(args.first().map(String::as_str), Some("--disable-extensions"));
        assert!(args.contains(&"--log-severity=warning".to_string()));
    }
}
