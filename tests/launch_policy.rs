//! Launch decisions as seen through the host runtime

use chromiumsrc::gpu::DeviceScanner;
use chromiumsrc::launch::{CommandLine, Environment, ProcessRole};
use chromiumsrc::pattern::PatternHost;
use chromiumsrc::settings::HostSettings;
use chromiumsrc::{GpuPreference, HostRuntime};
use std::fs;
use std::sync::Arc;

fn gpu_dir(nodes: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for n in nodes {
        fs::write(dir.path().join(n), b"").unwrap();
    }
    dir
}

fn runtime(devices: &tempfile::TempDir, env: Environment) -> HostRuntime {
    HostRuntime::new(Arc::new(PatternHost::new()))
        .with_scanner(DeviceScanner::new(devices.path()))
        .with_environment(env)
        .with_settings(HostSettings::in_memory(devices.path().join("cache")))
}

#[test]
fn picks_highest_render_node() {
    let devices = gpu_dir(&["card0", "renderD128", "renderD129"]);
    let rt = runtime(&devices, Environment::headless());
    let gpu = rt.gpu_config(GpuPreference::Auto);
    assert!(gpu.enabled);
    assert_eq!(gpu.device_index, Some(129));
    assert_eq!(gpu.device_path.as_deref(), Some(devices.path().join("renderD129").as_path()));
}

#[test]
fn gpu_selection_is_fixed_after_first_use() {
    let devices = gpu_dir(&["renderD128"]);
    let rt = runtime(&devices, Environment::headless());
    assert!(!rt.gpu_config(GpuPreference::Off).enabled);
    // First preference wins for the lifetime of the runtime
    assert!(!rt.gpu_config(GpuPreference::On).enabled);
}

#[test]
fn accelerated_headless_browser_switches() {
    let devices = gpu_dir(&["renderD128"]);
    let rt = runtime(&devices, Environment::headless());
    let launch = rt.policy(GpuPreference::Auto, false).resolve_for(ProcessRole::Browser);

    assert!(launch.accelerated);
    assert!(launch.headless);
    let args = {
        let mut cmd = CommandLine::new();
        launch.apply_to(&mut cmd);
        cmd.to_args()
    };
    for expected in [
        "--use-gl=egl-angle",
        "--use-angle=egl",
        "--enable-gpu-rasterization",
        "--enable-zero-copy",
        "--ozone-platform=headless",
        "--no-sandbox",
        "--log-severity=warning",
    ] {
        assert!(args.iter().any(|a| a == expected), "missing {}", expected);
    }
    assert!(!args.iter().any(|a| a == "--disable-gpu"));
}

#[test]
fn renderer_never_gets_browser_only_switches() {
    let devices = gpu_dir(&["renderD128"]);
    let rt = runtime(&devices, Environment::headless());
    let launch = rt
        .policy(GpuPreference::Auto, true)
        .resolve_for(ProcessRole::from_args(["chromiumsrc", "--type=renderer"]));

    assert_eq!(launch.role, ProcessRole::Renderer);
    assert!(launch.has_switch("enable-gpu-rasterization"));
    assert!(!launch.has_switch("enable-zero-copy"));
    assert!(!launch.has_switch("single-process"));
    assert!(!launch.has_switch("disable-extensions"));
    assert!(launch.has_switch("disable-seccomp-filter-sandbox"));
}

#[test]
fn display_attached_software_has_no_rendering_switches() {
    let devices = gpu_dir(&[]);
    let env = Environment { display: Some(":0".into()), wayland_display: None };
    let rt = runtime(&devices, env);
    let launch = rt.policy(GpuPreference::On, false).resolve_for(ProcessRole::Browser);

    assert!(!launch.accelerated);
    assert!(!launch.headless);
    for name in ["disable-gpu", "use-gl", "ozone-platform", "headless"] {
        assert!(!launch.has_switch(name), "unexpected {}", name);
    }
}

#[test]
fn initialization_happens_once() {
    let devices = gpu_dir(&[]);
    let host = Arc::new(PatternHost::new());
    let rt = HostRuntime::new(host.clone())
        .with_scanner(DeviceScanner::new(devices.path()))
        .with_environment(Environment::headless())
        .with_settings(HostSettings::in_memory(devices.path()));

    let first = rt.ensure_initialized(GpuPreference::Auto, false).unwrap();
    let second = rt.ensure_initialized(GpuPreference::Off, true).unwrap();
    assert_eq!(first, second);
    assert_eq!(host.init_count(), 1);
    assert!(rt.is_initialized());
}

#[test]
fn launch_config_serializes_for_the_cli() {
    let devices = gpu_dir(&[]);
    let rt = runtime(&devices, Environment::headless());
    let launch = rt.policy(GpuPreference::Off, false).resolve_for(ProcessRole::Gpu);
    let json = serde_json::to_value(&launch).unwrap();
    assert_eq!(json["accelerated"], false);
    assert_eq!(json["role"], "gpu");
    assert!(json["switches"].as_array().is_some_and(|s| !s.is_empty()));
}
