//! chromiumsrc
//!
//! Bridges an offscreen browser rendering host to a pull-based video
//! pipeline. The host paints frames on its own thread; a downstream
//! consumer pulls them at a fixed cadence.
//!
//! # Architecture
//!
//! - **gpu**: render-node probing and device selection
//! - **launch**: pure decision logic turning GPU/display/process-role inputs
//!   into host command-line switches
//! - **bridge**: the single-slot, mutex/condvar frame hand-off
//! - **session**: browser lifecycle and the redraw loop
//! - **pipeline**: the `Null/Ready/Paused/Playing` state machine
//!
//! The rendering host is a trait ([`host::RenderHost`]); the crate ships a
//! software test-pattern host ([`pattern::PatternHost`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chromiumsrc::{ChromiumSource, HostRuntime, PipelineState, SourceConfig};
//! use chromiumsrc::pattern::PatternHost;
//! use chromiumsrc::sink::MemorySink;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(HostRuntime::new(Arc::new(PatternHost::new())));
//! let sink = MemorySink::new();
//! let config = SourceConfig {
//!     url: Some("https://example.com".to_string()),
//!     width: 640,
//!     height: 480,
//!     framerate: "30".parse()?,
//!     ..Default::default()
//! };
//!
//! let source = ChromiumSource::new(config, runtime, Arc::new(sink.clone()));
//! source.set_state(PipelineState::Playing)?;
//! source.need_data(0);
//! source.set_state(PipelineState::Null)?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod bridge;
pub mod gpu;
pub mod host;
pub mod launch;
pub mod pattern;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod sink;

// Async-friendly facade (worker-thread backed)
pub mod async_api;

pub use bridge::{Consumed, Frame, FrameBridge, PublishOutcome};
pub use host::{HostRuntime, RenderHost};
pub use launch::{GpuPreference, LaunchConfig, ProcessRole};
pub use pipeline::{ChromiumSource, PipelineState, PullOutcome, StateChange};
pub use session::{InvalidateWhen, RedrawPolicy};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Output framerate as a fraction
///
/// Parses either an integer (`"30"`, clamped to 1..=60) or a rational
/// (`"30000/1001"`).
///
/// # Examples
///
/// ```
/// let f: chromiumsrc::Framerate = "30000/1001".parse().unwrap();
/// assert_eq!((f.num, f.den), (30000, 1001));
/// assert_eq!("120".parse::<chromiumsrc::Framerate>().unwrap().num, 60);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const MIN_FPS: u32 = 1;
    pub const MAX_FPS: u32 = 60;

    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Integer frames per second
    pub fn from_fps(fps: u32) -> Self {
        Self::new(fps.clamp(Self::MIN_FPS, Self::MAX_FPS), 1)
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Nearest integer fps, at least 1
    pub fn rounded_fps(&self) -> u32 {
        if self.den == 0 {
            return Self::MIN_FPS;
        }
        let (num, den) = (self.num as u64, self.den as u64);
        let fps = (num + den / 2) / den;
        u32::try_from(fps).unwrap_or(u32::MAX).max(Self::MIN_FPS)
    }

    /// `1s * den / num`, truncated to whole nanoseconds
    pub fn frame_duration(&self) -> Duration {
        if self.num == 0 {
            return Duration::ZERO;
        }
        let nanos = NANOS_PER_SECOND * self.den as u128 / self.num as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Presentation timestamp of frame `sequence`
    pub fn timestamp(&self, sequence: u64) -> Duration {
        let nanos = self.frame_duration().as_nanos() as u64;
        Duration::from_nanos(nanos.saturating_mul(sequence))
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Framerate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || Error::Config(format!("invalid framerate '{}'", s));
        match s.split_once('/') {
            Some((num, den)) => {
                let num: u32 = num.trim().parse().map_err(|_| bad())?;
                let den: u32 = den.trim().parse().map_err(|_| bad())?;
                let rate = Self::new(num, den);
                if rate.is_valid() {
                    Ok(rate)
                } else {
                    Err(bad())
                }
            }
            None => {
                let fps: i64 = s.parse().map_err(|_| bad())?;
                Ok(Self::from_fps(fps.clamp(0, u32::MAX as i64) as u32))
            }
        }
    }
}

impl Serialize for Framerate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Framerate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Fps(u32),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Fps(fps) => Ok(Self::from_fps(fps)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Configuration of the browser video source
///
/// # Examples
///
/// ```
/// let cfg = chromiumsrc::SourceConfig::default();
/// assert_eq!((cfg.width, cfg.height), (1920, 1080));
/// assert_eq!(cfg.framerate.to_string(), "30/1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Page to render
    pub url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    pub gpu: GpuPreference,
    /// Run the host renderer and GPU work inside the browser process
    pub single_process: bool,
    pub redraw: RedrawPolicy,
    /// How long one pull waits for a frame
    pub pull_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: Some("https://example.com/test.html".to_string()),
            width: 1920,
            height: 1080,
            framerate: Framerate::default(),
            gpu: GpuPreference::default(),
            single_process: false,
            redraw: RedrawPolicy::default(),
            pull_timeout_ms: 1000,
        }
    }
}

impl SourceConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    /// Check everything that must hold before a start is attempted
    pub fn validate(&self) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("No URL specified".into()))?;
        url::Url::parse(url).map_err(|e| Error::Config(format!("invalid URL '{}': {}", url, e)))?;
        let addressable = bridge::frame_size(self.width, self.height).is_some();
        if self.width == 0 || self.height == 0 || !addressable {
            return Err(Error::Config(format!(
                "invalid geometry {}x{}",
                self.width, self.height
            )));
        }
        if !self.framerate.is_valid() {
            return Err(Error::Config(format!("invalid framerate {}", self.framerate)));
        }
        Ok(())
    }

    /// Validated parameters for one session
    pub fn session_params(&self) -> Result<session::SessionParams> {
        self.validate()?;
        Ok(session::SessionParams {
            url: self.url.clone().unwrap_or_default().trim().to_string(),
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            gpu: self.gpu,
            single_process: self.single_process,
            redraw: self.redraw,
        })
    }
}
