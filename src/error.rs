//! Error types for the browser video source

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Result type alias for source operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or driving the source.
///
/// Only start-boundary failures are represented here. Transient delivery
/// problems (pull timeouts, dropped frames, navigation errors) are reported
/// through outcome values and logs instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (missing URL, zero geometry, bad framerate)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The frame buffer could not be allocated
    #[error("Failed to allocate frame buffer of {bytes} bytes")]
    Allocation { bytes: usize },

    /// The rendering host refused to initialize
    #[error("Rendering host initialization failed: {0}")]
    HostInit(String),

    /// The rendering host could not create a browser
    #[error("Browser creation failed: {0}")]
    BrowserCreate(String),

    /// The redraw-loop thread could not be spawned
    #[error("Failed to spawn redraw thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// `start` was called while a session is already live
    #[error("Session is already running")]
    AlreadyRunning,

    /// A pipeline state change that skips a state
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: PipelineState, to: PipelineState },

    /// Downstream rejected the negotiated output format
    #[error("Format negotiation failed: {0}")]
    Negotiation(String),

    /// I/O error (sinks, cache directories)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error was raised by configuration validation.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
