//! Downstream consumer contract and two simple sinks.

use crate::{Framerate, Result};
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Output pixel format; only packed 32-bit BGRA is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    #[serde(rename = "BGRA")]
    Bgra,
}

/// Negotiated output format (`video/x-raw, format=BGRA, ...`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
}

impl VideoFormat {
    pub fn bgra(width: u32, height: u32, framerate: Framerate) -> Self {
        Self { pixel_format: PixelFormat::Bgra, width, height, framerate }
    }

    /// Caps-style description
    pub fn caps_string(&self) -> String {
        format!(
            "video/x-raw, format=(string)BGRA, width=(int){}, height=(int){}, framerate=(fraction){}/{}",
            self.width, self.height, self.framerate.num, self.framerate.den
        )
    }
}

/// A timestamped frame handed downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoBuffer {
    pub data: Vec<u8>,
    pub pts: Duration,
    pub dts: Duration,
    pub duration: Duration,
    pub sequence: u64,
}

impl VideoBuffer {
    /// SHA-256 of the pixel data, hex encoded
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

/// Why a push was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("flushing")]
    Flushing,
    #[error("end of stream")]
    Eos,
    #[error("not negotiated")]
    NotNegotiated,
    #[error("{0}")]
    Error(String),
}

/// The downstream consumer
pub trait FrameSink: Send + Sync {
    /// Agree on the output format before any buffer is pushed
    fn set_output_format(&self, format: &VideoFormat) -> Result<()>;

    fn push_frame(&self, buffer: VideoBuffer) -> std::result::Result<(), FlowError>;

    fn end_of_stream(&self);
}

#[derive(Debug, Default)]
struct MemoryState {
    format: Option<VideoFormat>,
    frames: VecDeque<VideoBuffer>,
    eos: bool,
    capacity: Option<usize>,
}

/// In-memory sink; cheap to clone, clones share storage
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the newest `capacity` frames
    pub fn bounded(capacity: usize) -> Self {
        let sink = Self::default();
        sink.lock().capacity = Some(capacity.max(1));
        sink
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn format(&self) -> Option<VideoFormat> {
        self.lock().format
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }

    pub fn pop(&self) -> Option<VideoBuffer> {
        self.lock().frames.pop_front()
    }

    pub fn take_all(&self) -> Vec<VideoBuffer> {
        self.lock().frames.drain(..).collect()
    }
}

impl FrameSink for MemorySink {
    fn set_output_format(&self, format: &VideoFormat) -> Result<()> {
        let mut state = self.lock();
        state.format = Some(*format);
        state.eos = false;
        Ok(())
    }

    fn push_frame(&self, buffer: VideoBuffer) -> std::result::Result<(), FlowError> {
        let mut state = self.lock();
        if state.eos {
            return Err(FlowError::Eos);
        }
        if state.format.is_none() {
            return Err(FlowError::NotNegotiated);
        }
        if let Some(cap) = state.capacity {
            while state.frames.len() >= cap {
                state.frames.pop_front();
            }
        }
        state.frames.push_back(buffer);
        Ok(())
    }

    fn end_of_stream(&self) {
        self.lock().eos = true;
    }
}

/// Writes raw BGRA frames back to back into a file
pub struct RawFileSink {
    writer: Mutex<Option<BufWriter<File>>>,
    frames: Mutex<u64>,
}

impl RawFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
            frames: Mutex::new(0),
        })
    }

    pub fn frames_written(&self) -> u64 {
        *self.frames.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FrameSink for RawFileSink {
    fn set_output_format(&self, format: &VideoFormat) -> Result<()> {
        debug!("Raw file sink negotiated {}", format.caps_string());
        Ok(())
    }

    fn push_frame(&self, buffer: VideoBuffer) -> std::result::Result<(), FlowError> {
        let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let writer = guard.as_mut().ok_or(FlowError::Eos)?;
        writer
            .write_all(&buffer.data)
            .map_err(|e| FlowError::Error(e.to_string()))?;
        *self.frames.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }

    fn end_of_stream(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush raw output: {}", e);
            }
        }
    }
}
