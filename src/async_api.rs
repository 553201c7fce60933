use crate::host::HostRuntime;
use crate::pipeline::{ChromiumSource, PipelineState, PullOutcome, SourceStats};
use crate::sink::{MemorySink, VideoBuffer, VideoFormat};
use crate::{Error, Result, SourceConfig};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

enum Command {
    NextFrame(oneshot::Sender<Result<Option<VideoBuffer>>>),
    Stats(oneshot::Sender<SourceStats>),
    Format(oneshot::Sender<Option<VideoFormat>>),
    Close(oneshot::Sender<Result<()>>),
}

/// An async-friendly video source backed by a dedicated worker thread.
///
/// The worker thread owns a [`ChromiumSource`] playing into an in-memory
/// sink and serves pull requests sent from async tasks, so callers never
/// block an executor thread on the frame bridge.
#[derive(Clone)]
pub struct AsyncSource {
    cmd_tx: Sender<Command>,
}

impl AsyncSource {
    /// Start a source (spawns a background thread that owns the pipeline).
    pub async fn start(config: SourceConfig, runtime: Arc<HostRuntime>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        thread::Builder::new()
            .name("chromiumsrc-async".into())
            .spawn(move || {
                let sink = MemorySink::bounded(1);
                let source = ChromiumSource::new(config, runtime, Arc::new(sink.clone()));
                if let Err(err) = source.set_state(PipelineState::Playing) {
                    let _ = init_tx.send(Err(err));
                    return;
                }
                let _ = init_tx.send(Ok(()));

                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        Command::NextFrame(resp) => {
                            let res = match source.need_data(0) {
                                PullOutcome::Pushed { .. } => Ok(sink.pop()),
                                PullOutcome::PushFailed(e) => Err(Error::Other(e.to_string())),
                                PullOutcome::Timeout
                                | PullOutcome::Stopped
                                | PullOutcome::NotRunning => Ok(None),
                            };
                            let _ = resp.send(res);
                        }
                        Command::Stats(resp) => {
                            let _ = resp.send(source.stats());
                        }
                        Command::Format(resp) => {
                            let _ = resp.send(source.format());
                        }
                        Command::Close(resp) => {
                            let res = source.set_state(PipelineState::Null);
                            let _ = resp.send(res);
                            break;
                        }
                    }
                }
            })
            .map_err(Error::ThreadSpawn)?;

        init_rx
            .await
            .map_err(|e| Error::Other(format!("Worker init canceled: {}", e)))??;

        Ok(Self { cmd_tx })
    }

    /// Pull one frame; `None` when none arrived within the pull timeout
    pub async fn next_frame(&self) -> Result<Option<VideoBuffer>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::NextFrame(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("NextFrame canceled: {}", e)))?
    }

    pub async fn stats(&self) -> Result<SourceStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("Stats canceled: {}", e)))
    }

    /// Negotiated output format
    pub async fn format(&self) -> Result<Option<VideoFormat>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Format(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("Format canceled: {}", e)))
    }

    /// Stop the pipeline and shut the worker down.
    pub async fn close(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("Close canceled: {}", e)))?
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Other("source worker has shut down".into()))
    }
}
