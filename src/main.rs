use anyhow::{bail, Context};
use chromiumsrc::launch::ProcessRole;
use chromiumsrc::pattern::PatternHost;
use chromiumsrc::sink::{FrameSink, MemorySink, RawFileSink};
use chromiumsrc::{
    ChromiumSource, Framerate, GpuPreference, HostRuntime, PipelineState, PullOutcome,
    SourceConfig,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chromiumsrc", version, about = "Offscreen browser video source")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull frames from the test-pattern host
    Run(RunArgs),
    /// Print the resolved launch configuration as JSON
    Switches(SwitchArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON source configuration; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// `30` or `30000/1001`
    #[arg(long)]
    framerate: Option<Framerate>,
    /// auto, on or off
    #[arg(long)]
    gpu: Option<GpuPreference>,
    #[arg(long)]
    single_process: bool,
    #[arg(long, default_value_t = 30)]
    frames: u64,
    /// Write raw BGRA frames here instead of printing digests
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct SwitchArgs {
    /// Resolve for a child process type (renderer, gpu-process, ...)
    #[arg(long)]
    subprocess: Option<String>,
    #[arg(long, default_value = "auto")]
    gpu: GpuPreference,
    #[arg(long)]
    single_process: bool,
}

enum Output {
    File(Arc<RawFileSink>),
    Digests(MemorySink),
}

impl RunArgs {
    fn source_config(&self) -> anyhow::Result<SourceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SourceConfig::default(),
        };
        if let Some(url) = &self.url {
            config.url = Some(url.clone());
        }
        if let Some(w) = self.width {
            config.width = w;
        }
        if let Some(h) = self.height {
            config.height = h;
        }
        if let Some(f) = self.framerate {
            config.framerate = f;
        }
        if let Some(g) = self.gpu {
            config.gpu = g;
        }
        config.single_process |= self.single_process;
        config.validate()?;
        Ok(config)
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.source_config()?;
    let runtime = Arc::new(HostRuntime::new(Arc::new(PatternHost::new())));

    let output = match &args.output {
        Some(path) => Output::File(Arc::new(
            RawFileSink::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Output::Digests(MemorySink::bounded(1)),
    };
    let sink: Arc<dyn FrameSink> = match &output {
        Output::File(f) => f.clone(),
        Output::Digests(m) => Arc::new(m.clone()),
    };

    let source = ChromiumSource::new(config, runtime, sink);
    source
        .set_state(PipelineState::Playing)
        .context("starting source")?;

    let mut pushed = 0u64;
    let mut misses = 0u64;
    while pushed < args.frames {
        match source.need_data(0) {
            PullOutcome::Pushed { sequence, pts } => {
                pushed += 1;
                if let Output::Digests(memory) = &output {
                    if let Some(buffer) = memory.pop() {
                        println!("{:>6} {:>14?} {}", sequence, pts, buffer.digest());
                    }
                }
            }
            PullOutcome::Timeout => {
                misses += 1;
                if misses > args.frames.max(3) {
                    bail!("no frames after {} pulls", misses);
                }
            }
            PullOutcome::PushFailed(e) => bail!("sink refused frame: {}", e),
            PullOutcome::Stopped | PullOutcome::NotRunning => break,
        }
    }

    let stats = source.stats();
    source.set_state(PipelineState::Null)?;
    eprintln!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn switches(args: SwitchArgs) -> anyhow::Result<()> {
    let runtime = HostRuntime::new(Arc::new(PatternHost::new()));
    let role = match args.subprocess.as_deref() {
        Some(t) => ProcessRole::from_process_type(t),
        None => ProcessRole::Browser,
    };
    let launch = runtime
        .policy(args.gpu, args.single_process)
        .resolve_for(role);
    println!("{}", serde_json::to_string_pretty(&launch)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Switches(args) => switches(args),
    }
}
