use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use screencast::capture::{AnnexBFileSource, CaptureControls, SyntheticSource};
use screencast::config::Settings;
use screencast::module::{
    CaptureGrant, LoopbackHost, MjpegSessionFactory, ModuleController, ModuleEvent, ModuleHandle,
    ModuleState, RtspClientSessionFactory, RtspServerSessionFactory,
};
use screencast::protocol::RtspUrl;
use screencast::report::ErrorReporter;
use screencast::transport::Protocol;
use tracing_subscriber::EnvFilter;

const START_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "screencast", version, about = "Stream a screen over MJPEG or RTSP")]
struct Cli {
    /// TOML settings file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a synthetic screen to browsers as MJPEG
    Mjpeg(MjpegArgs),
    /// Serve an H.264 file to RTSP players
    RtspServer(RtspServerArgs),
    /// Publish an H.264 file to a remote RTSP server
    RtspClient(RtspClientArgs),
}

#[derive(Args)]
struct MjpegArgs {
    #[arg(long)]
    bind: Option<String>,
    /// Require viewers to enter this PIN (4 to 8 digits)
    #[arg(long)]
    pin: Option<String>,
    /// Resize factor in percent
    #[arg(long)]
    resize: Option<u32>,
    #[arg(long)]
    quality: Option<u8>,
    #[arg(long)]
    max_fps: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
}

#[derive(Args)]
struct RtspServerArgs {
    #[arg(long)]
    bind: Option<String>,
    /// Annex B H.264 elementary stream, played in a loop
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    fps: Option<u32>,
}

#[derive(Args)]
struct RtspClientArgs {
    /// rtsp:// or rtsps:// endpoint to publish to
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    protocol: Option<Protocol>,
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    fps: Option<u32>,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    match &cli.command {
        Command::Mjpeg(args) => {
            let capture = &mut settings.capture;
            override_with(&mut settings.mjpeg.bind_addr, args.bind.clone());
            if args.pin.is_some() {
                settings.mjpeg.pin = args.pin.clone();
            }
            override_with(&mut capture.resize_factor, args.resize);
            override_with(&mut capture.quality, args.quality);
            override_with(&mut capture.max_fps, args.max_fps);
            override_with(&mut capture.width, args.width);
            override_with(&mut capture.height, args.height);
        }
        Command::RtspServer(args) => {
            override_with(&mut settings.rtsp.bind_addr, args.bind.clone());
            if args.file.is_some() {
                settings.rtsp.file = args.file.clone();
            }
            override_with(&mut settings.rtsp.fps, args.fps);
        }
        Command::RtspClient(args) => {
            if args.url.is_some() {
                settings.rtsp.url = args.url.clone();
            }
            override_with(&mut settings.rtsp.protocol, args.protocol);
            if args.file.is_some() {
                settings.rtsp.file = args.file.clone();
            }
            override_with(&mut settings.rtsp.fps, args.fps);
        }
    }
    settings.validate()?;
    Ok(settings)
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn h264_source(settings: &Settings) -> Result<AnnexBFileSource> {
    let Some(path) = &settings.rtsp.file else {
        bail!("an H.264 file is required (--file or rtsp.file)");
    };
    Ok(AnnexBFileSource::open(path, settings.rtsp.fps)?)
}

/// Wait for the loopback host to finish the start handshake.
async fn wait_running(module: &ModuleHandle) -> Result<()> {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    while module.state().await? != ModuleState::Running {
        if tokio::time::Instant::now() >= deadline {
            bail!("module did not start within {START_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let settings = load_settings(&cli)?;

    let controls = Arc::new(CaptureControls::default());
    let reporter = Arc::new(ErrorReporter::new());
    let (module, mut controller, grant) = match &cli.command {
        Command::Mjpeg(_) => {
            settings.capture.apply(&controls)?;
            let factory =
                MjpegSessionFactory::new(settings.mjpeg.server_config(), controls.clone());
            let source = SyntheticSource::new(
                settings.capture.width,
                settings.capture.height,
                settings.capture.max_fps,
            );
            let (module, controller) =
                ModuleController::spawn(LoopbackHost, factory, reporter.clone());
            (module, controller, CaptureGrant::Screen(Box::new(source)))
        }
        Command::RtspServer(_) => {
            let source = h264_source(&settings)?;
            let factory = RtspServerSessionFactory::new(settings.rtsp.server_config());
            let (module, controller) =
                ModuleController::spawn(LoopbackHost, factory, reporter.clone());
            (module, controller, CaptureGrant::Encoded(source))
        }
        Command::RtspClient(_) => {
            let Some(url) = &settings.rtsp.url else {
                bail!("a target URL is required (--url or rtsp.url)");
            };
            let url = RtspUrl::parse(url)?;
            let source = h264_source(&settings)?;
            let factory = RtspClientSessionFactory::new(url, settings.rtsp.protocol);
            let (module, controller) =
                ModuleController::spawn(LoopbackHost, factory, reporter.clone());
            (module, controller, CaptureGrant::Encoded(source))
        }
    };
    tokio::spawn(watch_errors(reporter));

    module.start_module().await?;
    wait_running(&module).await?;
    module.send_event(ModuleEvent::StartProjection(grant)).await?;
    tracing::info!("streaming, press Ctrl-C to stop");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("stopping");
        }
        _ = &mut controller => {
            tracing::warn!("module controller ended");
        }
    }

    if !controller.is_finished() {
        module.stop_module().await?;
        module.shutdown().await?;
        controller.await.context("module controller panicked")?;
    }
    Ok(())
}

async fn watch_errors(reporter: Arc<ErrorReporter>) {
    let mut errors = reporter.subscribe();
    while errors.changed().await.is_ok() {
        let current = errors.borrow_and_update().clone();
        if let Some(error) = current {
            tracing::error!(class = ?error.class, action = ?error.action, "{}", error.message);
        }
    }
}
