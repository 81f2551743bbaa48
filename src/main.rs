use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixelcast::config::{parse_capture_size, ConfigStore};
use pixelcast::runtime::{ExecToken, StreamingContext, ThreadRole};
use pixelcast::service::StreamingService;
use pixelcast::utils::LogThrottler;
use pixelcast::video::{EncoderRegistry, PixelFormat, Resolution, TestPattern};
use pixelcast::webrtc::WebRtcPeerFactory;
use pixelcast::AppError;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// pixelcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "pixelcast")]
#[command(version, about = "Stream a rendered frame source to WebRTC viewers", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "pixelcast.json")]
    config: PathBuf,

    /// Signalling server URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    signalling_url: Option<String>,

    /// Streamer id announced to the signalling server (overrides config)
    #[arg(long, value_name = "ID")]
    streamer_id: Option<String>,

    /// Capture size, WIDTHxHEIGHT or "backbuffer" (overrides config)
    #[arg(long, value_name = "SIZE")]
    capture_size: Option<String>,

    /// Render size of the test pattern, WIDTHxHEIGHT
    #[arg(long, value_name = "SIZE", default_value = "1280x720")]
    render_size: String,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting pixelcast v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::new(&args.config).await?;
    let mut config = (*config_store.get()).clone();
    tracing::info!("Configuration: {}", args.config.display());

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(url) = args.signalling_url {
        config.signalling.url = url;
    }
    if let Some(id) = args.streamer_id {
        config.signalling.streamer_id = id;
    }
    if let Some(size) = args.capture_size {
        config
            .capture
            .override_capture_size(&size)
            .ok_or_else(|| anyhow::anyhow!("Invalid capture size: {}", size))?;
    }

    let render_size = parse_capture_size(&args.render_size)
        .ok_or_else(|| anyhow::anyhow!("Invalid render size: {}", args.render_size))?;

    let context = StreamingContext::init()?;
    let factory = Arc::new(WebRtcPeerFactory::new()?);
    let mut service = StreamingService::new(
        &config,
        EncoderRegistry::global(),
        factory,
        context,
        render_size,
    )?;
    service.start()?;
    let service = Arc::new(service);

    let shutdown = CancellationToken::new();

    // Log what viewers do
    let mut events = service.subscribe();
    let events_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!("Event: {}", event.event_name());
        }
    });

    // Latency results and other housekeeping
    let tick_service = service.clone();
    let tick_shutdown = shutdown.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick_shutdown.cancelled() => break,
                _ = interval.tick() => tick_service.tick(),
            }
        }
    });

    let render_thread = spawn_render_thread(
        service.clone(),
        render_size,
        config.capture.max_fps,
        shutdown.clone(),
    )?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    if render_thread.join().is_err() {
        tracing::error!("Render thread panicked");
    }
    let _ = tick_task.await;
    events_task.abort();

    match Arc::try_unwrap(service) {
        Ok(service) => service.shutdown().await,
        Err(_) => tracing::warn!("Streaming service still in use, skipping orderly shutdown"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Drive the test pattern into the service at `fps`
fn spawn_render_thread(
    service: Arc<StreamingService>,
    size: Resolution,
    fps: u32,
    shutdown: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pixelcast-render".to_string())
        .spawn(move || {
            let token = ExecToken::bind(ThreadRole::Render);
            let mut pattern = TestPattern::new(size, PixelFormat::Bgra8);
            let frame_interval = Duration::from_secs(1) / fps.max(1);
            let throttler = LogThrottler::with_secs(5);

            while !shutdown.is_cancelled() {
                let frame = pattern.next_frame();
                match service.on_back_buffer_ready(&token, &frame) {
                    Ok(_) => {}
                    Err(e @ AppError::WrongThread { .. }) => {
                        tracing::error!("Render loop stopped: {}", e);
                        break;
                    }
                    Err(e) => {
                        pixelcast::warn_throttled!(throttler, "render", "Frame dropped: {}", e);
                    }
                }
                std::thread::sleep(frame_interval);
            }
        })
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pixelcast=error,webrtc=error",
        LogLevel::Warn => "pixelcast=warn,webrtc=warn",
        LogLevel::Info => "pixelcast=info,webrtc=warn",
        LogLevel::Verbose => "pixelcast=debug,webrtc=warn",
        LogLevel::Debug => "pixelcast=debug,webrtc=info",
        LogLevel::Trace => "pixelcast=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
