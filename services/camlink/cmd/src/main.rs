//! Camlink binary.
//!
//! `receive` runs the receiver side against a camera, `simulate` plays the
//! camera from a directory of JPEG files, and `alert`/`listen` send and watch
//! the subnet alert broadcasts.

use anyhow::Context;
use bytes::Bytes;
use camlink_delivery::{
    AlertBroadcaster, AlertListener, CommandSink, ConsumerLoop, JpegProbe, LoggingSink,
    RecordingSink,
};
use camlink_session::{CameraEndpoint, CameraError, Session, SessionEvent};
use camlink_wire::{Chunker, ControlMessage, HeaderLayout, DEFAULT_BUFFER_SIZE};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CamlinkConfig;
use logging::CamlinkLogFormatter;

/// UDP JPEG camera link
#[derive(Parser, Debug)]
#[command(name = "camlink", version, about = "Receive and simulate UDP JPEG camera streams")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = "camlink.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a camera and consume its frames
    Receive(ReceiveArgs),
    /// Act as a camera streaming JPEG files
    Simulate(SimulateArgs),
    /// Broadcast a control token on the alert port
    Alert(AlertArgs),
    /// Print control tokens arriving on the alert port
    Listen(ListenArgs),
}

#[derive(clap::Args, Debug)]
struct ReceiveArgs {
    /// Local address to receive on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Camera address (skips discovery)
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Header layout of data datagrams
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Keepalive interval
    #[arg(long)]
    keepalive_interval: Option<humantime::Duration>,

    /// Drop frames still incomplete after this long
    #[arg(long)]
    stale_after: Option<humantime::Duration>,

    /// Record frames into this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// LED level to set once connected
    #[arg(long)]
    led: Option<u8>,

    /// Handshake attempts before giving up
    #[arg(long, default_value = "1")]
    attempts: u32,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Directory of .jpg files to stream
    #[arg(long)]
    images: PathBuf,

    /// Local camera address
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Where to send discovery announcements
    #[arg(long, default_value = "255.255.255.255:6969")]
    announce: SocketAddr,

    /// Interval between announcements while waiting for HELLO
    #[arg(long, default_value = "1s")]
    announce_interval: humantime::Duration,

    /// Frames per second
    #[arg(long, default_value = "5")]
    fps: u32,

    /// Stream the directory repeatedly
    #[arg(long)]
    repeat: bool,

    /// Header layout of data datagrams
    #[arg(long, value_enum, default_value = "compact")]
    layout: LayoutArg,

    /// Datagram size
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Aux status byte stamped on every frame
    #[arg(long)]
    aux: Option<u8>,
}

#[derive(clap::Args, Debug)]
struct AlertArgs {
    /// Token to send, e.g. GUY_DEAD, CAM_ON, CAM_OFF, LED_128
    #[arg(default_value = "GUY_DEAD")]
    message: String,

    /// Target address (defaults to broadcast on the alert port)
    #[arg(long)]
    target: Option<SocketAddr>,

    /// Number of times to send
    #[arg(long, default_value = "1")]
    count: u32,

    /// Interval between repeats
    #[arg(long, default_value = "1s")]
    interval: humantime::Duration,
}

#[derive(clap::Args, Debug)]
struct ListenArgs {
    /// Address to listen on (defaults to the alert port on all interfaces)
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    /// 4-byte header
    Compact,
    /// 5-byte header with aux status byte
    WithAux,
}

impl From<LayoutArg> for HeaderLayout {
    fn from(layout: LayoutArg) -> Self {
        match layout {
            LayoutArg::Compact => HeaderLayout::Compact,
            LayoutArg::WithAux => HeaderLayout::WithAux,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("camlink={}", args.log_level).parse()?)
        .add_directive(format!("camlink_wire={}", args.log_level).parse()?)
        .add_directive(format!("camlink_session={}", args.log_level).parse()?)
        .add_directive(format!("camlink_delivery={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(CamlinkLogFormatter::new("camlink"))
        .init();

    info!("Starting camlink v{}", env!("CARGO_PKG_VERSION"));
    let config = CamlinkConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Receive(receive_args) => receive(config, receive_args).await,
        Command::Simulate(simulate_args) => simulate(simulate_args).await,
        Command::Alert(alert_args) => alert(config, alert_args).await,
        Command::Listen(listen_args) => listen(config, listen_args).await,
    }
}

async fn receive(mut config: CamlinkConfig, args: ReceiveArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.session.bind = bind;
    }
    if let Some(peer) = args.peer {
        config.session.peer = Some(peer);
    }
    if let Some(layout) = args.layout {
        config.session.layout = layout.into();
    }
    if let Some(interval) = args.keepalive_interval {
        config.session.keepalive_interval = interval.into();
    }
    if let Some(stale_after) = args.stale_after {
        config.session.stale_after = Some(stale_after.into());
    }
    if let Some(dir) = args.record_dir {
        config.recording.dir = Some(dir);
    }

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut session = Session::bind(config.session_config())
        .await
        .with_context(|| format!("failed to bind {}", config.session.bind))?
        .with_events(event_tx);

    let mut attempt = 1;
    let mut outcome = session.handshake().await;
    while let Err(e) = &outcome {
        if attempt >= args.attempts.max(1) {
            anyhow::bail!("handshake failed after {} attempt(s): {}", attempt, e);
        }
        attempt += 1;
        warn!("Handshake attempt {} failed ({}), retrying", attempt - 1, e);
        outcome = session.retry().await;
    }

    let queue = Arc::new(config.frame_queue());
    let handle = session.start(queue.clone())?;
    let commander = handle.commander();

    if let Some(level) = args.led {
        commander.send_command(&ControlMessage::Led(level)).await?;
        component_info!("receive", "LED set to {}", level);
    }

    let recorder = config
        .recording
        .dir
        .as_ref()
        .map(RecordingSink::create)
        .transpose()
        .context("failed to prepare recording directory")?;
    let consumer = ConsumerLoop::new(JpegProbe, (LoggingSink::new(), recorder))
        .with_commands(commander.clone());
    let consumer = tokio::spawn(consumer.run(queue));

    let mut consumer = consumer;
    let stats = loop {
        tokio::select! {
            Some(event) = events.recv() => log_session_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, disconnecting");
                handle.disconnect();
            }
            finished = &mut consumer => break finished?,
        }
    };

    // Turn the LED off on the way out
    if let Err(e) = commander.send_command(&ControlMessage::Led(0)).await {
        warn!("Failed to reset LED: {}", e);
    }

    handle.disconnect();
    let session_stats = handle.join().await;
    info!(
        "Session finished: {} frames completed, {} dropped, {} malformed datagrams",
        session_stats.frames_completed, session_stats.frames_dropped, session_stats.malformed_packets
    );
    info!(
        "Consumer finished: {} frames consumed, {} undecodable",
        stats.consumed, stats.decode_failures
    );
    Ok(())
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected { peer } => component_info!("session", "Connected to camera {}", peer),
        SessionEvent::FrameCompleted { sequence, size, aux } => {
            component_debug!("session", "Frame {} ready ({} bytes, aux={:?})", sequence, size, aux)
        }
        SessionEvent::FrameDropped { reason } => component_warn!("session", "Frame dropped: {}", reason),
        SessionEvent::MalformedPacket { from, len } => {
            component_warn!("session", "Malformed {} byte datagram from {}", len, from)
        }
        SessionEvent::Disconnected => component_info!("session", "Disconnected"),
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let images = load_images(&args.images)?;
    if images.is_empty() {
        anyhow::bail!("no .jpg files in {:?}", args.images);
    }
    info!("Loaded {} images from {:?}", images.len(), args.images);

    let chunker = Chunker::new(args.buffer_size, args.layout.into())?;
    let mut camera = CameraEndpoint::bind(args.bind, chunker)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let announce_interval: Duration = args.announce_interval.into();
    let receiver = loop {
        camera.announce(args.announce).await?;
        match camera.accept_hello(announce_interval).await {
            Ok(receiver) => break receiver,
            Err(CameraError::HelloTimeout(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    };
    component_info!("camera", "Streaming to receiver {}", receiver);

    let inbox = camera.start_inbox();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / args.fps.max(1));
    let mut sent = 0u64;

    'stream: loop {
        for image in &images {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => break 'stream,
            }
            let fragments = camera.send_frame(image.clone(), args.aux).await?;
            sent += 1;
            component_debug!("camera", "Sent frame {} in {} fragments", sent, fragments);
        }
        if !args.repeat {
            break;
        }
    }

    let directives = inbox.directives().await;
    info!(
        "Sent {} frames, received {} ACKs and {} directives {:?}",
        sent,
        inbox.acks(),
        directives.len(),
        directives
    );
    inbox.stop();
    Ok(())
}

fn load_images(dir: &Path) -> anyhow::Result<Vec<Bytes>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            std::fs::read(path)
                .map(Bytes::from)
                .with_context(|| format!("failed to read {:?}", path))
        })
        .collect()
}

async fn alert(config: CamlinkConfig, args: AlertArgs) -> anyhow::Result<()> {
    let message: ControlMessage = args.message.parse()?;
    let target = args.target.unwrap_or_else(|| config.alerts.target());
    let broadcaster = AlertBroadcaster::with_target(target).await?;

    broadcaster
        .broadcast_every(&message, args.interval.into(), args.count.max(1))
        .await?;
    Ok(())
}

async fn listen(config: CamlinkConfig, args: ListenArgs) -> anyhow::Result<()> {
    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.alerts.port)));
    let listener = AlertListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;

    loop {
        tokio::select! {
            received = listener.recv() => {
                let (message, from) = received?;
                component_info!("alert", "{} from {}", message, from);
                if message == ControlMessage::SleepAlert {
                    component_warn!("alert", "Sleep alert active");
                    listener.clear_alarm();
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
