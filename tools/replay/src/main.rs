//! streampace replay
//!
//! Feeds an Annex-B elementary stream through a decoder session backed by the
//! loopback decoder and prints the overlay line and the diagnostic report.
//! Useful for checking SPS patching and parameter-set handling against a
//! captured stream without a device.

use std::borrow::Cow;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sp_common::{BufferType, Resolution, VideoCodec};
use sp_decoder::bitstream::{nal::start_code_len, split_annex_b, NalHeader, START_CODE};
use sp_decoder::clock::Clock;
use sp_decoder::sim::LoopbackCodec;
use sp_decoder::{DecoderConfig, DecoderSession, MonotonicClock};

const DEFAULT_OVERLAY: &str =
    "{resolution} {decoder} | rx {received_fps:.1} fps, rendered {rendered_fps:.1} fps | \
     loss {loss_pct:.1}% | decode {decode_ms:.1} ms, e2e {e2e_ms:.1} ms";

/// Replay an Annex-B stream through a streampace decoder session
#[derive(Parser, Debug)]
#[command(name = "streampace-replay")]
#[command(version)]
struct Args {
    /// Annex-B elementary stream (.h264 / .h265)
    input: PathBuf,

    /// Codec of the input stream (h264, h265)
    #[arg(long, default_value = "h264")]
    codec: String,

    /// Decoder component name; selects the quirk tables
    #[arg(long, default_value = "c2.loopback.avc")]
    decoder_name: String,

    /// JSON file with a DecoderConfig; CLI flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Display refresh rate in Hz
    #[arg(long)]
    refresh: Option<u32>,

    /// Stream frame rate; frames are submitted at this rate
    #[arg(long, default_value = "60")]
    fps: u32,

    /// Drive the decoder through callbacks instead of polling
    #[arg(long)]
    callback_mode: bool,

    /// Submit as fast as possible instead of at --fps
    #[arg(long)]
    flood: bool,

    /// Overlay template printed at the end
    #[arg(long, default_value = DEFAULT_OVERLAY)]
    overlay: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    match EnvFilter::try_from_default_env() {
        Ok(filter) => FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        Err(_) => FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .init(),
    }
}

fn parse_codec(name: &str) -> anyhow::Result<VideoCodec> {
    match name.to_lowercase().as_str() {
        "h264" | "avc" => Ok(VideoCodec::H264),
        "h265" | "hevc" => Ok(VideoCodec::H265),
        other => bail!("unsupported codec '{other}' (expected h264 or h265)"),
    }
}

fn load_config(args: &Args) -> anyhow::Result<DecoderConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => DecoderConfig::default(),
    };

    config.codec = parse_codec(&args.codec)?;
    config.frame_rate = args.fps;
    if let (Some(width), Some(height)) = (args.width, args.height) {
        config.resolution = Resolution::new(width, height);
    } else if args.width.is_some() || args.height.is_some() {
        bail!("--width and --height must be given together");
    }
    if let Some(refresh) = args.refresh {
        config.refresh_rate = refresh;
    }
    if args.callback_mode {
        config.callback_mode = true;
    }
    Ok(config)
}

/// Widen a 3-byte start code to the 4-byte form the session expects.
fn with_long_start_code(nal: &[u8]) -> Cow<'_, [u8]> {
    match start_code_len(nal) {
        Some(3) => {
            let mut widened = Vec::with_capacity(nal.len() + 1);
            widened.extend_from_slice(&START_CODE);
            widened.extend_from_slice(&nal[3..]);
            Cow::Owned(widened)
        }
        _ => Cow::Borrowed(nal),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_config(&args)?;
    let stream = fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let nals = split_annex_b(&stream);
    if nals.is_empty() {
        bail!("{} contains no Annex-B start codes", args.input.display());
    }

    info!(
        input = %args.input.display(),
        bytes = stream.len(),
        nals = nals.len(),
        codec = %config.codec,
        "Replaying stream"
    );

    let codec = Arc::new(LoopbackCodec::new(&args.decoder_name, 8, 2 * 1024 * 1024));
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let mut session = DecoderSession::create(codec.clone(), None, config.clone(), clock.clone())
        .context("creating decoder session")?;
    session.start().context("starting decoder session")?;

    let frame_interval = Duration::from_micros(1_000_000 / u64::from(args.fps.max(1)));
    let mut frame_number = 0u32;
    let mut keyframe_requests = 0u32;

    for nal in nals {
        let Some(header) = NalHeader::parse(config.codec, nal) else {
            continue;
        };
        let kind = header.buffer_type(config.codec);
        if kind == BufferType::PicData && header.is_frame_start(config.codec) {
            frame_number += 1;
            if !args.flood && frame_number > 1 {
                thread::sleep(frame_interval);
            }
        }

        let data = with_long_start_code(nal);
        let status = session.submit_decode_unit(&data, kind, frame_number, clock.now_ms());
        if !status.is_ok() {
            keyframe_requests += 1;
            warn!(frame_number, ?kind, "Pipeline asked for a keyframe");
        }
        debug!(frame_number, ?kind, len = data.len(), ?status, "Submitted");
    }

    // Let the presentation thread catch up with the last frames.
    thread::sleep(frame_interval * 4);

    let stats = session.stats();

    println!("{}", session.format_info(&args.overlay));
    println!();
    println!("{}", session.diagnostics());
    println!();
    println!("Replay summary");
    println!("  Frames submitted: {frame_number}");
    println!("  Buffers queued:   {}", codec.queued_inputs().len());
    println!("  Frames released:  {}", codec.releases().len());
    println!("  Keyframe requests: {keyframe_requests}");
    println!("  Release mode changes: {}", stats.release_mode_changes);
    println!("{}", serde_json::to_string_pretty(&stats.lifetime())?);

    session.release();
    Ok(())
}
