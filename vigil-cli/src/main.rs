//! Vigil command line tool.
//!
//! ```bash
//! vigil info --input capture.h264
//! vigil export --input dump/ --output clip.mp4
//! vigil dump --input capture.h264 --output dump/
//! vigil join --input dump/ --output capture.h264
//! vigil escape --input nalu.rbsp --output nalu.bin --start-code 4
//! vigil record --input capture.h264 --output recording.h264 --history-ms 2000
//! ```

mod config;
mod sink;

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use vigil_bitstream::{decode_annexb, encode_annexb, start_code_len, AbstractNaluType, Codec, StartCode};
use vigil_packet::PacketBuffer;
use vigil_recorder::VideoRecorder;
use vigil_ringbuffer::VideoRingBuffer;

use crate::config::ToolConfig;
use crate::sink::AnnexbFileSink;

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Camera video capture toolkit", arg_required_else_help = true)]
struct Cli {
    /// JSON tool configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print stream parameters and packet statistics.
    Info(InfoArgs),
    /// Export to an MPEG-TS or MP4 file.
    Export(ExportArgs),
    /// Write every NAL unit to its own file.
    Dump(ConvertArgs),
    /// Join a NAL unit dump into an Annex-B elementary stream.
    Join(ConvertArgs),
    /// Add a start code and emulation-prevention bytes to a raw NAL unit.
    Escape(EscapeArgs),
    /// Remove emulation-prevention bytes from a NAL unit.
    Unescape(FileArgs),
    /// Replay a capture through a ring buffer and recorder.
    Record(RecordArgs),
}

#[derive(Args, Debug, Clone)]
struct InputArgs {
    /// Annex-B elementary stream, or a directory written by `dump`.
    #[arg(short, long)]
    input: PathBuf,

    /// Codec of the input.
    #[arg(long, default_value = "h264")]
    codec: Codec,

    /// Frame rate used to stamp packets of an elementary stream.
    #[arg(long, default_value_t = 25.0)]
    fps: f64,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Print one line per packet.
    #[arg(short, long)]
    verbose: bool,

    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerFormat {
    Ts,
    Mp4,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    input: InputArgs,

    #[arg(short, long)]
    output: PathBuf,

    /// Container format; inferred from the output extension when omitted.
    #[arg(long, value_enum)]
    format: Option<ContainerFormat>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    input: InputArgs,

    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FileArgs {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct EscapeArgs {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    /// Start code length to prepend: 0, 3 or 4.
    #[arg(long, default_value_t = 3)]
    start_code: usize,
}

#[derive(Args, Debug)]
struct RecordArgs {
    #[command(flatten)]
    input: InputArgs,

    #[arg(short, long)]
    output: PathBuf,

    /// History to include, overriding the configuration.
    #[arg(long)]
    history_ms: Option<u64>,

    /// Start recording after this many packets have been buffered.
    #[arg(long, default_value_t = 50)]
    start_after: usize,

    /// Replay at the stream's frame rate instead of as fast as possible.
    #[arg(long)]
    realtime: bool,
}

#[derive(Serialize, Debug)]
struct StreamInfo {
    codec: Codec,
    packets: usize,
    keyframes: usize,
    payload_bytes: usize,
    duration_ms: u128,
    width: Option<u32>,
    height: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ToolConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Info(args) => info_command(&args),
        Commands::Export(args) => export_command(&args),
        Commands::Dump(args) => dump_command(&args),
        Commands::Join(args) => join_command(&args, &config),
        Commands::Escape(args) => escape_command(&args),
        Commands::Unescape(args) => unescape_command(&args),
        Commands::Record(args) => record_command(&args, &config),
    }
}

/// Load a capture as packets.
fn load_input(args: &InputArgs) -> Result<PacketBuffer> {
    if args.input.is_dir() {
        return PacketBuffer::load_bin_dir(&args.input, args.codec)
            .with_context(|| format!("loading dump {}", args.input.display()));
    }
    if !(args.fps > 0.0 && args.fps.is_finite()) {
        bail!("invalid frame rate {}", args.fps);
    }
    let data = fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let buf = PacketBuffer::from_annexb_stream(
        args.codec,
        &data,
        Duration::from_secs_f64(1.0 / args.fps),
        SystemTime::now(),
    );
    info!(input = %args.input.display(), packets = buf.len(), "Loaded elementary stream");
    Ok(buf)
}

fn info_command(args: &InfoArgs) -> Result<()> {
    let buf = load_input(&args.input)?;
    let dimensions = buf.decode_header().ok();
    let info = StreamInfo {
        codec: buf.codec(),
        packets: buf.len(),
        keyframes: buf.packets.iter().filter(|p| p.has_idr()).count(),
        payload_bytes: buf.payload_bytes(),
        duration_ms: buf.duration().as_millis(),
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("codec:      {}", info.codec);
    println!("packets:    {} ({} keyframes)", info.packets, info.keyframes);
    println!("payload:    {} bytes", info.payload_bytes);
    println!("duration:   {} ms", info.duration_ms);
    match dimensions {
        Some((w, h)) => println!("dimensions: {w}x{h}"),
        None => println!("dimensions: unknown (no SPS)"),
    }
    if let Some(index) = buf.find_first_packet_of_type(AbstractNaluType::EssentialMetadata) {
        println!("first parameter set at packet {index}");
    }
    if args.verbose {
        for (i, packet) in buf.packets.iter().enumerate() {
            println!("{i:5} {:>8} ms  {}", packet.pts.as_millis(), packet.summary());
        }
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let format = match args.format {
        Some(format) => format,
        None => match args.output.extension().and_then(|e| e.to_str()) {
            Some("mp4") => ContainerFormat::Mp4,
            Some("ts") => ContainerFormat::Ts,
            _ => bail!("cannot infer container format of {}, use --format", args.output.display()),
        },
    };

    let buf = load_input(&args.input)?;
    let file = fs::File::create(&args.output).with_context(|| format!("creating {}", args.output.display()))?;
    let out = BufWriter::new(file);
    let mut out = match format {
        ContainerFormat::Ts => buf.save_to_mpegts(out),
        ContainerFormat::Mp4 => buf.save_to_mp4(out),
    }
    .with_context(|| format!("exporting to {}", args.output.display()))?;
    out.flush()?;

    info!(output = %args.output.display(), ?format, packets = buf.len(), "Export complete");
    Ok(())
}

fn dump_command(args: &ConvertArgs) -> Result<()> {
    let buf = load_input(&args.input)?;
    let files = buf
        .dump_bin(&args.output)
        .with_context(|| format!("dumping to {}", args.output.display()))?;
    info!(output = %args.output.display(), files, "Dump complete");
    Ok(())
}

fn join_command(args: &ConvertArgs, config: &ToolConfig) -> Result<()> {
    let buf = load_input(&args.input)?;
    let mut out = BufWriter::new(
        fs::File::create(&args.output).with_context(|| format!("creating {}", args.output.display()))?,
    );
    for packet in &buf.packets {
        out.write_all(&packet.encode_to_annexb_packet_with(&config.packet)?)?;
    }
    out.flush()?;
    info!(output = %args.output.display(), packets = buf.len(), "Join complete");
    Ok(())
}

fn escape_command(args: &EscapeArgs) -> Result<()> {
    let start_code = StartCode::from_len(args.start_code)
        .with_context(|| format!("invalid start code length {}", args.start_code))?;
    let raw = read(&args.input)?;
    let encoded = encode_annexb(&raw, start_code, true)?;
    info!(input = raw.len(), output = encoded.len(), "Escaped NAL unit");
    write(&args.output, &encoded)
}

fn unescape_command(args: &FileArgs) -> Result<()> {
    let encoded = read(&args.input)?;
    let body = &encoded[start_code_len(&encoded)..];
    let raw = decode_annexb(body);
    info!(input = encoded.len(), output = raw.len(), "Unescaped NAL unit");
    write(&args.output, &raw)
}

fn record_command(args: &RecordArgs, config: &ToolConfig) -> Result<()> {
    let buf = load_input(&args.input)?;
    let ring = Arc::new(VideoRingBuffer::new(config.ring_buffer.clone()));
    let sink = Arc::new(AnnexbFileSink::create(&args.output)?);

    let mut recorder_config = config.recorder.clone();
    if let Some(ms) = args.history_ms {
        recorder_config.include_history = Duration::from_millis(ms);
    }
    let frame_interval = Duration::from_secs_f64(1.0 / args.input.fps);

    let mut recorder = None;
    for (i, packet) in buf.packets.iter().enumerate() {
        if i == args.start_after {
            recorder = Some(VideoRecorder::start(
                Arc::clone(&ring),
                "replay",
                sink.clone(),
                recorder_config.clone(),
            )?);
        }
        ring.add(Arc::clone(packet));
        if args.realtime {
            thread::sleep(frame_interval);
        }
    }

    let Some(mut recorder) = recorder else {
        bail!(
            "input has {} packets, recording would start after {}",
            buf.len(),
            args.start_after
        );
    };
    // let the recorder catch up with the live feed
    thread::sleep(Duration::from_millis(200));
    recorder.stop();
    sink.finish()?;

    let stats = recorder.stats();
    let (nalus, bytes) = sink.totals();
    info!(
        history_packets = stats.history_packets,
        packets_written = stats.packets_written,
        write_failures = stats.write_failures,
        nalus,
        bytes,
        "Recording complete"
    );
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}
