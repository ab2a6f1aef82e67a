use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arqmodem_core::license::clamp;
use arqmodem_core::loopback::LoopbackMedium;
use arqmodem_core::rig::VoxRig;
use arqmodem_core::spectrum::{AnalyzerSettings, SpectralAnalyzer, SpectrumFrame};
use arqmodem_core::{
    Callsign, CodecParams, FrameEncoder, FrameReceiver, FrameType, LicenseEntitlement, Modem,
    ModemConfig, ModemError, ModemEvent, ProtocolFrame, ProtocolState, SessionEvent, Throughput,
    Tier,
};

mod wav;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedWav(String),

    #[error("No frames decoded from {0}")]
    NothingDecoded(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Session ended: {0}")]
    SessionEnded(String),
}

#[derive(Parser)]
#[command(name = "arqmodem")]
#[command(about = "Half-duplex ARQ sound card modem for amateur radio")]
struct Cli {
    /// Modem configuration file (TOML)
    #[arg(short, long, global = true, value_name = "CONFIG.TOML")]
    config: Option<PathBuf>,

    /// License tier limiting the negotiated throughput
    #[arg(short, long, global = true, default_value = "free")]
    tier: Tier,

    /// Callsign the license is issued to; overrides the configured one
    #[arg(long, global = true, value_name = "CALLSIGN")]
    licensed_callsign: Option<Callsign>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modulate a file into a burst of data frames and write it as WAV
    Encode {
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Destination station
        #[arg(long, default_value = "NOCALL")]
        to: Callsign,

        #[command(flatten)]
        mode: ModeArgs,
    },

    /// Demodulate data frames from a WAV file and write their payloads
    Decode {
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT.BIN")]
        output: PathBuf,

        #[command(flatten)]
        mode: ModeArgs,
    },

    /// Run the spectral analyzer over a WAV file and export the frames as JSON
    Spectrum {
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Output file; stdout when omitted
        #[arg(short, long, value_name = "OUTPUT.JSON")]
        output: Option<PathBuf>,
    },

    /// Connect two simulated stations over an in-process channel and
    /// transfer a message
    Simulate {
        /// Message to send from the calling station
        #[arg(short, long, default_value = "CQ CQ CQ de N0CALL")]
        message: String,

        /// How much faster than real time the channel runs
        #[arg(long, default_value = "4.0")]
        speedup: f64,

        /// Linear path gain between the stations
        #[arg(long, default_value = "1.0")]
        gain: f32,

        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    ShowConfig,

    /// List sound card devices
    #[cfg(feature = "cpal")]
    Devices,

    /// Run the modem on the sound card: listen, or call a station, and send
    /// lines read from stdin
    #[cfg(feature = "cpal")]
    Run {
        /// Station to call; listens for calls when omitted
        #[arg(long)]
        connect: Option<Callsign>,
    },
}

#[derive(clap::Args)]
struct ModeArgs {
    /// Occupied bandwidth in Hz; the call-mode bandwidth when omitted
    #[arg(long)]
    bandwidth: Option<u32>,

    /// Symbol rate in baud; the call-mode rate when omitted
    #[arg(long)]
    baud: Option<u32>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    let entitlement = entitlement(cli.tier, cli.licensed_callsign);

    match cli.command {
        Commands::Encode {
            input,
            output,
            to,
            mode,
        } => encode_command(&config, &entitlement, &input, &output, &to, &mode)?,
        Commands::Decode {
            input,
            output,
            mode,
        } => decode_command(&config, &entitlement, &input, &output, &mode)?,
        Commands::Spectrum { input, output } => {
            spectrum_command(&config, &input, output.as_deref())?
        }
        Commands::Simulate {
            message,
            speedup,
            gain,
            timeout,
        } => simulate_command(
            &config,
            &entitlement,
            &message,
            speedup,
            gain,
            Duration::from_secs(timeout),
        )?,
        Commands::ShowConfig => print!("{}", config.to_toml_string()?),
        #[cfg(feature = "cpal")]
        Commands::Devices => devices_command()?,
        #[cfg(feature = "cpal")]
        Commands::Run { connect } => run_command(config, entitlement, connect)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ModemConfig, ModemError> {
    match path {
        Some(path) => ModemConfig::load(path),
        None => Ok(ModemConfig::default()),
    }
}

fn entitlement(tier: Tier, callsign: Option<Callsign>) -> LicenseEntitlement {
    let entitlement = LicenseEntitlement::for_tier(tier);
    match callsign {
        Some(callsign) => entitlement.bound_to(callsign),
        None => entitlement,
    }
}

/// The throughput named on the command line, capped by the license.
fn mode_throughput(
    config: &ModemConfig,
    entitlement: &LicenseEntitlement,
    mode: &ModeArgs,
) -> Throughput {
    let call = config.modem.call_mode();
    let requested = Throughput::new(
        mode.bandwidth.unwrap_or(call.bandwidth_hz),
        mode.baud.unwrap_or(call.symbol_rate),
    );
    let granted = clamp(requested, entitlement);
    if granted != requested {
        warn!(
            "{} tier limits {} to {}",
            entitlement.tier(),
            requested,
            granted
        );
    }
    granted
}

fn station(config: &ModemConfig, entitlement: &LicenseEntitlement) -> Result<Callsign, ModemError> {
    if let Some(licensed) = entitlement.callsign() {
        return Ok(licensed.clone());
    }
    match config.modem.callsign.as_deref() {
        Some(text) => Callsign::new(text),
        None => Callsign::new("NOCALL"),
    }
}

fn encode_command(
    config: &ModemConfig,
    entitlement: &LicenseEntitlement,
    input: &Path,
    output: &Path,
    to: &Callsign,
    mode: &ModeArgs,
) -> Result<(), CliError> {
    let data = std::fs::read(input)?;
    info!("read {} bytes from {}", data.len(), input.display());

    let throughput = mode_throughput(config, entitlement, mode);
    let params = CodecParams::from_config(config, throughput);
    let mut encoder = FrameEncoder::new(&params)?;

    let source = station(config, entitlement)?.station_id();
    let destination = to.station_id();
    let mut frames: Vec<ProtocolFrame> = data
        .chunks(config.arq.mtu)
        .enumerate()
        .map(|(i, chunk)| {
            ProtocolFrame::new(FrameType::Data, source, destination, i as u16, chunk.to_vec())
        })
        .collect();
    if frames.is_empty() {
        frames.push(ProtocolFrame::new(
            FrameType::Data,
            source,
            destination,
            0,
            Vec::new(),
        ));
    }
    if let Some(last) = frames.last_mut() {
        last.flags.insert(arqmodem_core::framing::FrameFlags::OVER);
    }

    let tail = config.audio.block_size;
    let samples = encoder.encode_burst(&frames, tail)?;
    wav::write_mono(output, config.audio.sample_rate, &samples)?;

    let seconds = samples.len() as f64 / config.audio.sample_rate as f64;
    println!(
        "Encoded {} bytes into {} frames at {} ({:.1} s of audio)",
        data.len(),
        frames.len(),
        throughput,
        seconds
    );
    println!("Wrote {}", output.display());
    Ok(())
}

fn decode_command(
    config: &ModemConfig,
    entitlement: &LicenseEntitlement,
    input: &Path,
    output: &Path,
    mode: &ModeArgs,
) -> Result<(), CliError> {
    let (sample_rate, samples) = wav::read_mono(input)?;
    info!(
        "read {} samples ({:.1} s) from {}",
        samples.len(),
        samples.len() as f64 / sample_rate as f64,
        input.display()
    );

    let throughput = mode_throughput(config, entitlement, mode);
    let mut params = CodecParams::from_config(config, throughput);
    params.sample_rate = sample_rate;
    let mut receiver = FrameReceiver::new(&params)?;

    let mut frames = Vec::new();
    for block in samples.chunks(config.audio.block_size) {
        frames.extend(receiver.push(block));
    }
    let stats = receiver.stats();
    info!(
        "preambles {}, frames {}, header failures {}, payload failures {}",
        stats.preambles, stats.frames, stats.header_failures, stats.payload_failures
    );

    let mut data: Vec<ProtocolFrame> = frames
        .into_iter()
        .filter(|f| f.frame_type == FrameType::Data)
        .collect();
    if data.is_empty() {
        return Err(CliError::NothingDecoded(input.display().to_string()));
    }
    data.sort_by_key(|f| f.sequence);
    data.dedup_by_key(|f| f.sequence);

    let payload: Vec<u8> = data.iter().flat_map(|f| f.payload.iter().copied()).collect();
    std::fs::write(output, &payload)?;
    println!(
        "Decoded {} bytes from {} frames ({} -> {})",
        payload.len(),
        data.len(),
        data[0].source,
        data[0].destination
    );
    println!("Wrote {}", output.display());
    Ok(())
}

#[derive(Serialize)]
struct SpectrumExport<'a> {
    sample_rate: u32,
    fft_size: usize,
    frames: Vec<&'a SpectrumFrame>,
}

fn spectrum_command(
    config: &ModemConfig,
    input: &Path,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let (sample_rate, samples) = wav::read_mono(input)?;
    let mut settings = AnalyzerSettings::from_config(config, config.modem.bandwidth_hz);
    settings.sample_rate = sample_rate;
    let mut analyzer = SpectralAnalyzer::new(settings)?;

    let mut frames: Vec<Arc<SpectrumFrame>> = Vec::new();
    for block in samples.chunks(config.audio.block_size) {
        frames.extend(analyzer.push_samples(block));
    }
    if let Some((hz, db)) = frames
        .iter()
        .filter_map(|f| f.peak())
        .max_by(|a, b| a.1.total_cmp(&b.1))
    {
        info!("{} frames, strongest bin {:.1} Hz at {:.1} dB", frames.len(), hz, db);
    }

    let export = SpectrumExport {
        sample_rate,
        fft_size: config.spectrum.fft_size,
        frames: frames.iter().map(|f| f.as_ref()).collect(),
    };
    match output {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &export)?;
            println!("Wrote {} spectrum frames to {}", frames.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&export)?),
    }
    Ok(())
}

fn simulate_command(
    config: &ModemConfig,
    entitlement: &LicenseEntitlement,
    message: &str,
    speedup: f64,
    gain: f32,
    timeout: Duration,
) -> Result<(), CliError> {
    let medium = LoopbackMedium::new(config.audio.sample_rate, config.audio.block_size, speedup)?;
    medium.set_gain(gain);

    let start_station = |callsign: &str| -> Result<Modem, ModemError> {
        let mut station_config = config.clone();
        station_config.modem.callsign = Some(callsign.to_string());
        Modem::start(
            station_config,
            LicenseEntitlement::for_tier(entitlement.tier()),
            medium.station(callsign),
            Box::new(VoxRig::new()),
        )
    };
    let mut caller = start_station("N0CALL")?;
    let mut callee = start_station("K1ABC")?;
    let caller_events = caller.events();
    let callee_events = callee.events();

    callee.listen()?;
    caller.connect(callee.local())?;
    let started = Instant::now();
    let deadline = started + timeout;

    let mut sent = false;
    let mut received = Vec::new();
    loop {
        if Instant::now() > deadline {
            return Err(CliError::Timeout("the simulated transfer"));
        }
        while let Ok(event) = caller_events.try_recv() {
            log_event("N0CALL", &event);
            if let ModemEvent::Session(SessionEvent::SessionEstablished { .. }) = event {
                if !sent {
                    caller.send(message.as_bytes())?;
                    sent = true;
                }
            }
            if let ModemEvent::Session(SessionEvent::StateChanged {
                to: ProtocolState::Idle,
                reason,
                ..
            }) = event
            {
                if sent && received == message.as_bytes() {
                    let stats = caller.stats();
                    println!(
                        "Transferred {} bytes in {:.1} s ({} bursts, {} frames sent)",
                        received.len(),
                        started.elapsed().as_secs_f64() * speedup,
                        stats.bursts_sent,
                        stats.frames_sent
                    );
                    println!("{}", String::from_utf8_lossy(&received));
                    caller.shutdown();
                    callee.shutdown();
                    return Ok(());
                }
                let reason = reason.map(|r| r.to_string()).unwrap_or_default();
                return Err(CliError::SessionEnded(reason));
            }
        }
        while let Ok(event) = callee_events.try_recv() {
            log_event("K1ABC", &event);
            if let ModemEvent::Session(SessionEvent::DataReceived(data)) = event {
                received.extend(data);
                if received == message.as_bytes() {
                    caller.disconnect()?;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn log_event(station: &str, event: &ModemEvent) {
    match event {
        ModemEvent::Session(SessionEvent::StateChanged { from, to, reason }) => match reason {
            Some(reason) => info!("{}: {} -> {} ({})", station, from, to, reason),
            None => info!("{}: {} -> {}", station, from, to),
        },
        ModemEvent::Session(SessionEvent::SessionEstablished {
            remote,
            throughput,
            mtu,
        }) => info!("{}: connected to {} at {}, MTU {}", station, remote, throughput, mtu),
        ModemEvent::Session(SessionEvent::DataReceived(data)) => {
            info!("{}: received {} bytes", station, data.len())
        }
        ModemEvent::DeviceFault(fault) => warn!("{}: {}", station, fault.to_error()),
        other => tracing::debug!("{}: {:?}", station, other),
    }
}

#[cfg(feature = "cpal")]
fn devices_command() -> Result<(), CliError> {
    use arqmodem_core::cpal_backend::CpalBackend;
    use arqmodem_core::device::AudioBackend;

    let backend = CpalBackend::new();
    for (label, devices) in [
        ("Input", backend.input_devices()?),
        ("Output", backend.output_devices()?),
    ] {
        println!("{} devices:", label);
        for device in devices {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("  {}{}", device.name, marker);
        }
    }
    Ok(())
}

#[cfg(feature = "cpal")]
fn run_command(
    config: ModemConfig,
    entitlement: LicenseEntitlement,
    connect: Option<Callsign>,
) -> Result<(), CliError> {
    use std::io::BufRead;

    use arqmodem_core::cpal_backend::CpalBackend;

    let rig = arqmodem_core::rig::from_config(&config.rig)?;
    let mut modem = Modem::start(config, entitlement, Arc::new(CpalBackend::new()), rig)?;
    let events = modem.events();
    match connect {
        Some(remote) => modem.connect(remote)?,
        None => modem.listen()?,
    }

    let (lines_tx, mut lines) = crossbeam_channel::unbounded::<String>();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(Result::ok) {
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    let mut stdin_open = true;
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => {
                let Ok(event) = event else { break };
                log_event(modem.local().as_str(), &event);
                match event {
                    ModemEvent::Session(SessionEvent::DataReceived(data)) => {
                        println!("{}", String::from_utf8_lossy(&data));
                    }
                    ModemEvent::Session(SessionEvent::StateChanged {
                        to: ProtocolState::Idle,
                        ..
                    }) if !stdin_open => break,
                    _ => {}
                }
            }
            recv(lines) -> line => match line {
                Ok(line) => match modem.send(line.as_bytes()) {
                    Ok(frames) => tracing::debug!("queued {} frames", frames),
                    Err(e) => warn!("not sent: {}", e),
                },
                Err(_) => {
                    // End of input: hang up, then wait for the session to close.
                    stdin_open = false;
                    lines = crossbeam_channel::never();
                    if modem.state() == ProtocolState::Connected {
                        modem.disconnect()?;
                    } else {
                        break;
                    }
                }
            },
        }
    }
    modem.shutdown();
    Ok(())
}
