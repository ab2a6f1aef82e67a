//! The modem engine.
//!
//! [`Modem::start`] opens the audio streams and spawns the processing thread,
//! which owns everything that is not real time: it drains the capture ring
//! into the spectral analyzer and the frame receivers, drives the
//! [`ProtocolStateMachine`], modulates bursts into the playback ring and keys
//! the rig. The application talks to it through the [`Modem`] handle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;

use crate::arq::{
    Burst, ModeCheck, ProtocolState, ProtocolStateMachine, SessionEvent, TerminalReason,
};
use crate::callsign::Callsign;
use crate::codec::{CodecParams, FrameEncoder, FrameReceiver, ReceiverStats};
use crate::config::ModemConfig;
use crate::device::{AudioBackend, DeviceAdapter, DeviceFault, DeviceRef, StreamConfig};
use crate::error::{ModemError, Result};
use crate::fsk::MfskKernel;
use crate::license::{LicenseEntitlement, Throughput};
use crate::rig::{self, RigControl};
use crate::ring::{AudioBlock, AudioRing, RingConsumer, RingProducer, RingStats};
use crate::spectrum::{AnalyzerSettings, SpectralAnalyzer, SpectrumFrame};

/// Spectrum frames buffered for a slow display before new ones are dropped.
const SPECTRUM_QUEUE: usize = 64;
const AUDIO_RETRY: Duration = Duration::from_secs(1);
/// Slack on top of twice the airtime before a stalled burst is given up.
const TX_GRACE: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(1);
const MAX_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    Session(SessionEvent),
    TransmitStarted { frames: usize, airtime: Duration },
    TransmitFinished,
    /// The audio path failed. Any session was aborted; the engine retries
    /// the device once a second.
    DeviceFault(DeviceFault),
    AudioRestarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub capture: RingStats,
    pub playback: RingStats,
    pub call_receiver: ReceiverStats,
    pub session_receiver: Option<ReceiverStats>,
    pub bursts_sent: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub spectrum_dropped: u64,
}

enum Command {
    Listen(Sender<Result<()>>),
    Connect {
        remote: Callsign,
        requested: Option<Throughput>,
        reply: Sender<Result<()>>,
    },
    Send {
        data: Vec<u8>,
        reply: Sender<Result<usize>>,
    },
    Disconnect(Sender<Result<()>>),
    UpdateDisplay {
        reference_level_db: f32,
        range_db: f32,
        reply: Sender<Result<()>>,
    },
    Reconfigure {
        config: Box<ModemConfig>,
        reply: Sender<Result<()>>,
    },
    Shutdown,
}

struct Shared {
    local: RwLock<Callsign>,
    state: RwLock<ProtocolState>,
    waterfall: RwLock<Vec<Arc<SpectrumFrame>>>,
    stats: RwLock<EngineStats>,
}

/// Handle to a running modem. Dropping it shuts the engine down.
pub struct Modem {
    commands: Sender<Command>,
    events: Receiver<ModemEvent>,
    spectrum: Receiver<Arc<SpectrumFrame>>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Modem {
    /// Validate the configuration, open the audio streams and start the
    /// processing thread.
    pub fn start(
        config: ModemConfig,
        entitlement: LicenseEntitlement,
        backend: Arc<dyn AudioBackend>,
        rig: Box<dyn RigControl>,
    ) -> Result<Self> {
        config.validate()?;
        check_call_mode(&config, &entitlement)?;
        let local = station_callsign(&config, &entitlement)?;

        let (event_tx, events) = unbounded();
        let (spectrum_tx, spectrum) = bounded(SPECTRUM_QUEUE);
        let shared = Arc::new(Shared {
            local: RwLock::new(local.clone()),
            state: RwLock::new(ProtocolState::Idle),
            waterfall: RwLock::new(Vec::new()),
            stats: RwLock::new(EngineStats::default()),
        });

        let processor = Processor::new(
            config,
            entitlement,
            local.clone(),
            backend,
            rig,
            event_tx,
            spectrum_tx,
            shared.clone(),
        )?;
        let (commands, command_rx) = unbounded();
        let thread = thread::Builder::new()
            .name("modem-processing".to_string())
            .spawn(move || processor.run(command_rx))?;

        log::info!("modem started as {}", local);
        Ok(Self {
            commands,
            events,
            spectrum,
            shared,
            thread: Some(thread),
        })
    }

    pub fn local(&self) -> Callsign {
        self.shared.local.read().clone()
    }

    pub fn state(&self) -> ProtocolState {
        *self.shared.state.read()
    }

    pub fn stats(&self) -> EngineStats {
        *self.shared.stats.read()
    }

    pub fn listen(&self) -> Result<()> {
        self.request(Command::Listen)
    }

    /// Call `remote` at the configured session throughput.
    pub fn connect(&self, remote: Callsign) -> Result<()> {
        self.request(|reply| Command::Connect {
            remote,
            requested: None,
            reply,
        })
    }

    /// Call `remote` asking for `requested`; the license still caps it.
    pub fn connect_with(&self, remote: Callsign, requested: Throughput) -> Result<()> {
        self.request(|reply| Command::Connect {
            remote,
            requested: Some(requested),
            reply,
        })
    }

    /// Queue data for the connected station. Returns the number of frames.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.request(|reply| Command::Send { data, reply })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect)
    }

    /// Change the displayed dB range without touching anything else.
    pub fn update_display(&self, reference_level_db: f32, range_db: f32) -> Result<()> {
        self.request(|reply| Command::UpdateDisplay {
            reference_level_db,
            range_db,
            reply,
        })
    }

    /// Apply a new configuration. Spectrum display settings apply at once;
    /// audio, modem, ARQ and rig changes are refused while a session is
    /// active, and audio changes restart the streams.
    pub fn reconfigure(&self, config: ModemConfig) -> Result<()> {
        let config = Box::new(config);
        self.request(|reply| Command::Reconfigure { config, reply })
    }

    /// Protocol and device events, in order. Never dropped.
    ///
    /// The channel is unbounded so the engine never blocks or discards a
    /// session event. The application must keep draining it; events it does
    /// not read accumulate in memory for the life of the modem.
    pub fn events(&self) -> Receiver<ModemEvent> {
        self.events.clone()
    }

    /// Spectrum frames as they are computed. Frames are dropped, never
    /// reordered, when the consumer falls behind.
    pub fn spectrum_frames(&self) -> Receiver<Arc<SpectrumFrame>> {
        self.spectrum.clone()
    }

    /// Waterfall history, oldest first.
    pub fn waterfall(&self) -> Vec<Arc<SpectrumFrame>> {
        self.shared.waterfall.read().clone()
    }

    /// Stop the engine: abandon any burst, release PTT, close the streams.
    /// An active session is aborted, not disconnected.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Shutdown);
            if thread.join().is_err() {
                log::error!("modem processing thread panicked");
            }
        }
    }

    fn request<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = bounded(1);
        self.commands
            .send(make(reply))
            .map_err(|_| ModemError::EngineStopped)?;
        response.recv().map_err(|_| ModemError::EngineStopped)?
    }
}

impl Drop for Modem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The licensed callsign wins over the configured one.
fn station_callsign(config: &ModemConfig, entitlement: &LicenseEntitlement) -> Result<Callsign> {
    let configured = config
        .modem
        .callsign
        .as_deref()
        .map(Callsign::new)
        .transpose()?;
    match (entitlement.callsign(), configured) {
        (Some(licensed), Some(configured)) => {
            if licensed != &configured {
                log::warn!(
                    "configured callsign {} replaced by licensed callsign {}",
                    configured,
                    licensed
                );
            }
            Ok(licensed.clone())
        }
        (Some(licensed), None) => Ok(licensed.clone()),
        (None, Some(configured)) => Ok(configured),
        (None, None) => Err(ModemError::ConfigurationInvalid(
            "no station callsign configured".to_string(),
        )),
    }
}

/// Every station must be able to hear the call mode, so it has to fit the license.
fn check_call_mode(config: &ModemConfig, entitlement: &LicenseEntitlement) -> Result<()> {
    let call_mode = config.modem.call_mode();
    if call_mode.fits_within(entitlement.max()) {
        Ok(())
    } else {
        Err(ModemError::ConfigurationInvalid(format!(
            "call mode {} exceeds the {} license limit of {}",
            call_mode,
            entitlement.tier(),
            entitlement.max()
        )))
    }
}

/// Throughputs the codec can be built for at this sample rate and center.
fn mode_check(config: &ModemConfig) -> ModeCheck {
    let sample_rate = config.audio.sample_rate;
    let center_hz = config.modem.center_frequency_hz;
    Box::new(move |throughput| {
        MfskKernel::check_geometry(sample_rate, center_hz, throughput).map(|_| ())
    })
}

fn stream_config(config: &ModemConfig) -> StreamConfig {
    StreamConfig {
        sample_rate: config.audio.sample_rate,
        block_size: config.audio.block_size,
    }
}

fn tick(config: &ModemConfig) -> Duration {
    (stream_config(config).block_duration() / 4).clamp(MIN_TICK, MAX_TICK)
}

fn start_audio(
    adapter: &DeviceAdapter,
    config: &ModemConfig,
) -> Result<(RingConsumer, RingProducer)> {
    let audio = &config.audio;
    let (capture_tx, capture_rx) = AudioRing::with_capacity(audio.ring_blocks);
    let (playback_tx, playback_rx) = AudioRing::with_capacity(audio.ring_blocks);
    adapter.start(
        stream_config(config),
        &DeviceRef::from_name(audio.input_device.as_deref()),
        &DeviceRef::from_name(audio.output_device.as_deref()),
        capture_tx,
        playback_rx,
    )?;
    Ok((capture_rx, playback_tx))
}

/// Encoder and receiver for one on-air mode.
struct Codec {
    encoder: FrameEncoder,
    receiver: FrameReceiver,
}

impl Codec {
    fn new(params: &CodecParams) -> Result<Self> {
        Ok(Self {
            encoder: FrameEncoder::new(params)?,
            receiver: FrameReceiver::new(params)?,
        })
    }
}

/// A burst on its way through the playback ring.
struct Transmission {
    samples: Vec<f32>,
    written: usize,
    played_start: u64,
    deadline: Instant,
}

struct Processor {
    config: ModemConfig,
    entitlement: LicenseEntitlement,
    local: Callsign,
    machine: ProtocolStateMachine,
    adapter: DeviceAdapter,
    faults: Receiver<DeviceFault>,
    capture: RingConsumer,
    playback: RingProducer,
    capture_overruns: u64,
    audio_retry_at: Option<Instant>,
    analyzer: SpectralAnalyzer,
    /// Always listening in call mode.
    call: Codec,
    /// Present while a session runs in a mode other than call mode.
    session: Option<Codec>,
    rig: Box<dyn RigControl>,
    tx: Option<Transmission>,
    tx_blocks: u64,
    events: Sender<ModemEvent>,
    spectrum: Sender<Arc<SpectrumFrame>>,
    shared: Arc<Shared>,
    stats: EngineStats,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: ModemConfig,
        entitlement: LicenseEntitlement,
        local: Callsign,
        backend: Arc<dyn AudioBackend>,
        rig: Box<dyn RigControl>,
        events: Sender<ModemEvent>,
        spectrum: Sender<Arc<SpectrumFrame>>,
        shared: Arc<Shared>,
    ) -> Result<Self> {
        let call_mode = config.modem.call_mode();
        let call = Codec::new(&CodecParams::from_config(&config, call_mode))?;
        let analyzer =
            SpectralAnalyzer::new(AnalyzerSettings::from_config(&config, call_mode.bandwidth_hz))?;
        let mut machine =
            ProtocolStateMachine::new(local.clone(), entitlement.clone(), config.arq.clone());
        machine.set_mode_check(mode_check(&config));

        let adapter = DeviceAdapter::new(backend);
        let faults = adapter.faults();
        let (capture, playback) = start_audio(&adapter, &config)?;

        Ok(Self {
            config,
            entitlement,
            local,
            machine,
            adapter,
            faults,
            capture,
            playback,
            capture_overruns: 0,
            audio_retry_at: None,
            analyzer,
            call,
            session: None,
            rig,
            tx: None,
            tx_blocks: 0,
            events,
            spectrum,
            shared,
            stats: EngineStats::default(),
        })
    }

    fn run(mut self, commands: Receiver<Command>) {
        loop {
            self.step(Instant::now());
            match commands.recv_timeout(tick(&self.config)) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.finish();
    }

    fn step(&mut self, now: Instant) {
        while let Ok(fault) = self.faults.try_recv() {
            self.on_device_fault(fault, now);
        }
        if self.audio_retry_at.is_some_and(|t| t <= now) {
            self.restart_audio(now);
        }

        self.process_capture(now);
        self.call.receiver.check_timeout(now);
        if let Some(session) = self.session.as_mut() {
            session.receiver.check_timeout(now);
        }
        self.machine.handle_timeout(now);
        // A session mode must exist before its first frame is modulated.
        self.forward_events();

        self.service_transmission(now);
        self.forward_events();
        self.publish_stats();
    }

    fn process_capture(&mut self, now: Instant) {
        let overruns = self.capture.stats().overruns;
        if overruns > self.capture_overruns {
            log::warn!(
                "capture ring overrun, {} block(s) lost; resynchronizing",
                overruns - self.capture_overruns
            );
            self.capture_overruns = overruns;
            self.capture.resync();
            self.reset_receivers();
        }

        let mut updated = false;
        while let Some(block) = self.capture.pop_block() {
            for frame in self.analyzer.push_samples(block.samples()) {
                if self.spectrum.try_send(frame).is_err() {
                    self.stats.spectrum_dropped += 1;
                }
                updated = true;
            }

            // Our own transmission, as far as the receiver can hear it.
            if self.tx.is_some() || self.machine.is_transmitting() {
                self.capture.recycle(block);
                continue;
            }
            let mut heard = self.call.receiver.push(block.samples());
            if let Some(session) = self.session.as_mut() {
                heard.extend(session.receiver.push(block.samples()));
            }
            self.capture.recycle(block);
            for frame in heard {
                log::debug!(
                    "heard {:?} #{} from {}",
                    frame.frame_type,
                    frame.sequence,
                    frame.source
                );
                self.stats.frames_received += 1;
                self.machine.handle_frame(frame, now);
            }
            self.forward_events();
        }
        if updated {
            *self.shared.waterfall.write() = self.analyzer.waterfall().snapshot();
        }

        // Someone is mid-frame on the channel.
        let busy = !self.call.receiver.is_hunting()
            || self
                .session
                .as_ref()
                .is_some_and(|s| !s.receiver.is_hunting());
        if busy {
            self.machine
                .hold_channel(now + self.config.arq.turnaround());
        }
    }

    fn service_transmission(&mut self, now: Instant) {
        if self.tx.is_none() && self.adapter.is_running() {
            if let Some(burst) = self.machine.poll_transmit(now) {
                self.begin_burst(burst, now);
            }
        }

        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        let block_size = self.config.audio.block_size;
        let sample_rate = self.config.audio.sample_rate;
        while tx.written < tx.samples.len() && self.playback.has_room() {
            let end = (tx.written + block_size).min(tx.samples.len());
            let timestamp =
                Duration::from_nanos(tx.written as u64 * 1_000_000_000 / sample_rate as u64);
            let block = AudioBlock::new(
                tx.samples[tx.written..end].to_vec(),
                sample_rate,
                self.tx_blocks,
                timestamp,
            );
            if self.playback.write(block).is_err() {
                break;
            }
            self.tx_blocks += 1;
            tx.written = end;
        }

        let total = tx.samples.len();
        let played = self.adapter.played_samples().saturating_sub(tx.played_start);
        let done = tx.written == total && played >= total as u64;
        if !done && now < tx.deadline {
            return;
        }
        if !done {
            log::warn!("playback stalled after {} of {} samples", played, total);
        }
        self.end_burst(now);
    }

    fn begin_burst(&mut self, burst: Burst, now: Instant) {
        let samples = match self.modulate(&burst) {
            Ok(samples) => samples,
            Err(e) => {
                log::error!("cannot modulate burst: {}", e);
                self.machine.on_transmit_complete(now);
                return;
            }
        };
        if let Err(e) = self.rig.set_ptt(true) {
            // Left to the retransmission timers, like a burst nobody heard.
            log::error!("PTT on failed, burst not sent: {}", e);
            self.machine.on_transmit_complete(now);
            return;
        }

        let airtime =
            Duration::from_secs_f64(samples.len() as f64 / self.config.audio.sample_rate as f64);
        log::debug!("keyed {} for {:?}", self.rig.name(), airtime);
        self.stats.bursts_sent += 1;
        self.stats.frames_sent += burst.len() as u64;
        let _ = self.events.send(ModemEvent::TransmitStarted {
            frames: burst.len(),
            airtime,
        });
        self.tx = Some(Transmission {
            samples,
            written: 0,
            played_start: self.adapter.played_samples(),
            deadline: now + airtime * 2 + TX_GRACE,
        });
    }

    fn modulate(&mut self, burst: &Burst) -> Result<Vec<f32>> {
        let mut samples = Vec::new();
        for frame in &burst.frames {
            let encoder = match self.session.as_mut() {
                Some(session) if !frame.frame_type.uses_call_mode() => &mut session.encoder,
                _ => &mut self.call.encoder,
            };
            samples.extend(encoder.encode(frame)?);
        }
        // The last symbol must clear the transmitter before PTT drops.
        samples.resize(samples.len() + self.config.audio.block_size, 0.0);
        Ok(samples)
    }

    fn end_burst(&mut self, now: Instant) {
        self.tx = None;
        if let Err(e) = self.rig.set_ptt(false) {
            log::error!("PTT off failed: {}", e);
        }
        self.machine.on_transmit_complete(now);
        self.reset_receivers();
        let _ = self.events.send(ModemEvent::TransmitFinished);
    }

    fn reset_receivers(&mut self) {
        self.call.receiver.reset();
        if let Some(session) = self.session.as_mut() {
            session.receiver.reset();
        }
    }

    fn on_device_fault(&mut self, fault: DeviceFault, now: Instant) {
        log::warn!("{}", fault.to_error());
        if self.tx.take().is_some() {
            log::warn!("transmission abandoned");
        }
        if let Err(e) = self.rig.set_ptt(false) {
            log::error!("PTT off failed: {}", e);
        }
        self.machine.abort(TerminalReason::StreamDropped);
        self.adapter.stop();
        self.reset_receivers();
        self.forward_events();
        let _ = self.events.send(ModemEvent::DeviceFault(fault));
        self.audio_retry_at = Some(now + AUDIO_RETRY);
    }

    fn restart_audio(&mut self, now: Instant) {
        self.audio_retry_at = None;
        self.adapter.stop();
        match start_audio(&self.adapter, &self.config) {
            Ok((capture, playback)) => {
                self.capture = capture;
                self.playback = playback;
                self.capture_overruns = 0;
                log::info!("audio restarted");
                let _ = self.events.send(ModemEvent::AudioRestarted);
            }
            Err(e) => {
                log::warn!("audio restart failed: {}", e);
                self.audio_retry_at = Some(now + AUDIO_RETRY);
            }
        }
    }

    fn forward_events(&mut self) {
        while let Some(event) = self.machine.poll_event() {
            match &event {
                SessionEvent::SessionEstablished { throughput, .. } => {
                    self.open_session_mode(*throughput)
                }
                SessionEvent::StateChanged {
                    to: ProtocolState::Idle,
                    ..
                } => self.close_session_mode(),
                _ => {}
            }
            *self.shared.state.write() = self.machine.state();
            let _ = self.events.send(ModemEvent::Session(event));
        }
    }

    fn open_session_mode(&mut self, throughput: Throughput) {
        if throughput == self.config.modem.call_mode() {
            self.session = None;
        } else {
            match Codec::new(&CodecParams::from_config(&self.config, throughput)) {
                Ok(codec) => self.session = Some(codec),
                Err(e) => {
                    log::error!("cannot run a session at {}: {}", throughput, e);
                    self.machine.abort(TerminalReason::LinkFailure);
                    return;
                }
            }
        }
        self.analyzer.set_bandwidth(throughput.bandwidth_hz);
    }

    fn close_session_mode(&mut self) {
        self.session = None;
        self.analyzer
            .set_bandwidth(self.config.modem.call_mode().bandwidth_hz);
    }

    fn publish_stats(&mut self) {
        self.stats.capture = self.capture.stats();
        self.stats.playback = self.playback.stats();
        self.stats.call_receiver = self.call.receiver.stats();
        self.stats.session_receiver = self.session.as_ref().map(|s| s.receiver.stats());
        *self.shared.stats.write() = self.stats;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen(reply) => {
                let result = self.require_audio().and_then(|_| self.machine.listen());
                let _ = reply.send(result);
            }
            Command::Connect {
                remote,
                requested,
                reply,
            } => {
                let requested = requested.unwrap_or_else(|| self.config.modem.requested());
                let result = self
                    .require_audio()
                    .and_then(|_| self.machine.connect(remote, requested));
                let _ = reply.send(result);
            }
            Command::Send { data, reply } => {
                let _ = reply.send(self.machine.send(&data));
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.machine.disconnect());
            }
            Command::UpdateDisplay {
                reference_level_db,
                range_db,
                reply,
            } => {
                let result = self
                    .analyzer
                    .set_display_range(reference_level_db, range_db)
                    .map(|_| {
                        self.config.spectrum.reference_level_db = reference_level_db;
                        self.config.spectrum.range_db = range_db;
                    });
                let _ = reply.send(result);
            }
            Command::Reconfigure { config, reply } => {
                let _ = reply.send(self.reconfigure(*config, Instant::now()));
            }
            Command::Shutdown => {}
        }
        self.forward_events();
    }

    fn require_audio(&self) -> Result<()> {
        if self.adapter.is_running() {
            Ok(())
        } else {
            Err(ModemError::DeviceUnavailable("audio is not running".to_string()))
        }
    }

    fn reconfigure(&mut self, new: ModemConfig, now: Instant) -> Result<()> {
        new.validate()?;
        check_call_mode(&new, &self.entitlement)?;
        let state = self.machine.state();
        let audio_changed = new.audio != self.config.audio;
        let modem_changed = new.modem != self.config.modem;
        let arq_changed = new.arq != self.config.arq;
        let rig_changed = new.rig != self.config.rig;
        let fft_changed = new.spectrum.fft_size != self.config.spectrum.fft_size;
        let air_changed = audio_changed || modem_changed || arq_changed || rig_changed;

        if !matches!(state, ProtocolState::Idle | ProtocolState::Listening)
            && (air_changed || fft_changed)
        {
            return Err(ModemError::InvalidState {
                operation: "reconfigure",
                state: state.name(),
            });
        }
        if self.tx.is_some() && air_changed {
            return Err(ModemError::InvalidState {
                operation: "reconfigure",
                state: "TRANSMITTING",
            });
        }

        // Build everything fallible before touching the running engine.
        let local = station_callsign(&new, &self.entitlement)?;
        let bandwidth = match self.machine.session() {
            Some(session) => session.throughput().bandwidth_hz,
            None => new.modem.call_mode().bandwidth_hz,
        };
        let settings = AnalyzerSettings::from_config(&new, bandwidth);
        settings.validate()?;
        let call = if audio_changed || modem_changed {
            Some(Codec::new(&CodecParams::from_config(
                &new,
                new.modem.call_mode(),
            ))?)
        } else {
            None
        };
        let rig = if rig_changed {
            Some(rig::from_config(&new.rig)?)
        } else {
            None
        };

        if audio_changed {
            self.adapter.stop();
            match start_audio(&self.adapter, &new) {
                Ok((capture, playback)) => {
                    self.capture = capture;
                    self.playback = playback;
                    self.capture_overruns = 0;
                    self.audio_retry_at = None;
                }
                Err(e) => {
                    log::warn!("cannot start audio with the new settings: {}", e);
                    self.restart_audio(now);
                    return Err(e);
                }
            }
        }

        self.analyzer.reconfigure(settings)?;
        *self.shared.waterfall.write() = self.analyzer.waterfall().snapshot();
        if let Some(call) = call {
            self.call = call;
            self.session = None;
        }
        if let Some(rig) = rig {
            log::info!("rig control now {}", rig.name());
            self.rig = rig;
        }
        if arq_changed || local != self.local {
            let listening = state == ProtocolState::Listening;
            self.machine =
                ProtocolStateMachine::new(local.clone(), self.entitlement.clone(), new.arq.clone());
            if listening {
                self.machine.listen()?;
                // Still listening as far as the application is concerned.
                while self.machine.poll_event().is_some() {}
            }
            *self.shared.local.write() = local.clone();
            self.local = local;
        }
        self.machine.set_mode_check(mode_check(&new));
        self.config = new;
        log::info!("configuration updated");
        Ok(())
    }

    fn finish(mut self) {
        if self.tx.take().is_some() {
            log::warn!("shutting down mid-transmission");
        }
        if let Err(e) = self.rig.set_ptt(false) {
            log::error!("PTT off failed: {}", e);
        }
        self.machine.abort(TerminalReason::Cancelled);
        self.forward_events();
        self.adapter.stop();
        log::info!("modem engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::Tier;
    use crate::loopback::LoopbackMedium;
    use crate::rig::VoxRig;

    fn config(callsign: Option<&str>) -> ModemConfig {
        let mut config = ModemConfig::default();
        config.audio.sample_rate = 8_000;
        config.audio.block_size = 256;
        config.spectrum.fft_size = 512;
        config.modem.callsign = callsign.map(str::to_string);
        config.modem.bandwidth_hz = 1_000;
        config.modem.symbol_rate = 250;
        config.modem.call_bandwidth_hz = 1_000;
        config.modem.call_symbol_rate = 250;
        config.modem.leader_ms = 60;
        config
    }

    fn start(medium: &LoopbackMedium, name: &str) -> Modem {
        Modem::start(
            config(Some(name)),
            LicenseEntitlement::for_tier(Tier::Basic),
            medium.station(name),
            Box::new(VoxRig::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_station_callsign_prefers_license() {
        let licensed = LicenseEntitlement::for_tier(Tier::Free)
            .bound_to(Callsign::new("K1ABC").unwrap());
        assert_eq!(
            station_callsign(&config(Some("N0CALL")), &licensed).unwrap(),
            Callsign::new("K1ABC").unwrap()
        );
        let unbound = LicenseEntitlement::for_tier(Tier::Free);
        assert_eq!(
            station_callsign(&config(Some("n0call")), &unbound).unwrap(),
            Callsign::new("N0CALL").unwrap()
        );
        assert!(matches!(
            station_callsign(&config(None), &unbound),
            Err(ModemError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_start_and_spectrum_flow() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let modem = start(&medium, "N0CALL");
        assert_eq!(modem.state(), ProtocolState::Idle);
        assert_eq!(modem.local().as_str(), "N0CALL");

        let frame = modem
            .spectrum_frames()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(frame.fft_size, 512);
        let deadline = Instant::now() + Duration::from_secs(5);
        while modem.waterfall().is_empty() {
            assert!(Instant::now() < deadline, "waterfall never filled");
            thread::sleep(Duration::from_millis(10));
        }

        modem.update_display(0.0, 60.0).unwrap();
        assert!(matches!(
            modem.update_display(0.0, -1.0),
            Err(ModemError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_requests_checked_against_state() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let modem = start(&medium, "N0CALL");
        assert!(matches!(
            modem.send(b"hello"),
            Err(ModemError::InvalidState { operation: "send", .. })
        ));
        modem.listen().unwrap();
        assert_eq!(modem.state(), ProtocolState::Listening);
        modem.disconnect().unwrap();
        assert_eq!(modem.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_reconfigure_validates_first() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let modem = start(&medium, "N0CALL");

        let mut bad = config(Some("N0CALL"));
        bad.spectrum.fft_size = 1000;
        assert!(matches!(
            modem.reconfigure(bad),
            Err(ModemError::ConfigurationInvalid(_))
        ));

        let mut display = config(Some("N0CALL"));
        display.spectrum.history = 10;
        display.spectrum.window = crate::spectrum::WindowFunction::Blackman;
        modem.reconfigure(display).unwrap();

        // The loopback medium only runs at 8 kHz.
        let mut other_rate = config(Some("N0CALL"));
        other_rate.audio.sample_rate = 16_000;
        assert!(matches!(
            modem.reconfigure(other_rate),
            Err(ModemError::FormatUnsupported(_))
        ));
        // Audio came back with the old settings.
        modem.listen().unwrap();
    }

    #[test]
    fn test_connect_rejects_unbuildable_mode() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let modem = start(&medium, "N0CALL");
        let remote = Callsign::new("K1ABC").unwrap();
        // One tone slot: within the license, but no MFSK mode fits.
        assert!(matches!(
            modem.connect_with(remote.clone(), Throughput::new(150, 100)),
            Err(ModemError::ConfigurationInvalid(_))
        ));
        assert_eq!(modem.state(), ProtocolState::Idle);
        modem.connect_with(remote, Throughput::new(500, 100)).unwrap();
        assert_eq!(modem.state(), ProtocolState::Connecting);
    }

    #[test]
    fn test_call_mode_must_fit_license() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let free = Modem::start(
            config(Some("N0CALL")),
            LicenseEntitlement::for_tier(Tier::Free),
            medium.station("N0CALL"),
            Box::new(VoxRig::new()),
        );
        assert!(matches!(free, Err(ModemError::ConfigurationInvalid(_))));

        let modem = start(&medium, "K1ABC");
        let mut wide = config(Some("K1ABC"));
        wide.modem.call_bandwidth_hz = 2_000;
        wide.modem.call_symbol_rate = 500;
        assert!(matches!(
            modem.reconfigure(wide),
            Err(ModemError::ConfigurationInvalid(_))
        ));
        modem.listen().unwrap();
    }

    #[test]
    fn test_undrained_events_are_kept_in_order() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let modem = start(&medium, "N0CALL");
        for _ in 0..200 {
            modem.listen().unwrap();
            modem.disconnect().unwrap();
        }

        let events = modem.events();
        let mut changes = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while changes.len() < 400 && Instant::now() < deadline {
            if let Ok(ModemEvent::Session(SessionEvent::StateChanged { to, .. })) =
                events.recv_timeout(Duration::from_millis(100))
            {
                changes.push(to);
            }
        }
        assert_eq!(changes.len(), 400);
        for pair in changes.chunks(2) {
            assert_eq!(pair, [ProtocolState::Listening, ProtocolState::Idle]);
        }
    }

    #[test]
    fn test_stream_drop_aborts_and_recovers() {
        let medium = LoopbackMedium::new(8_000, 256, 4.0).unwrap();
        let backend = medium.station("N0CALL");
        let modem = Modem::start(
            config(Some("N0CALL")),
            LicenseEntitlement::for_tier(Tier::Basic),
            backend.clone(),
            Box::new(VoxRig::new()),
        )
        .unwrap();
        let events = modem.events();
        modem.listen().unwrap();

        medium.drop_stream(&backend);
        let mut saw_abort = false;
        let mut saw_fault = false;
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(ModemEvent::Session(SessionEvent::StateChanged {
                    to: ProtocolState::Idle,
                    reason: Some(TerminalReason::StreamDropped),
                    ..
                })) => saw_abort = true,
                Ok(ModemEvent::DeviceFault(_)) => saw_fault = true,
                Ok(ModemEvent::AudioRestarted) => break,
                _ => {}
            }
        }
        assert!(saw_abort && saw_fault);
        assert_eq!(modem.state(), ProtocolState::Idle);
        modem.listen().unwrap();
    }
}
