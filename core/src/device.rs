//! Audio device adapter.
//!
//! Opens an input and an output stream on an [`AudioBackend`], chops captured
//! audio into fixed-size [`AudioBlock`]s for the capture ring, and plays
//! whatever the processing thread puts in the playback ring. The callbacks
//! only touch the rings and atomics.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{ModemError, Result};
use crate::ring::{AudioBlock, RingConsumer, RingProducer};

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;
pub const MAX_BLOCK_SIZE: usize = 16_384;

/// Mono stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub block_size: usize,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ModemError::FormatUnsupported(format!(
                "sample rate {} Hz",
                self.sample_rate
            )));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ModemError::FormatUnsupported(format!(
                "block size {}",
                self.block_size
            )));
        }
        Ok(())
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceRef {
    #[default]
    Default,
    Named(String),
}

impl DeviceRef {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() && name != "default" => DeviceRef::Named(name.to_string()),
            _ => DeviceRef::Default,
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Default => f.write_str("default"),
            DeviceRef::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Reported asynchronously when a running stream fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub direction: Direction,
    pub message: String,
}

impl DeviceFault {
    pub fn to_error(&self) -> ModemError {
        ModemError::StreamDropped(format!("{} stream: {}", self.direction, self.message))
    }
}

pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;
pub type ErrorCallback = Box<dyn FnMut(String) + Send + 'static>;

/// A running stream. Closing stops all further callbacks.
pub trait AudioStream: Send {
    fn close(&mut self);
}

/// A source of audio streams: a sound card host, a file, a simulated channel.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn input_devices(&self) -> Result<Vec<DeviceInfo>>;

    fn output_devices(&self) -> Result<Vec<DeviceInfo>>;

    fn open_input(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        on_samples: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>>;

    fn open_output(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        fill: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>>;
}

struct ActiveStreams {
    input: Box<dyn AudioStream>,
    output: Box<dyn AudioStream>,
    config: StreamConfig,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    played: AtomicU64,
    blocks: AtomicU64,
}

pub struct DeviceAdapter {
    backend: Arc<dyn AudioBackend>,
    /// Held while streams are opened or closed, never by callbacks.
    control: Mutex<Option<ActiveStreams>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    fault_tx: Sender<DeviceFault>,
    fault_rx: Receiver<DeviceFault>,
}

impl DeviceAdapter {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let (fault_tx, fault_rx) = bounded(16);
        Self {
            backend,
            control: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            fault_tx,
            fault_rx,
        }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Open both paths and start moving audio.
    pub fn start(
        &self,
        config: StreamConfig,
        input_device: &DeviceRef,
        output_device: &DeviceRef,
        capture: RingProducer,
        playback: RingConsumer,
    ) -> Result<()> {
        config.validate()?;
        let mut control = self.control.lock();
        if control.is_some() {
            return Err(ModemError::InvalidState {
                operation: "start",
                state: "running",
            });
        }

        self.counters.captured.store(0, Ordering::SeqCst);
        self.counters.played.store(0, Ordering::SeqCst);
        self.counters.blocks.store(0, Ordering::SeqCst);
        while self.fault_rx.try_recv().is_ok() {}
        self.running.store(true, Ordering::SeqCst);

        let input = self.backend.open_input(
            input_device,
            &config,
            self.capture_callback(config, capture),
            self.error_callback(Direction::Input),
        );
        let mut input = match input {
            Ok(stream) => stream,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let output = self.backend.open_output(
            output_device,
            &config,
            self.playback_callback(playback),
            self.error_callback(Direction::Output),
        );
        let output = match output {
            Ok(stream) => stream,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                input.close();
                return Err(e);
            }
        };

        log::info!(
            "audio started on {}: in={} out={} {} Hz, {} samples/block",
            self.backend.name(),
            input_device,
            output_device,
            config.sample_rate,
            config.block_size
        );
        *control = Some(ActiveStreams {
            input,
            output,
            config,
        });
        Ok(())
    }

    /// Close both streams. Safe to call repeatedly and while a callback is
    /// running: callbacks see the cleared flag and return without touching
    /// the rings.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut streams) = control.take() {
            streams.input.close();
            streams.output.close();
            log::info!("audio stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Option<StreamConfig> {
        self.control.lock().as_ref().map(|s| s.config)
    }

    pub fn faults(&self) -> Receiver<DeviceFault> {
        self.fault_rx.clone()
    }

    /// Samples taken from the playback ring and handed to the device.
    pub fn played_samples(&self) -> u64 {
        self.counters.played.load(Ordering::Acquire)
    }

    pub fn captured_samples(&self) -> u64 {
        self.counters.captured.load(Ordering::Acquire)
    }

    pub fn captured_blocks(&self) -> u64 {
        self.counters.blocks.load(Ordering::Acquire)
    }

    fn capture_callback(&self, config: StreamConfig, capture: RingProducer) -> InputCallback {
        let running = self.running.clone();
        let counters = self.counters.clone();
        let block_size = config.block_size;
        let sample_rate = config.sample_rate;
        capture.preallocate(block_size);
        let mut pending = capture.take_buffer(block_size);
        let mut sequence = 0u64;
        let mut emitted = 0u64;

        Box::new(move |data: &[f32]| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            counters.captured.fetch_add(data.len() as u64, Ordering::Relaxed);
            let mut rest = data;
            while !rest.is_empty() {
                let take = (block_size - pending.len()).min(rest.len());
                pending.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if pending.len() == block_size {
                    let samples = std::mem::replace(&mut pending, capture.take_buffer(block_size));
                    let timestamp =
                        Duration::from_nanos(emitted * 1_000_000_000 / sample_rate as u64);
                    let block = AudioBlock::new(samples, sample_rate, sequence, timestamp);
                    sequence += 1;
                    emitted += block_size as u64;
                    // A full ring drops the block; the ring counts the overrun.
                    if capture.write(block).is_ok() {
                        counters.blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    }

    fn playback_callback(&self, mut playback: RingConsumer) -> OutputCallback {
        let running = self.running.clone();
        let counters = self.counters.clone();
        Box::new(move |out: &mut [f32]| {
            if !running.load(Ordering::Relaxed) || playback.is_empty() {
                out.fill(0.0);
                return;
            }
            let copied = playback.fill(out);
            out[copied..].fill(0.0);
            counters.played.fetch_add(copied as u64, Ordering::Release);
        })
    }

    fn error_callback(&self, direction: Direction) -> ErrorCallback {
        let running = self.running.clone();
        let faults = self.fault_tx.clone();
        Box::new(move |message: String| {
            running.store(false, Ordering::SeqCst);
            let _ = faults.try_send(DeviceFault { direction, message });
        })
    }
}

impl Drop for DeviceAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}
