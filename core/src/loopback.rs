//! Simulated radio channel between stations in one process.
//!
//! A medium thread ticks once per block period. On each tick it pulls one
//! block from every station's output stream and hands each station's input
//! stream the sum of what the *other* stations played. Stations never hear
//! themselves, like a half-duplex radio that mutes its receiver on transmit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::{
    AudioBackend, AudioStream, DeviceInfo, DeviceRef, Direction, ErrorCallback, InputCallback,
    OutputCallback, StreamConfig,
};
use crate::error::{ModemError, Result};

#[derive(Default)]
struct StationSlot {
    name: String,
    input: Option<InputCallback>,
    output: Option<OutputCallback>,
    input_error: Option<ErrorCallback>,
    output_error: Option<ErrorCallback>,
}

struct Shared {
    sample_rate: u32,
    block_size: usize,
    gain: Mutex<f32>,
    stations: Mutex<Vec<StationSlot>>,
    running: AtomicBool,
}

pub struct LoopbackMedium {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackMedium {
    /// Start a medium running `speedup` times faster than real time.
    pub fn new(sample_rate: u32, block_size: usize, speedup: f64) -> Result<Self> {
        StreamConfig {
            sample_rate,
            block_size,
        }
        .validate()?;
        if !(speedup > 0.0) {
            return Err(ModemError::ConfigurationInvalid(format!(
                "loopback speedup {} must be positive",
                speedup
            )));
        }

        let shared = Arc::new(Shared {
            sample_rate,
            block_size,
            gain: Mutex::new(1.0),
            stations: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });
        let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64 / speedup);
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("loopback-medium".to_string())
            .spawn(move || run_medium(worker, period))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Add a station and return the audio backend it should use.
    pub fn station(&self, name: &str) -> Arc<LoopbackBackend> {
        let mut stations = self.shared.stations.lock();
        stations.push(StationSlot {
            name: name.to_string(),
            ..Default::default()
        });
        Arc::new(LoopbackBackend {
            shared: self.shared.clone(),
            index: stations.len() - 1,
        })
    }

    /// Path loss applied to every signal, as a linear factor.
    pub fn set_gain(&self, gain: f32) {
        *self.shared.gain.lock() = gain;
    }

    /// Fail both streams of a station, as if its sound card vanished.
    pub fn drop_stream(&self, station: &LoopbackBackend) {
        let mut stations = self.shared.stations.lock();
        if let Some(slot) = stations.get_mut(station.index) {
            log::warn!("loopback: dropping streams of {}", slot.name);
            slot.input = None;
            slot.output = None;
            for callback in [slot.input_error.as_mut(), slot.output_error.as_mut()]
                .into_iter()
                .flatten()
            {
                callback("device disconnected".to_string());
            }
        }
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LoopbackMedium {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_medium(shared: Arc<Shared>, period: Duration) {
    let block_size = shared.block_size;
    let mut played: Vec<Vec<f32>> = Vec::new();
    let mut mix = vec![0.0f32; block_size];
    let mut next_tick = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        {
            let gain = *shared.gain.lock();
            let mut stations = shared.stations.lock();
            played.resize_with(stations.len(), || vec![0.0; block_size]);

            for (slot, buffer) in stations.iter_mut().zip(played.iter_mut()) {
                buffer.fill(0.0);
                if let Some(output) = slot.output.as_mut() {
                    output(buffer.as_mut_slice());
                }
            }
            for (index, slot) in stations.iter_mut().enumerate() {
                let Some(input) = slot.input.as_mut() else {
                    continue;
                };
                mix.fill(0.0);
                for (other, buffer) in played.iter().enumerate() {
                    if other != index {
                        for (m, s) in mix.iter_mut().zip(buffer) {
                            *m += s * gain;
                        }
                    }
                }
                input(mix.as_slice());
            }
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else if now - next_tick > period * 8 {
            // Fell far behind; do not try to catch up in a burst.
            next_tick = now;
        }
    }
}

/// One station's view of a [`LoopbackMedium`].
pub struct LoopbackBackend {
    shared: Arc<Shared>,
    index: usize,
}

impl LoopbackBackend {
    fn check(&self, config: &StreamConfig) -> Result<()> {
        if config.sample_rate != self.shared.sample_rate {
            return Err(ModemError::FormatUnsupported(format!(
                "loopback runs at {} Hz, not {} Hz",
                self.shared.sample_rate, config.sample_rate
            )));
        }
        Ok(())
    }

    fn device(&self) -> DeviceInfo {
        DeviceInfo {
            name: "loopback".to_string(),
            is_default: true,
        }
    }
}

struct LoopbackStream {
    shared: Arc<Shared>,
    index: usize,
    direction: Direction,
}

impl AudioStream for LoopbackStream {
    fn close(&mut self) {
        let mut stations = self.shared.stations.lock();
        if let Some(slot) = stations.get_mut(self.index) {
            match self.direction {
                Direction::Input => {
                    slot.input = None;
                    slot.input_error = None;
                }
                Direction::Output => {
                    slot.output = None;
                    slot.output_error = None;
                }
            }
        }
    }
}

impl AudioBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn input_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![self.device()])
    }

    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![self.device()])
    }

    fn open_input(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        on_samples: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>> {
        self.check(config)?;
        if let DeviceRef::Named(name) = device {
            if name != "loopback" {
                return Err(ModemError::DeviceUnavailable(name.clone()));
            }
        }
        let mut stations = self.shared.stations.lock();
        let slot = stations
            .get_mut(self.index)
            .ok_or_else(|| ModemError::DeviceUnavailable(device.to_string()))?;
        slot.input = Some(on_samples);
        slot.input_error = Some(on_error);
        Ok(Box::new(LoopbackStream {
            shared: self.shared.clone(),
            index: self.index,
            direction: Direction::Input,
        }))
    }

    fn open_output(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        fill: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>> {
        self.check(config)?;
        if let DeviceRef::Named(name) = device {
            if name != "loopback" {
                return Err(ModemError::DeviceUnavailable(name.clone()));
            }
        }
        let mut stations = self.shared.stations.lock();
        let slot = stations
            .get_mut(self.index)
            .ok_or_else(|| ModemError::DeviceUnavailable(device.to_string()))?;
        slot.output = Some(fill);
        slot.output_error = Some(on_error);
        Ok(Box::new(LoopbackStream {
            shared: self.shared.clone(),
            index: self.index,
            direction: Direction::Output,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn config() -> StreamConfig {
        StreamConfig {
            sample_rate: 8_000,
            block_size: 128,
        }
    }

    #[test]
    fn test_stations_hear_each_other_not_themselves() {
        let medium = LoopbackMedium::new(8_000, 128, 20.0).unwrap();
        let a = medium.station("A");
        let b = medium.station("B");

        let (a_heard_tx, a_heard) = unbounded();
        let (b_heard_tx, b_heard) = unbounded();
        let mut a_in = a
            .open_input(
                &DeviceRef::Default,
                &config(),
                Box::new(move |s: &[f32]| {
                    let _ = a_heard_tx.send(s.iter().map(|x| x.abs()).fold(0.0f32, f32::max));
                }),
                Box::new(|_: String| {}),
            )
            .unwrap();
        let _b_in = b
            .open_input(
                &DeviceRef::Default,
                &config(),
                Box::new(move |s: &[f32]| {
                    let _ = b_heard_tx.send(s.iter().map(|x| x.abs()).fold(0.0f32, f32::max));
                }),
                Box::new(|_: String| {}),
            )
            .unwrap();
        let _a_out = a
            .open_output(
                &DeviceRef::Default,
                &config(),
                Box::new(|out: &mut [f32]| out.fill(0.25)),
                Box::new(|_: String| {}),
            )
            .unwrap();

        let b_peak = (0..200)
            .map(|_| b_heard.recv_timeout(Duration::from_secs(2)).unwrap())
            .find(|&peak| peak > 0.0)
            .unwrap();
        assert!((b_peak - 0.25).abs() < 1e-6);
        for _ in 0..10 {
            assert_eq!(a_heard.recv_timeout(Duration::from_secs(2)).unwrap(), 0.0);
        }

        a_in.close();
        while a_heard.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(50));
        assert!(a_heard.try_recv().is_err());
    }

    #[test]
    fn test_drop_stream_reports_error() {
        let medium = LoopbackMedium::new(8_000, 128, 20.0).unwrap();
        let a = medium.station("A");
        let (errors_tx, errors) = unbounded();
        let _input = a
            .open_input(
                &DeviceRef::Default,
                &config(),
                Box::new(|_: &[f32]| {}),
                Box::new(move |message: String| {
                    let _ = errors_tx.send(message);
                }),
            )
            .unwrap();
        medium.drop_stream(&a);
        assert_eq!(errors.try_recv().unwrap(), "device disconnected");
    }

    #[test]
    fn test_rejects_other_sample_rate_and_device() {
        let medium = LoopbackMedium::new(8_000, 128, 1.0).unwrap();
        let a = medium.station("A");
        let wrong = StreamConfig {
            sample_rate: 48_000,
            block_size: 128,
        };
        assert!(matches!(
            a.open_input(&DeviceRef::Default, &wrong, Box::new(|_: &[f32]| {}), Box::new(|_: String| {})),
            Err(ModemError::FormatUnsupported(_))
        ));
        assert!(matches!(
            a.open_output(
                &DeviceRef::Named("hw:1".to_string()),
                &config(),
                Box::new(|_: &mut [f32]| {}),
                Box::new(|_: String| {})
            ),
            Err(ModemError::DeviceUnavailable(_))
        ));
    }
}
