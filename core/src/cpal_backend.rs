//! Sound card backend on top of `cpal`.
//!
//! Each stream lives on its own thread, which owns the `cpal::Stream` (not
//! `Send` on every host) and keeps it alive until the stream is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;

use crate::device::{
    AudioBackend, AudioStream, DeviceInfo, DeviceRef, Direction, ErrorCallback, InputCallback,
    OutputCallback, StreamConfig,
};
use crate::error::{ModemError, Result};

/// The platform's default audio host.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

struct CpalStream {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioStream for CpalStream {
    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn list(direction: Direction) -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    }
    .and_then(|d| d.name().ok());

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| ModemError::DeviceUnavailable(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
        })
        .collect())
}

fn find_device(direction: Direction, device: &DeviceRef) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let found = match (direction, device) {
        (Direction::Input, DeviceRef::Default) => host.default_input_device(),
        (Direction::Output, DeviceRef::Default) => host.default_output_device(),
        (Direction::Input, DeviceRef::Named(name)) => host
            .input_devices()
            .map_err(|e| ModemError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name.as_str())),
        (Direction::Output, DeviceRef::Named(name)) => host
            .output_devices()
            .map_err(|e| ModemError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name.as_str())),
    };
    found.ok_or_else(|| ModemError::DeviceUnavailable(format!("{} device '{}'", direction, device)))
}

fn stream_config(
    device: &cpal::Device,
    direction: Direction,
    config: &StreamConfig,
) -> Result<cpal::StreamConfig> {
    let default = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    }
    .map_err(|e| ModemError::FormatUnsupported(e.to_string()))?;
    Ok(cpal::StreamConfig {
        channels: default.channels(),
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn build_error(e: cpal::BuildStreamError) -> ModemError {
    match e {
        cpal::BuildStreamError::StreamConfigNotSupported => {
            ModemError::FormatUnsupported("stream configuration not supported".to_string())
        }
        other => ModemError::DeviceUnavailable(other.to_string()),
    }
}

/// Run `build` on a dedicated thread and keep its stream playing until closed.
fn spawn_stream<F>(thread_name: String, build: F) -> Result<Box<dyn AudioStream>>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let keep_running = running.clone();

    let thread = thread::Builder::new().name(thread_name).spawn(move || {
        let stream = match build() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(ModemError::DeviceUnavailable(e.to_string())));
            return;
        }
        let _ = ready_tx.send(Ok(()));
        while keep_running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(10));
        }
    })?;

    let mut stream = CpalStream {
        running,
        thread: Some(thread),
    };
    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(stream)),
        Ok(Err(e)) => {
            stream.close();
            Err(e)
        }
        Err(_) => {
            stream.close();
            Err(ModemError::DeviceUnavailable("audio thread exited".to_string()))
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn input_devices(&self) -> Result<Vec<DeviceInfo>> {
        list(Direction::Input)
    }

    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        list(Direction::Output)
    }

    fn open_input(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        mut on_samples: InputCallback,
        mut on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>> {
        let device = device.clone();
        let config = *config;
        spawn_stream(format!("capture-{}", device), move || {
            let cpal_device = find_device(Direction::Input, &device)?;
            let stream_config = stream_config(&cpal_device, Direction::Input, &config)?;
            let channels = stream_config.channels.max(1) as usize;
            let mut mono: Vec<f32> = Vec::with_capacity(config.block_size * 4);
            cpal_device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // First channel only; radio audio is mono.
                        mono.clear();
                        mono.extend(data.iter().step_by(channels).copied());
                        on_samples(mono.as_slice());
                    },
                    move |err: cpal::StreamError| on_error(err.to_string()),
                    None,
                )
                .map_err(build_error)
        })
    }

    fn open_output(
        &self,
        device: &DeviceRef,
        config: &StreamConfig,
        mut fill: OutputCallback,
        mut on_error: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>> {
        let device = device.clone();
        let config = *config;
        spawn_stream(format!("playback-{}", device), move || {
            let cpal_device = find_device(Direction::Output, &device)?;
            let stream_config = stream_config(&cpal_device, Direction::Output, &config)?;
            let channels = stream_config.channels.max(1) as usize;
            let mut mono: Vec<f32> = Vec::with_capacity(config.block_size * 4);
            cpal_device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mono.resize(data.len() / channels, 0.0);
                        fill(mono.as_mut_slice());
                        for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                            frame.fill(sample);
                        }
                    },
                    move |err: cpal::StreamError| on_error(err.to_string()),
                    None,
                )
                .map_err(build_error)
        })
    }
}
