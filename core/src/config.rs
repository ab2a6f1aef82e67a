//! Modem configuration, loaded from TOML.
//!
//! Every field has a default so a partial file (or none at all) is valid.
//! Durations are stored as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModemError, Result};
use crate::license::{Throughput, Tier};
use crate::spectrum::{is_supported_fft_size, WindowFunction};
use crate::MAX_MTU;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModemConfig {
    pub audio: AudioConfig,
    pub spectrum: SpectrumConfig,
    pub modem: ModulationConfig,
    pub arq: ArqConfig,
    pub rig: RigConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Capacity of each ring buffer, in blocks.
    pub ring_blocks: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            block_size: crate::DEFAULT_BLOCK_SIZE,
            ring_blocks: 64,
            input_device: None,
            output_device: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    pub fft_size: usize,
    pub update_rate_hz: f32,
    pub window: WindowFunction,
    pub reference_level_db: f32,
    pub range_db: f32,
    /// Number of frames kept in the waterfall.
    pub history: usize,
    /// Displayed span as a multiple of the session bandwidth.
    pub display_multiplier: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: crate::DEFAULT_FFT_SIZE,
            update_rate_hz: 10.0,
            window: WindowFunction::Hann,
            reference_level_db: -20.0,
            range_db: 100.0,
            history: 200,
            display_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulationConfig {
    pub callsign: Option<String>,
    pub center_frequency_hz: f32,
    /// Requested session bandwidth, before the license gate.
    pub bandwidth_hz: u32,
    /// Requested session symbol rate in baud, before the license gate.
    pub symbol_rate: u32,
    /// Throughput used for the handshake, before a session exists.
    pub call_bandwidth_hz: u32,
    pub call_symbol_rate: u32,
    pub leader_ms: u64,
    /// Peak transmit amplitude, 0..=1.
    pub tx_level: f32,
    pub sync_timeout_ms: u64,
}

impl Default for ModulationConfig {
    fn default() -> Self {
        let call = Tier::Free.limits();
        Self {
            callsign: None,
            center_frequency_hz: crate::DEFAULT_CENTER_FREQUENCY,
            bandwidth_hz: call.bandwidth_hz,
            symbol_rate: call.symbol_rate,
            call_bandwidth_hz: call.bandwidth_hz,
            call_symbol_rate: call.symbol_rate,
            leader_ms: 120,
            tx_level: 0.5,
            sync_timeout_ms: 5_000,
        }
    }
}

impl ModulationConfig {
    pub fn requested(&self) -> Throughput {
        Throughput::new(self.bandwidth_hz, self.symbol_rate)
    }

    pub fn call_mode(&self) -> Throughput {
        Throughput::new(self.call_bandwidth_hz, self.call_symbol_rate)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    pub mtu: usize,
    /// Maximum number of unacknowledged data frames.
    pub window: usize,
    pub handshake_timeout_ms: u64,
    pub max_connect_retries: u32,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub max_data_retries: u32,
    pub disconnect_timeout_ms: u64,
    pub max_disconnect_retries: u32,
    /// Silence kept after the remote station releases the channel.
    pub turnaround_ms: u64,
    /// How long to wait for the rest of a burst whose last frame was missed.
    pub over_timeout_ms: u64,
    pub session_idle_timeout_ms: u64,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: 64,
            window: 8,
            handshake_timeout_ms: 10_000,
            max_connect_retries: 5,
            initial_rto_ms: 6_000,
            min_rto_ms: 1_000,
            max_rto_ms: 60_000,
            max_data_retries: 8,
            disconnect_timeout_ms: 6_000,
            max_disconnect_retries: 2,
            turnaround_ms: 250,
            over_timeout_ms: 4_000,
            session_idle_timeout_ms: 120_000,
        }
    }
}

impl ArqConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn turnaround(&self) -> Duration {
        Duration::from_millis(self.turnaround_ms)
    }

    pub fn over_timeout(&self) -> Duration {
        Duration::from_millis(self.over_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 || self.mtu > MAX_MTU {
            return Err(invalid(format!("arq.mtu must be 1..={}", MAX_MTU)));
        }
        if self.window == 0 || self.window > crate::session::MAX_WINDOW {
            return Err(invalid(format!(
                "arq.window must be 1..={}",
                crate::session::MAX_WINDOW
            )));
        }
        if self.handshake_timeout_ms == 0
            || self.initial_rto_ms == 0
            || self.disconnect_timeout_ms == 0
            || self.session_idle_timeout_ms == 0
        {
            return Err(invalid("arq timeouts must be non-zero".to_string()));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(invalid(
                "arq.min_rto_ms must be non-zero and <= arq.max_rto_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PttMethod {
    /// The radio keys itself from the audio.
    #[default]
    Vox,
    /// PTT and tuning through a hamlib `rigctld` daemon.
    Rigctld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub ptt: PttMethod,
    pub rigctld_address: String,
    pub frequency_hz: Option<u64>,
    pub timeout_ms: u64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            ptt: PttMethod::Vox,
            rigctld_address: "127.0.0.1:4532".to_string(),
            frequency_hz: None,
            timeout_ms: 2_000,
        }
    }
}

fn invalid(message: String) -> ModemError {
    ModemError::ConfigurationInvalid(message)
}

impl ModemConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ModemConfig =
            toml::from_str(text).map_err(|e| invalid(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::debug!("loading modem configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| invalid(format!("TOML encode error: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if !(8_000..=192_000).contains(&audio.sample_rate) {
            return Err(invalid(format!(
                "audio.sample_rate {} outside 8000..=192000",
                audio.sample_rate
            )));
        }
        if !(16..=16_384).contains(&audio.block_size) {
            return Err(invalid(format!(
                "audio.block_size {} outside 16..=16384",
                audio.block_size
            )));
        }
        if audio.ring_blocks < 2 {
            return Err(invalid("audio.ring_blocks must be at least 2".to_string()));
        }

        let spectrum = &self.spectrum;
        if !is_supported_fft_size(spectrum.fft_size) {
            return Err(invalid(format!(
                "spectrum.fft_size {} must be a power of two in 64..=32768",
                spectrum.fft_size
            )));
        }
        if !(spectrum.update_rate_hz > 0.0 && spectrum.update_rate_hz <= audio.sample_rate as f32)
        {
            return Err(invalid("spectrum.update_rate_hz out of range".to_string()));
        }
        if spectrum.range_db <= 0.0 || spectrum.history == 0 || spectrum.display_multiplier <= 0.0
        {
            return Err(invalid(
                "spectrum.range_db, history and display_multiplier must be positive".to_string(),
            ));
        }

        let modem = &self.modem;
        if let Some(call) = &modem.callsign {
            crate::callsign::Callsign::new(call)?;
        }
        if !(modem.tx_level > 0.0 && modem.tx_level <= 1.0) {
            return Err(invalid("modem.tx_level must be in (0, 1]".to_string()));
        }
        if modem.leader_ms == 0 || modem.sync_timeout_ms == 0 {
            return Err(invalid(
                "modem.leader_ms and modem.sync_timeout_ms must be non-zero".to_string(),
            ));
        }
        for throughput in [modem.requested(), modem.call_mode()] {
            crate::fsk::MfskKernel::check_geometry(
                audio.sample_rate,
                modem.center_frequency_hz,
                throughput,
            )?;
        }

        self.arq.validate()
    }
}
