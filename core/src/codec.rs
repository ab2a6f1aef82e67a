//! Frames to audio and back.
//!
//! A frame on air is a chirp preamble followed by the convolutionally coded
//! header and the coded payload block, each modulated by a
//! [`ModulationKernel`]. The header is a fixed size, so the receiver can
//! demodulate it right after the preamble and learn how long the payload is.

use std::time::{Duration, Instant};

use crate::config::ModemConfig;
use crate::error::{ModemError, Result};
use crate::fec::{coded_bits, ConvolutionalEncoder, ViterbiDecoder};
use crate::framing::{FrameHeader, ProtocolFrame};
use crate::fsk::{MfskKernel, ModulationKernel};
use crate::license::Throughput;
use crate::sync::{generate_preamble, PreambleDetector};
use crate::HEADER_LEN;

/// Everything both ends must agree on to exchange frames.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub center_hz: f32,
    pub throughput: Throughput,
    pub leader: Duration,
    pub amplitude: f32,
    pub sync_timeout: Duration,
}

impl CodecParams {
    pub fn from_config(config: &ModemConfig, throughput: Throughput) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            center_hz: config.modem.center_frequency_hz,
            throughput,
            leader: Duration::from_millis(config.modem.leader_ms),
            amplitude: config.modem.tx_level,
            sync_timeout: config.modem.sync_timeout(),
        }
    }

    pub fn with_throughput(&self, throughput: Throughput) -> Self {
        Self {
            throughput,
            ..self.clone()
        }
    }

    pub fn build_kernel(&self) -> Result<Box<dyn ModulationKernel>> {
        Ok(Box::new(MfskKernel::new(
            self.sample_rate,
            self.center_hz,
            self.throughput,
            self.amplitude,
        )?))
    }
}

pub struct FrameEncoder {
    kernel: Box<dyn ModulationKernel>,
    preamble: Vec<f32>,
    conv: ConvolutionalEncoder,
}

impl FrameEncoder {
    pub fn new(params: &CodecParams) -> Result<Self> {
        let kernel = params.build_kernel()?;
        Ok(Self::with_kernel(kernel, params.leader, params.amplitude))
    }

    pub fn with_kernel(kernel: Box<dyn ModulationKernel>, leader: Duration, amplitude: f32) -> Self {
        let preamble = generate_preamble(kernel.as_ref(), leader, amplitude);
        Self {
            kernel,
            preamble,
            conv: ConvolutionalEncoder::new(),
        }
    }

    pub fn kernel(&self) -> &dyn ModulationKernel {
        self.kernel.as_ref()
    }

    pub fn throughput(&self) -> Throughput {
        self.kernel.throughput()
    }

    /// Samples needed on air for a frame with `payload_len` payload bytes.
    pub fn frame_samples(&self, payload_len: usize) -> usize {
        self.preamble.len()
            + self.kernel.samples_for_bits(coded_bits(HEADER_LEN))
            + self
                .kernel
                .samples_for_bits(coded_bits(payload_len + crate::PAYLOAD_CRC_LEN))
    }

    pub fn airtime(&self, payload_len: usize) -> Duration {
        Duration::from_secs_f64(
            self.frame_samples(payload_len) as f64 / self.kernel.sample_rate() as f64,
        )
    }

    pub fn encode(&mut self, frame: &ProtocolFrame) -> Result<Vec<f32>> {
        let (header, block) = frame.encode_parts()?;
        let mut samples = Vec::with_capacity(self.frame_samples(frame.payload.len()));
        samples.extend_from_slice(&self.preamble);
        samples.extend(self.kernel.modulate(&self.conv.encode(&header)));
        samples.extend(self.kernel.modulate(&self.conv.encode(&block)));
        Ok(samples)
    }

    /// Encode frames back to back, followed by `tail` samples of silence.
    pub fn encode_burst(&mut self, frames: &[ProtocolFrame], tail: usize) -> Result<Vec<f32>> {
        let mut samples = Vec::new();
        for frame in frames {
            samples.extend(self.encode(frame)?);
        }
        samples.resize(samples.len() + tail, 0.0);
        Ok(samples)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverStats {
    pub preambles: u64,
    pub frames: u64,
    /// Preambles whose header failed its CRC.
    pub header_failures: u64,
    pub payload_failures: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Hunting,
    Header,
    Payload(FrameHeader),
}

/// Streaming demodulator: feed it audio, get back valid frames.
pub struct FrameReceiver {
    kernel: Box<dyn ModulationKernel>,
    detector: PreambleDetector,
    viterbi: ViterbiDecoder,
    state: RxState,
    state_since: Instant,
    sync_timeout: Duration,
    buffer: Vec<f32>,
    header_samples: usize,
    stats: ReceiverStats,
}

impl FrameReceiver {
    pub fn new(params: &CodecParams) -> Result<Self> {
        let kernel = params.build_kernel()?;
        Ok(Self::with_kernel(kernel, params.leader, params.sync_timeout))
    }

    pub fn with_kernel(
        kernel: Box<dyn ModulationKernel>,
        leader: Duration,
        sync_timeout: Duration,
    ) -> Self {
        let template = generate_preamble(kernel.as_ref(), leader, 1.0);
        let header_samples = kernel.samples_for_bits(coded_bits(HEADER_LEN));
        Self {
            kernel,
            detector: PreambleDetector::new(template),
            viterbi: ViterbiDecoder::new(),
            state: RxState::Hunting,
            state_since: Instant::now(),
            sync_timeout,
            buffer: Vec::new(),
            header_samples,
            stats: ReceiverStats::default(),
        }
    }

    pub fn throughput(&self) -> Throughput {
        self.kernel.throughput()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn is_hunting(&self) -> bool {
        self.state == RxState::Hunting
    }

    /// Drop buffered audio and go back to hunting for a preamble.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.enter(RxState::Hunting);
    }

    /// Give up on a frame whose remaining symbols never arrived.
    pub fn check_timeout(&mut self, now: Instant) {
        if self.state != RxState::Hunting
            && now.saturating_duration_since(self.state_since) >= self.sync_timeout
        {
            log::debug!("frame sync timed out; back to hunting");
            self.stats.timeouts += 1;
            self.reset();
        }
    }

    /// Feed captured samples. Returns every frame completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<ProtocolFrame> {
        self.buffer.extend_from_slice(samples);
        let mut frames = Vec::new();

        loop {
            match self.state {
                RxState::Hunting => {
                    if !self.hunt() {
                        break;
                    }
                }
                RxState::Header => {
                    if self.buffer.len() < self.header_samples {
                        break;
                    }
                    self.read_header();
                }
                RxState::Payload(header) => {
                    let needed = self
                        .kernel
                        .samples_for_bits(coded_bits(header.payload_block_len()));
                    if self.buffer.len() < needed {
                        break;
                    }
                    if let Some(frame) = self.read_payload(&header, needed) {
                        frames.push(frame);
                    }
                }
            }
        }

        frames
    }

    fn enter(&mut self, state: RxState) {
        self.state = state;
        self.state_since = Instant::now();
    }

    /// Returns true when a preamble was found and consumed.
    fn hunt(&mut self) -> bool {
        let m = self.detector.template_len();
        if self.buffer.len() < m {
            return false;
        }
        match self.detector.detect(&self.buffer) {
            Ok(Some(detection)) => {
                self.stats.preambles += 1;
                self.buffer.drain(..detection.start + m);
                self.enter(RxState::Header);
                true
            }
            Ok(None) => {
                let keep = m - 1;
                let excess = self.buffer.len() - keep;
                self.buffer.drain(..excess);
                false
            }
            Err(e) => {
                log::warn!("preamble search failed: {}", e);
                self.buffer.clear();
                false
            }
        }
    }

    fn read_header(&mut self) {
        let decoded = self
            .kernel
            .demodulate(&self.buffer[..self.header_samples])
            .and_then(|soft| self.viterbi.decode_bytes(&soft, HEADER_LEN))
            .and_then(|bytes| FrameHeader::decode(&bytes));

        match decoded {
            Ok(header) => {
                self.buffer.drain(..self.header_samples);
                self.enter(RxState::Payload(header));
            }
            Err(e) => {
                // Keep the samples: a real preamble may start inside them.
                log::debug!("discarding preamble: {}", e);
                self.stats.header_failures += 1;
                self.enter(RxState::Hunting);
            }
        }
    }

    fn read_payload(&mut self, header: &FrameHeader, needed: usize) -> Option<ProtocolFrame> {
        let decoded = self
            .kernel
            .demodulate(&self.buffer[..needed])
            .and_then(|soft| self.viterbi.decode_bytes(&soft, header.payload_block_len()))
            .and_then(|block| ProtocolFrame::from_parts(header, &block));

        self.enter(RxState::Hunting);
        match decoded {
            Ok(frame) => {
                self.buffer.drain(..needed);
                self.stats.frames += 1;
                log::trace!(
                    "received {:?} seq {} from {}",
                    frame.frame_type,
                    frame.sequence,
                    frame.source
                );
                Some(frame)
            }
            Err(ModemError::FrameIntegrityFailure(fault)) => {
                log::debug!("discarding frame: {}", fault);
                self.stats.payload_failures += 1;
                None
            }
            Err(e) => {
                log::debug!("discarding frame: {}", e);
                self.stats.payload_failures += 1;
                None
            }
        }
    }
}
