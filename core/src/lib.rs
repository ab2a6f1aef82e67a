//! Half-duplex ARQ modem for amateur radio sound card links
//!
//! Audio flows from the sound card through lock-free rings into a processing
//! thread that runs a waterfall spectrum, an MFSK frame codec with
//! convolutional FEC, and a connection state machine with selective
//! acknowledgement and retransmission. Throughput is capped per license tier.

pub mod error;
pub mod callsign;
pub mod license;
pub mod config;
pub mod ring;
pub mod device;
pub mod loopback;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod rig;
pub mod spectrum;
pub mod correlation;
pub mod sync;
pub mod fec;
pub mod framing;
pub mod fsk;
pub mod codec;
pub mod rtt;
pub mod session;
pub mod arq;
pub mod engine;

pub use arq::{ProtocolState, ProtocolStateMachine, SessionEvent, TerminalReason};
pub use callsign::{Callsign, StationId};
pub use codec::{CodecParams, FrameEncoder, FrameReceiver};
pub use config::ModemConfig;
pub use engine::{Modem, ModemEvent};
pub use error::{ModemError, Result};
pub use framing::{FrameType, ProtocolFrame};
pub use license::{LicenseEntitlement, Throughput, Tier};

// Audio defaults
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const DEFAULT_CENTER_FREQUENCY: f32 = 1500.0; // Hz

// Frame configuration
pub const MAX_MTU: usize = 255; // payload length is one byte on air
pub const HEADER_LEN: usize = 10;
pub const PAYLOAD_CRC_LEN: usize = 2;
