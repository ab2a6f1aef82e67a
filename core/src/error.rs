use std::fmt;
use thiserror::Error;

/// Which integrity check rejected a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    HeaderCrc,
    PayloadCrc,
    UnknownFrameType,
    UnsupportedVersion,
    Truncated,
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IntegrityFault::HeaderCrc => "header CRC mismatch",
            IntegrityFault::PayloadCrc => "payload CRC mismatch",
            IntegrityFault::UnknownFrameType => "unknown frame type",
            IntegrityFault::UnsupportedVersion => "unsupported frame version",
            IntegrityFault::Truncated => "truncated frame",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio format unsupported: {0}")]
    FormatUnsupported(String),

    #[error("Audio stream dropped: {0}")]
    StreamDropped(String),

    #[error("Ring buffer overrun")]
    Overrun,

    #[error("Ring buffer underrun")]
    Underrun,

    #[error("Frame integrity failure: {0}")]
    FrameIntegrityFailure(IntegrityFault),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Link failure: retry budget exhausted")]
    LinkFailure,

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Payload of {len} bytes exceeds MTU of {mtu} bytes")]
    PayloadTooLarge { len: usize, mtu: usize },

    #[error("Invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("Rig control error: {0}")]
    Rig(String),

    #[error("FFT error: {0}")]
    Fft(String),

    #[error("Invalid input size")]
    InvalidInputSize,

    #[error("Insufficient data")]
    InsufficientData,

    #[error("Modem engine is not running")]
    EngineStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModemError>;
