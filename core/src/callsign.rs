//! Amateur radio callsigns and the 16-bit station ids derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModemError, Result};
use crate::framing::crc16;

pub const MAX_CALLSIGN_LEN: usize = 10;

/// A validated callsign, stored upper case.
///
/// Portable suffixes (`/P`, `/M`) and SSID-style suffixes (`-7`) are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign(String);

impl Callsign {
    pub fn new(text: &str) -> Result<Self> {
        let normalized = text.trim().to_ascii_uppercase();
        if normalized.is_empty() || normalized.len() > MAX_CALLSIGN_LEN {
            return Err(ModemError::InvalidCallsign(text.to_string()));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '-')
        {
            return Err(ModemError::InvalidCallsign(text.to_string()));
        }
        if !normalized.chars().any(|c| c.is_ascii_digit()) {
            return Err(ModemError::InvalidCallsign(text.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn station_id(&self) -> StationId {
        StationId(crc16(self.0.as_bytes()))
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Callsign {
    type Err = ModemError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Callsign {
    type Error = ModemError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Callsign> for String {
    fn from(value: Callsign) -> Self {
        value.0
    }
}

/// Compact on-air station identifier (CRC-16 of the callsign).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationId(pub u16);

impl StationId {
    /// Destination used by frames addressed to any listener.
    pub const BROADCAST: StationId = StationId(0xFFFF);
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callsign_normalizes_case() {
        let call = Callsign::new(" w1aw ").unwrap();
        assert_eq!(call.as_str(), "W1AW");
    }

    #[test]
    fn test_callsign_rejects_garbage() {
        assert!(Callsign::new("").is_err());
        assert!(Callsign::new("NOCALL").is_err());
        assert!(Callsign::new("W1AW!").is_err());
        assert!(Callsign::new("ABCDEFGHIJ1").is_err());
    }

    #[test]
    fn test_callsign_suffixes() {
        assert!(Callsign::new("DL1ABC/P").is_ok());
        assert!(Callsign::new("N0CALL-7").is_ok());
    }

    #[test]
    fn test_station_id_is_case_insensitive() {
        let a = Callsign::new("k1abc").unwrap();
        let b = Callsign::new("K1ABC").unwrap();
        assert_eq!(a.station_id(), b.station_id());
        assert_ne!(a.station_id(), Callsign::new("K1ABD").unwrap().station_id());
    }
}
