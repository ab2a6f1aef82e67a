//! Byte-level protocol frames.
//!
//! On-air layout (before FEC):
//!
//! ```text
//! header  (10 bytes): version|type, flags, src(2), dst(2), seq(2), payload_len, crc8
//! payload block     : payload bytes, crc16 over header and payload (2 bytes)
//! ```
//!
//! The header carries its own CRC-8 so the receiver knows how many payload
//! symbols to collect before the payload CRC can be checked.

use crate::callsign::{Callsign, StationId};
use crate::error::{IntegrityFault, ModemError, Result};
use crate::license::Throughput;
use crate::{HEADER_LEN, MAX_MTU, PAYLOAD_CRC_LEN};

pub const FRAME_VERSION: u8 = 1;

/// CRC-16-CCITT (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u32 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u32) << 8;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x10000 != 0 {
                crc ^= 0x1021;
            }
        }
    }
    (crc & 0xFFFF) as u16
}

/// CRC-8 with polynomial 0xD5
pub fn crc8(data: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0xD5;
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    ConnectRequest = 1,
    ConnectAccept = 2,
    Data = 3,
    Ack = 4,
    Disconnect = 5,
    DisconnectAck = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Control,
    Data,
    Ack,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameType::ConnectRequest),
            2 => Some(FrameType::ConnectAccept),
            3 => Some(FrameType::Data),
            4 => Some(FrameType::Ack),
            5 => Some(FrameType::Disconnect),
            6 => Some(FrameType::DisconnectAck),
            _ => None,
        }
    }

    pub fn class(self) -> FrameClass {
        match self {
            FrameType::Data => FrameClass::Data,
            FrameType::Ack => FrameClass::Ack,
            _ => FrameClass::Control,
        }
    }

    /// Control frames travel in call mode, data and acks in session mode.
    pub fn uses_call_mode(self) -> bool {
        self.class() == FrameClass::Control
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Last frame of a burst: the sender releases the channel.
    pub const OVER: FrameFlags = FrameFlags(0x01);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }
}

/// Decoded, CRC-checked frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub source: StationId,
    pub destination: StationId,
    pub sequence: u16,
    pub payload_len: u8,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = (FRAME_VERSION << 4) | (self.frame_type as u8 & 0x0F);
        header[1] = self.flags.bits();
        header[2..4].copy_from_slice(&self.source.0.to_be_bytes());
        header[4..6].copy_from_slice(&self.destination.0.to_be_bytes());
        header[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        header[8] = self.payload_len;
        header[9] = crc8(&header[..HEADER_LEN - 1]);
        header
    }

    /// Parse and verify a header independently of its payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated));
        }
        if crc8(&data[..HEADER_LEN - 1]) != data[HEADER_LEN - 1] {
            return Err(ModemError::FrameIntegrityFailure(IntegrityFault::HeaderCrc));
        }
        if data[0] >> 4 != FRAME_VERSION {
            return Err(ModemError::FrameIntegrityFailure(
                IntegrityFault::UnsupportedVersion,
            ));
        }
        let frame_type = FrameType::from_u8(data[0] & 0x0F).ok_or(
            ModemError::FrameIntegrityFailure(IntegrityFault::UnknownFrameType),
        )?;
        Ok(Self {
            frame_type,
            flags: FrameFlags::from_bits(data[1]),
            source: StationId(u16::from_be_bytes([data[2], data[3]])),
            destination: StationId(u16::from_be_bytes([data[4], data[5]])),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            payload_len: data[8],
        })
    }

    /// Size of the payload block (payload plus CRC-16) that follows.
    pub fn payload_block_len(&self) -> usize {
        self.payload_len as usize + PAYLOAD_CRC_LEN
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub source: StationId,
    pub destination: StationId,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl ProtocolFrame {
    pub fn new(
        frame_type: FrameType,
        source: StationId,
        destination: StationId,
        sequence: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::empty(),
            source,
            destination,
            sequence,
            payload,
        }
    }

    pub fn is_over(&self) -> bool {
        self.flags.contains(FrameFlags::OVER)
    }

    pub fn header(&self) -> Result<FrameHeader> {
        if self.payload.len() > MAX_MTU {
            return Err(ModemError::PayloadTooLarge {
                len: self.payload.len(),
                mtu: MAX_MTU,
            });
        }
        Ok(FrameHeader {
            frame_type: self.frame_type,
            flags: self.flags,
            source: self.source,
            destination: self.destination,
            sequence: self.sequence,
            payload_len: self.payload.len() as u8,
        })
    }

    /// CRC-16 covering header and payload.
    pub fn integrity_code(&self) -> Result<u16> {
        let header = self.header()?.encode();
        let mut covered = Vec::with_capacity(HEADER_LEN + self.payload.len());
        covered.extend_from_slice(&header);
        covered.extend_from_slice(&self.payload);
        Ok(crc16(&covered))
    }

    /// Serialize as `(header, payload block)`.
    pub fn encode_parts(&self) -> Result<([u8; HEADER_LEN], Vec<u8>)> {
        let header = self.header()?.encode();
        let crc = self.integrity_code()?;
        let mut block = Vec::with_capacity(self.payload.len() + PAYLOAD_CRC_LEN);
        block.extend_from_slice(&self.payload);
        block.extend_from_slice(&crc.to_be_bytes());
        Ok((header, block))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let (header, block) = self.encode_parts()?;
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&block);
        Ok(bytes)
    }

    /// Rebuild a frame from an already verified header and its payload block.
    pub fn from_parts(header: &FrameHeader, block: &[u8]) -> Result<Self> {
        if block.len() < header.payload_block_len() {
            return Err(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated));
        }
        let payload_len = header.payload_len as usize;
        let payload = &block[..payload_len];
        let received = u16::from_be_bytes([block[payload_len], block[payload_len + 1]]);

        let mut covered = Vec::with_capacity(HEADER_LEN + payload_len);
        covered.extend_from_slice(&header.encode());
        covered.extend_from_slice(payload);
        if crc16(&covered) != received {
            return Err(ModemError::FrameIntegrityFailure(IntegrityFault::PayloadCrc));
        }

        Ok(Self {
            frame_type: header.frame_type,
            flags: header.flags,
            source: header.source,
            destination: header.destination,
            sequence: header.sequence,
            payload: payload.to_vec(),
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(data)?;
        Self::from_parts(&header, &data[HEADER_LEN..])
    }
}

fn put_callsign(out: &mut Vec<u8>, call: &Callsign) {
    out.push(call.as_str().len() as u8);
    out.extend_from_slice(call.as_str().as_bytes());
}

fn take_callsign(data: &[u8], pos: &mut usize) -> Result<Callsign> {
    let len = *data
        .get(*pos)
        .ok_or(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated))? as usize;
    let start = *pos + 1;
    let bytes = data
        .get(start..start + len)
        .ok_or(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated))?;
    *pos = start + len;
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ModemError::InvalidCallsign(String::from_utf8_lossy(bytes).into_owned()))?;
    Callsign::new(text)
}

fn take_u16(data: &[u8], pos: &mut usize) -> Result<u16> {
    let bytes = data
        .get(*pos..*pos + 2)
        .ok_or(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated))?;
    *pos += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Payload of a `ConnectRequest` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub caller: Callsign,
    pub callee: Callsign,
    pub requested: Throughput,
    pub mtu: u8,
}

impl ConnectRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + 2 * crate::callsign::MAX_CALLSIGN_LEN + 2);
        out.extend_from_slice(&(self.requested.bandwidth_hz.min(u16::MAX as u32) as u16).to_be_bytes());
        out.extend_from_slice(&(self.requested.symbol_rate.min(u16::MAX as u32) as u16).to_be_bytes());
        out.push(self.mtu);
        put_callsign(&mut out, &self.caller);
        put_callsign(&mut out, &self.callee);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let bandwidth = take_u16(data, &mut pos)?;
        let rate = take_u16(data, &mut pos)?;
        let mtu = *data
            .get(pos)
            .ok_or(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated))?;
        pos += 1;
        let caller = take_callsign(data, &mut pos)?;
        let callee = take_callsign(data, &mut pos)?;
        Ok(Self {
            caller,
            callee,
            requested: Throughput::new(bandwidth as u32, rate as u32),
            mtu,
        })
    }
}

/// Payload of a `ConnectAccept` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAccept {
    pub negotiated: Throughput,
    pub mtu: u8,
}

impl ConnectAccept {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&(self.negotiated.bandwidth_hz.min(u16::MAX as u32) as u16).to_be_bytes());
        out.extend_from_slice(&(self.negotiated.symbol_rate.min(u16::MAX as u32) as u16).to_be_bytes());
        out.push(self.mtu);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let bandwidth = take_u16(data, &mut pos)?;
        let rate = take_u16(data, &mut pos)?;
        let mtu = *data
            .get(pos)
            .ok_or(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated))?;
        Ok(Self {
            negotiated: Throughput::new(bandwidth as u32, rate as u32),
            mtu,
        })
    }
}

/// Selective acknowledgment carried by an `Ack` frame.
///
/// Everything before `next_expected` has been received; bit `i` of
/// `received_mask` marks `next_expected + 1 + i` as received too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub next_expected: u16,
    pub received_mask: u32,
}

impl AckInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&self.next_expected.to_be_bytes());
        out.extend_from_slice(&self.received_mask.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(ModemError::FrameIntegrityFailure(IntegrityFault::Truncated));
        }
        Ok(Self {
            next_expected: u16::from_be_bytes([data[0], data[1]]),
            received_mask: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        })
    }

    /// Whether `sequence` is covered by this acknowledgment.
    pub fn acknowledges(&self, sequence: u16) -> bool {
        let behind = self.next_expected.wrapping_sub(sequence);
        if behind != 0 && behind <= u16::MAX / 2 {
            return true;
        }
        let ahead = sequence.wrapping_sub(self.next_expected);
        (1..=32).contains(&ahead) && self.received_mask & (1 << (ahead - 1)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn data_frame(payload: &[u8]) -> ProtocolFrame {
        ProtocolFrame::new(
            FrameType::Data,
            StationId(0x1234),
            StationId(0xBEEF),
            42,
            payload.to_vec(),
        )
    }

    #[test]
    fn test_frame_encode_decode() {
        let mut frame = data_frame(b"Hello");
        frame.flags.insert(FrameFlags::OVER);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 5 + PAYLOAD_CRC_LEN);

        let decoded = ProtocolFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_over());
    }

    #[test]
    fn test_frame_header_crc_validation() {
        let mut encoded = data_frame(b"Hello").encode().unwrap();
        encoded[HEADER_LEN - 1] = encoded[HEADER_LEN - 1].wrapping_add(1);
        match ProtocolFrame::decode(&encoded) {
            Err(ModemError::FrameIntegrityFailure(IntegrityFault::HeaderCrc)) => {}
            other => panic!("Expected header CRC failure, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut encoded = data_frame(b"Hello World").encode().unwrap();
        encoded[HEADER_LEN + 1] = b'g';
        match ProtocolFrame::decode(&encoded) {
            Err(ModemError::FrameIntegrityFailure(IntegrityFault::PayloadCrc)) => {}
            other => panic!("Expected payload CRC failure, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_crc_covers_header() {
        // A header that passes its own CRC but was swapped for another frame's
        // must still fail the frame CRC.
        let a = data_frame(b"abc");
        let mut b = data_frame(b"abc");
        b.sequence = 43;
        let (_, block_a) = a.encode_parts().unwrap();
        let header_b = b.header().unwrap();
        assert!(ProtocolFrame::from_parts(&header_b, &block_a).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = data_frame(&[0u8; MAX_MTU + 1]);
        assert!(matches!(
            frame.encode(),
            Err(ModemError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut header = data_frame(b"").header().unwrap().encode();
        header[0] = (FRAME_VERSION << 4) | 0x0F;
        header[HEADER_LEN - 1] = crc8(&header[..HEADER_LEN - 1]);
        assert!(matches!(
            FrameHeader::decode(&header),
            Err(ModemError::FrameIntegrityFailure(
                IntegrityFault::UnknownFrameType
            ))
        ));
    }

    #[test]
    fn test_connect_request_bytes() {
        let request = ConnectRequest {
            caller: Callsign::new("K1ABC").unwrap(),
            callee: Callsign::new("W1AW").unwrap(),
            requested: Throughput::new(2000, 300),
            mtu: 64,
        };
        let parsed = ConnectRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert!(ConnectRequest::from_bytes(&request.to_bytes()[..6]).is_err());
    }

    #[test]
    fn test_ack_info_coverage() {
        let ack = AckInfo {
            next_expected: 10,
            received_mask: 0b101,
        };
        assert!(ack.acknowledges(9));
        assert!(ack.acknowledges(0));
        assert!(!ack.acknowledges(10));
        assert!(ack.acknowledges(11));
        assert!(!ack.acknowledges(12));
        assert!(ack.acknowledges(13));
        assert!(!ack.acknowledges(50));
    }

    #[test]
    fn test_ack_info_wraps() {
        let ack = AckInfo {
            next_expected: 1,
            received_mask: 0,
        };
        assert!(ack.acknowledges(0));
        assert!(ack.acknowledges(u16::MAX));
        assert!(!ack.acknowledges(1));
    }

    proptest! {
        #[test]
        fn single_byte_corruption_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let encoded = data_frame(&payload).encode().unwrap();
            let mut corrupted = encoded.clone();
            let at = index.index(corrupted.len());
            corrupted[at] ^= flip;
            prop_assert!(ProtocolFrame::decode(&corrupted).is_err());
        }
    }
}
