use crate::error::{ModemError, Result};

/// Constraint length of the convolutional code.
pub const CONSTRAINT_LENGTH: usize = 7;
/// Tail bits appended to return the encoder to state 0.
pub const TAIL_BITS: usize = CONSTRAINT_LENGTH - 1;

const NUM_STATES: usize = 1 << TAIL_BITS;
/// Generator polynomials, 133 and 171 octal.
const G1: u8 = 0b1011011;
const G2: u8 = 0b1111001;

/// Number of coded bits produced for `data_bytes` of input.
pub const fn coded_bits(data_bytes: usize) -> usize {
    (data_bytes * 8 + TAIL_BITS) * 2
}

fn parity(byte: u8) -> u8 {
    (byte.count_ones() & 1) as u8
}

fn branch_output(state: u8, input: u8) -> (u8, u8) {
    let register = ((input << 6) | state) & 0x7F;
    (parity(register & G1), parity(register & G2))
}

fn next_state(state: u8, input: u8) -> u8 {
    (state >> 1) | (input << 5)
}

/// Rate 1/2, K=7 convolutional encoder with zero-tail termination.
pub struct ConvolutionalEncoder {
    state: u8,
}

impl ConvolutionalEncoder {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn encode_bit(&mut self, input: bool) -> [bool; 2] {
        let bit = input as u8;
        let (a, b) = branch_output(self.state, bit);
        self.state = next_state(self.state, bit);
        [a != 0, b != 0]
    }

    /// Encode a message MSB first and flush the register.
    pub fn encode(&mut self, data: &[u8]) -> Vec<bool> {
        self.reset();
        let mut output = Vec::with_capacity(coded_bits(data.len()));
        for &byte in data {
            for i in 0..8 {
                output.extend(self.encode_bit((byte >> (7 - i)) & 1 == 1));
            }
        }
        for _ in 0..TAIL_BITS {
            output.extend(self.encode_bit(false));
        }
        output
    }

    pub fn reset(&mut self) {
        self.state = 0;
    }
}

impl Default for ConvolutionalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Soft-decision Viterbi decoder over all 64 trellis states.
///
/// Soft inputs are in 0.0..=1.0, where 0.5 means no information.
pub struct ViterbiDecoder {
    metrics: Vec<f32>,
    next_metrics: Vec<f32>,
    /// One word per trellis step; bit `s` holds the survivor choice for state `s`.
    decisions: Vec<u64>,
}

impl ViterbiDecoder {
    pub fn new() -> Self {
        Self {
            metrics: vec![0.0; NUM_STATES],
            next_metrics: vec![0.0; NUM_STATES],
            decisions: Vec::new(),
        }
    }

    /// Decode a terminated code word. Returns the information bits without the tail.
    pub fn decode_soft(&mut self, soft_bits: &[f32]) -> Result<Vec<bool>> {
        if soft_bits.len() < 2 * TAIL_BITS {
            return Err(ModemError::InsufficientData);
        }
        if soft_bits.len() % 2 != 0 {
            return Err(ModemError::InvalidInputSize);
        }

        let steps = soft_bits.len() / 2;
        self.metrics.fill(f32::INFINITY);
        self.metrics[0] = 0.0;
        self.decisions.clear();
        self.decisions.reserve(steps);

        for pair in soft_bits.chunks_exact(2) {
            let (r1, r2) = (pair[0].clamp(0.0, 1.0), pair[1].clamp(0.0, 1.0));
            let mut chosen = 0u64;

            for target in 0..NUM_STATES {
                let input = (target >> 5) as u8;
                let base = ((target & 0x1F) << 1) as u8;
                let mut best = f32::INFINITY;
                let mut best_low_bit = 0u64;

                for low_bit in 0..2u8 {
                    let prev = base | low_bit;
                    let prev_metric = self.metrics[prev as usize];
                    if !prev_metric.is_finite() {
                        continue;
                    }
                    let (o1, o2) = branch_output(prev, input);
                    let metric =
                        prev_metric + (r1 - o1 as f32).abs() + (r2 - o2 as f32).abs();
                    if metric < best {
                        best = metric;
                        best_low_bit = low_bit as u64;
                    }
                }

                self.next_metrics[target] = best;
                chosen |= best_low_bit << target;
            }

            std::mem::swap(&mut self.metrics, &mut self.next_metrics);
            self.decisions.push(chosen);
        }

        // Terminated code: trace back from state 0, falling back to the best
        // state if the tail was damaged beyond recovery.
        let mut state = if self.metrics[0].is_finite() {
            0usize
        } else {
            self.metrics
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_finite())
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(s, _)| s)
                .ok_or(ModemError::InsufficientData)?
        };

        let mut bits = vec![false; steps];
        for step in (0..steps).rev() {
            bits[step] = (state >> 5) & 1 == 1;
            let low_bit = ((self.decisions[step] >> state) & 1) as usize;
            state = ((state & 0x1F) << 1) | low_bit;
        }

        bits.truncate(steps - TAIL_BITS);
        Ok(bits)
    }

    pub fn decode_hard(&mut self, hard_bits: &[bool]) -> Result<Vec<bool>> {
        let soft: Vec<f32> = hard_bits.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        self.decode_soft(&soft)
    }

    /// Decode a code word carrying exactly `len` bytes.
    pub fn decode_bytes(&mut self, soft_bits: &[f32], len: usize) -> Result<Vec<u8>> {
        if soft_bits.len() < coded_bits(len) {
            return Err(ModemError::InsufficientData);
        }
        let bits = self.decode_soft(&soft_bits[..coded_bits(len)])?;
        Ok(pack_bits(&bits[..len * 8]))
    }
}

impl Default for ViterbiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// MSB-first packing; a trailing partial byte is zero padded.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | ((bit as u8) << (7 - i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_soft(bits: &[bool], one: f32, zero: f32) -> Vec<f32> {
        bits.iter().map(|&b| if b { one } else { zero }).collect()
    }

    #[test]
    fn test_coded_length() {
        let mut encoder = ConvolutionalEncoder::new();
        assert_eq!(encoder.encode(&[0xFF]).len(), 28);
        assert_eq!(encoder.encode(b"").len(), 12);
        assert_eq!(coded_bits(10), 172);
    }

    #[test]
    fn test_clean_round_trip() {
        let data = b"CQ CQ DE K1ABC";
        let mut encoder = ConvolutionalEncoder::new();
        let encoded = encoder.encode(data);
        let mut decoder = ViterbiDecoder::new();
        let decoded = decoder.decode_bytes(&to_soft(&encoded, 0.95, 0.05), data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_corrects_scattered_hard_errors() {
        let data = b"The quick brown fox";
        let mut encoder = ConvolutionalEncoder::new();
        let mut encoded = encoder.encode(data);
        // Free distance is 10, so isolated errors well apart are always corrected.
        for i in (7..encoded.len()).step_by(40) {
            encoded[i] = !encoded[i];
        }
        let mut decoder = ViterbiDecoder::new();
        let bits = decoder.decode_hard(&encoded).unwrap();
        assert_eq!(pack_bits(&bits), data);
    }

    #[test]
    fn test_soft_erasures() {
        let data = b"erasure";
        let mut encoder = ConvolutionalEncoder::new();
        let encoded = encoder.encode(data);
        let mut soft = to_soft(&encoded, 0.9, 0.1);
        for i in (3..soft.len()).step_by(9) {
            soft[i] = 0.5;
        }
        let mut decoder = ViterbiDecoder::new();
        assert_eq!(decoder.decode_bytes(&soft, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decoder_reuse() {
        let mut encoder = ConvolutionalEncoder::new();
        let mut decoder = ViterbiDecoder::new();
        for message in [&b"A"[..], b"Zulu", b"\x00\xFF\xAA"] {
            let encoded = encoder.encode(message);
            let decoded = decoder
                .decode_bytes(&to_soft(&encoded, 1.0, 0.0), message.len())
                .unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_rejects_odd_length() {
        let mut decoder = ViterbiDecoder::new();
        assert!(matches!(
            decoder.decode_soft(&[0.0; 13]),
            Err(ModemError::InvalidInputSize)
        ));
        assert!(matches!(
            decoder.decode_soft(&[0.0; 4]),
            Err(ModemError::InsufficientData)
        ));
    }

    #[test]
    fn test_pack_bits() {
        let bits = [true, false, true, false, false, false, false, true, true];
        assert_eq!(pack_bits(&bits), vec![0xA1, 0x80]);
    }
}
