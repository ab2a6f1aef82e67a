//! One ARQ connection: send window, receive window and timers.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::callsign::{Callsign, StationId};
use crate::config::ArqConfig;
use crate::error::{ModemError, Result};
use crate::framing::AckInfo;
use crate::license::Throughput;
use crate::rtt::RttEstimator;

/// Largest send window; also the reach of the selective-ack bitmap.
pub const MAX_WINDOW: usize = 32;

#[derive(Debug, Clone)]
struct Segment {
    sequence: u16,
    payload: Vec<u8>,
    transmissions: u32,
    /// Due for (re)transmission.
    pending: bool,
    /// Handed to the transmitter but not yet on air.
    in_flight: bool,
    sent_at: Option<Instant>,
    deadline: Option<Instant>,
}

/// Outbound queue. Segments are numbered in send order and stay outstanding,
/// oldest first, until acknowledged.
#[derive(Debug)]
pub struct SendWindow {
    mtu: usize,
    window: usize,
    max_retries: u32,
    next_sequence: u16,
    queued: VecDeque<Vec<u8>>,
    outstanding: VecDeque<Segment>,
}

#[derive(Debug, Default, PartialEq)]
pub struct AckOutcome {
    pub acknowledged: Vec<u16>,
    /// Only taken from segments sent exactly once.
    pub rtt_sample: Option<Duration>,
}

impl SendWindow {
    pub fn new(mtu: usize, window: usize, max_retries: u32) -> Self {
        Self {
            mtu: mtu.max(1),
            window: window.clamp(1, MAX_WINDOW),
            max_retries,
            next_sequence: 0,
            queued: VecDeque::new(),
            outstanding: VecDeque::new(),
        }
    }

    /// Split `data` into MTU-sized segments. Returns the number queued.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        let before = self.queued.len();
        self.queued
            .extend(data.chunks(self.mtu).map(|chunk| chunk.to_vec()));
        self.queued.len() - before
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.outstanding.is_empty()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn has_pending(&self) -> bool {
        self.outstanding.iter().any(|s| s.pending)
            || (!self.queued.is_empty() && self.outstanding.len() < self.window)
    }

    /// Segments to put on air now, oldest first.
    pub fn take_pending(&mut self) -> Vec<(u16, Vec<u8>)> {
        while self.outstanding.len() < self.window {
            let Some(payload) = self.queued.pop_front() else {
                break;
            };
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            self.outstanding.push_back(Segment {
                sequence,
                payload,
                transmissions: 0,
                pending: true,
                in_flight: false,
                sent_at: None,
                deadline: None,
            });
        }

        let mut frames = Vec::new();
        for segment in self.outstanding.iter_mut().filter(|s| s.pending) {
            segment.pending = false;
            segment.in_flight = true;
            segment.transmissions += 1;
            segment.deadline = None;
            frames.push((segment.sequence, segment.payload.clone()));
        }
        frames
    }

    /// The burst carrying the in-flight segments has left the air.
    pub fn on_transmitted(&mut self, now: Instant, rto: Duration) {
        for segment in self.outstanding.iter_mut().filter(|s| s.in_flight) {
            segment.in_flight = false;
            segment.sent_at = Some(now);
            segment.deadline = Some(now + rto);
        }
    }

    /// Apply an acknowledgment.
    ///
    /// The remote only acks after hearing our burst, so a segment already on
    /// air that the ack does not cover was lost and is queued again at once.
    pub fn on_ack(&mut self, ack: &AckInfo, now: Instant) -> Result<AckOutcome> {
        let mut outcome = AckOutcome::default();
        let mut kept = VecDeque::with_capacity(self.outstanding.len());
        for segment in self.outstanding.drain(..) {
            if ack.acknowledges(segment.sequence) {
                if segment.transmissions == 1 {
                    if let Some(sent) = segment.sent_at {
                        outcome.rtt_sample = Some(now.saturating_duration_since(sent));
                    }
                }
                outcome.acknowledged.push(segment.sequence);
            } else {
                kept.push_back(segment);
            }
        }
        self.outstanding = kept;

        if !outcome.acknowledged.is_empty() {
            let max_retries = self.max_retries;
            for segment in self
                .outstanding
                .iter_mut()
                .filter(|s| s.sent_at.is_some() && !s.in_flight && !s.pending)
            {
                expire(segment, max_retries)?;
            }
        }
        Ok(outcome)
    }

    /// Re-queue segments whose timer ran out. Returns whether any did.
    pub fn on_timeout(&mut self, now: Instant) -> Result<bool> {
        let max_retries = self.max_retries;
        let mut expired = false;
        for segment in self
            .outstanding
            .iter_mut()
            .filter(|s| s.deadline.is_some_and(|d| d <= now))
        {
            expire(segment, max_retries)?;
            expired = true;
        }
        Ok(expired)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.iter().filter_map(|s| s.deadline).min()
    }
}

fn expire(segment: &mut Segment, max_retries: u32) -> Result<()> {
    if segment.transmissions > max_retries {
        log::debug!(
            "segment {} unacknowledged after {} transmissions",
            segment.sequence,
            segment.transmissions
        );
        return Err(ModemError::LinkFailure);
    }
    segment.pending = true;
    segment.deadline = None;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Payloads now deliverable, in sequence order.
    Delivered(Vec<Vec<u8>>),
    /// Held until the gap before it is filled.
    Buffered,
    Duplicate,
    OutOfWindow,
}

/// Inbound reorder buffer. Delivers each sequence exactly once, in order.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    next_expected: u16,
    buffered: HashMap<u16, Vec<u8>>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn accept(&mut self, sequence: u16, payload: Vec<u8>) -> Receipt {
        let offset = sequence.wrapping_sub(self.next_expected) as usize;
        if offset > u16::MAX as usize / 2 {
            return Receipt::Duplicate;
        }
        if offset > MAX_WINDOW {
            return Receipt::OutOfWindow;
        }
        if offset > 0 {
            if self.buffered.contains_key(&sequence) {
                return Receipt::Duplicate;
            }
            self.buffered.insert(sequence, payload);
            return Receipt::Buffered;
        }

        let mut delivered = vec![payload];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            delivered.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Receipt::Delivered(delivered)
    }

    pub fn ack_info(&self) -> AckInfo {
        let mut received_mask = 0u32;
        for bit in 0..MAX_WINDOW {
            let sequence = self.next_expected.wrapping_add(bit as u16 + 1);
            if self.buffered.contains_key(&sequence) {
                received_mask |= 1 << bit;
            }
        }
        AckInfo {
            next_expected: self.next_expected,
            received_mask,
        }
    }
}

/// A connected ARQ session.
#[derive(Debug)]
pub struct Session {
    local: Callsign,
    remote: Callsign,
    remote_id: StationId,
    throughput: Throughput,
    mtu: usize,
    send: SendWindow,
    receive: ReceiveWindow,
    rtt: RttEstimator,
    ack_due: bool,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl Session {
    pub fn new(
        local: Callsign,
        remote: Callsign,
        throughput: Throughput,
        mtu: usize,
        config: &ArqConfig,
        now: Instant,
    ) -> Self {
        let remote_id = remote.station_id();
        Self {
            local,
            remote,
            remote_id,
            throughput,
            mtu,
            send: SendWindow::new(mtu, config.window, config.max_data_retries),
            receive: ReceiveWindow::new(),
            rtt: RttEstimator::new(config.initial_rto(), config.min_rto(), config.max_rto()),
            ack_due: false,
            idle_timeout: config.session_idle_timeout(),
            last_activity: now,
        }
    }

    pub fn local(&self) -> &Callsign {
        &self.local
    }

    pub fn remote(&self) -> &Callsign {
        &self.remote
    }

    pub fn remote_id(&self) -> StationId {
        self.remote_id
    }

    pub fn throughput(&self) -> Throughput {
        self.throughput
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn send_window(&self) -> &SendWindow {
        &self.send
    }

    pub fn receive_window(&self) -> &ReceiveWindow {
        &self.receive
    }

    pub fn queue(&mut self, data: &[u8]) -> usize {
        self.send.enqueue(data)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn receive(&mut self, sequence: u16, payload: Vec<u8>, now: Instant) -> Receipt {
        self.touch(now);
        let receipt = self.receive.accept(sequence, payload);
        if receipt != Receipt::OutOfWindow {
            self.ack_due = true;
        }
        receipt
    }

    pub fn has_traffic(&self) -> bool {
        self.ack_due || self.send.has_pending()
    }

    pub fn take_ack(&mut self) -> Option<AckInfo> {
        if !self.ack_due {
            return None;
        }
        self.ack_due = false;
        Some(self.receive.ack_info())
    }

    pub fn take_data(&mut self) -> Vec<(u16, Vec<u8>)> {
        self.send.take_pending()
    }

    pub fn on_transmitted(&mut self, now: Instant) {
        self.touch(now);
        self.send.on_transmitted(now, self.rtt.rto());
    }

    pub fn on_ack(&mut self, ack: &AckInfo, now: Instant) -> Result<Vec<u16>> {
        self.touch(now);
        let outcome = self.send.on_ack(ack, now)?;
        if let Some(sample) = outcome.rtt_sample {
            self.rtt.on_sample(sample);
        }
        Ok(outcome.acknowledged)
    }

    pub fn on_timeout(&mut self, now: Instant) -> Result<()> {
        if now.saturating_duration_since(self.last_activity) >= self.idle_timeout {
            log::info!("session with {} idle for {:?}", self.remote, self.idle_timeout);
            return Err(ModemError::LinkFailure);
        }
        if self.send.on_timeout(now)? {
            self.rtt.backoff();
        }
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let idle = self.last_activity + self.idle_timeout;
        Some(self.send.next_deadline().map_or(idle, |d| d.min(idle)))
    }
}
