//! Half-duplex ARQ connection state machine.
//!
//! The machine never touches audio or clocks. The caller feeds it received
//! frames and the current time, asks it what to transmit, and reports when a
//! burst has actually left the air:
//!
//! ```text
//! loop {
//!     for frame in receiver.push(&audio) { machine.handle_frame(frame, now); }
//!     machine.handle_timeout(now);
//!     if let Some(burst) = machine.poll_transmit(now) {
//!         play(burst);                        // PTT on .. PTT off
//!         machine.on_transmit_complete(now);
//!     }
//!     while let Some(event) = machine.poll_event() { ... }
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use crate::callsign::{Callsign, StationId};
use crate::config::ArqConfig;
use crate::error::{ModemError, Result};
use crate::framing::{
    AckInfo, ConnectAccept, ConnectRequest, FrameFlags, FrameType, ProtocolFrame,
};
use crate::license::{clamp, LicenseEntitlement, Throughput};
use crate::session::{Receipt, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
}

impl ProtocolState {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolState::Idle => "IDLE",
            ProtocolState::Listening => "LISTENING",
            ProtocolState::Connecting => "CONNECTING",
            ProtocolState::Connected => "CONNECTED",
            ProtocolState::Disconnecting => "DISCONNECTING",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// No accept after every handshake attempt.
    ConnectTimeout,
    /// Data retry budget exhausted, or the session went idle.
    LinkFailure,
    /// The audio path failed underneath the session.
    StreamDropped,
    LocalDisconnect,
    RemoteDisconnect,
    /// Our disconnect was never acknowledged; torn down anyway.
    DisconnectTimeout,
    /// A pending listen or connect was withdrawn.
    Cancelled,
}

impl TerminalReason {
    /// The error a caller waiting on the connection should see, if any.
    pub fn to_error(self) -> Option<ModemError> {
        match self {
            TerminalReason::ConnectTimeout => Some(ModemError::ConnectTimeout),
            TerminalReason::LinkFailure => Some(ModemError::LinkFailure),
            TerminalReason::StreamDropped => Some(ModemError::StreamDropped(
                "session aborted".to_string(),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminalReason::ConnectTimeout => "connect timeout",
            TerminalReason::LinkFailure => "link failure",
            TerminalReason::StreamDropped => "audio stream dropped",
            TerminalReason::LocalDisconnect => "local disconnect",
            TerminalReason::RemoteDisconnect => "remote disconnect",
            TerminalReason::DisconnectTimeout => "disconnect not acknowledged",
            TerminalReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: ProtocolState,
        to: ProtocolState,
        reason: Option<TerminalReason>,
    },
    SessionEstablished {
        remote: Callsign,
        throughput: Throughput,
        mtu: usize,
    },
    /// One payload, delivered in order and exactly once.
    DataReceived(Vec<u8>),
    DataAcknowledged {
        sequence: u16,
    },
}

/// Frames to transmit in one PTT period. The last one carries `OVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burst {
    pub frames: Vec<ProtocolFrame>,
}

impl Burst {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug)]
struct Handshake {
    remote: Callsign,
    granted: Throughput,
    transmissions: u32,
    pending: bool,
    in_flight: bool,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Teardown {
    remote_id: StationId,
    transmissions: u32,
    pending: bool,
    in_flight: bool,
    deadline: Option<Instant>,
}

/// Whether the modem can actually run a given throughput.
pub type ModeCheck = Box<dyn Fn(Throughput) -> Result<()> + Send>;

pub struct ProtocolStateMachine {
    local: Callsign,
    local_id: StationId,
    entitlement: LicenseEntitlement,
    config: ArqConfig,
    state: ProtocolState,
    session: Option<Session>,
    handshake: Option<Handshake>,
    teardown: Option<Teardown>,
    /// Control frames waiting for the next burst.
    control: VecDeque<ProtocolFrame>,
    transmitting: bool,
    /// The remote station owns the channel until then.
    hold_until: Option<Instant>,
    events: VecDeque<SessionEvent>,
    mode_check: Option<ModeCheck>,
}

impl ProtocolStateMachine {
    pub fn new(local: Callsign, entitlement: LicenseEntitlement, config: ArqConfig) -> Self {
        let local_id = local.station_id();
        Self {
            local,
            local_id,
            entitlement,
            config,
            state: ProtocolState::Idle,
            session: None,
            handshake: None,
            teardown: None,
            control: VecDeque::new(),
            transmitting: false,
            hold_until: None,
            events: VecDeque::new(),
            mode_check: None,
        }
    }

    /// Restrict negotiated throughputs to those `check` accepts. Without a
    /// check every throughput within the license is usable.
    pub fn set_mode_check(&mut self, check: ModeCheck) {
        self.mode_check = Some(check);
    }

    fn check_mode(&self, throughput: Throughput) -> Result<()> {
        match self.mode_check.as_ref() {
            Some(check) => check(throughput),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn local(&self) -> &Callsign {
        &self.local
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn entitlement(&self) -> &LicenseEntitlement {
        &self.entitlement
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    // Requests

    pub fn listen(&mut self) -> Result<()> {
        match self.state {
            ProtocolState::Listening => Ok(()),
            ProtocolState::Idle => {
                self.transition(ProtocolState::Listening, None);
                Ok(())
            }
            other => Err(invalid("listen", other)),
        }
    }

    /// Start a handshake. The requested throughput is clamped to the
    /// entitlement before it goes on air.
    pub fn connect(&mut self, remote: Callsign, requested: Throughput) -> Result<()> {
        if !matches!(self.state, ProtocolState::Idle | ProtocolState::Listening) {
            return Err(invalid("connect", self.state));
        }
        let granted = clamp(requested, &self.entitlement);
        if granted != requested {
            log::info!("requested {} limited to {} by license", requested, granted);
        }
        self.check_mode(granted)?;
        log::info!("calling {} at {}", remote, granted);
        self.handshake = Some(Handshake {
            remote,
            granted,
            transmissions: 0,
            pending: true,
            in_flight: false,
            deadline: None,
        });
        self.transition(ProtocolState::Connecting, None);
        Ok(())
    }

    /// Queue application data. Returns the number of frames it was split into.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        match (self.state, self.session.as_mut()) {
            (ProtocolState::Connected, Some(session)) => Ok(session.queue(data)),
            (state, _) => Err(invalid("send", state)),
        }
    }

    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            ProtocolState::Idle | ProtocolState::Disconnecting => Ok(()),
            ProtocolState::Listening | ProtocolState::Connecting => {
                self.handshake = None;
                self.transition(ProtocolState::Idle, Some(TerminalReason::Cancelled));
                Ok(())
            }
            ProtocolState::Connected => {
                let remote_id = self
                    .session
                    .as_ref()
                    .map(|s| s.remote_id())
                    .unwrap_or(StationId::BROADCAST);
                self.teardown = Some(Teardown {
                    remote_id,
                    transmissions: 0,
                    pending: true,
                    in_flight: false,
                    deadline: None,
                });
                self.transition(ProtocolState::Disconnecting, None);
                Ok(())
            }
        }
    }

    /// Drop everything and return to idle, e.g. when the audio path fails.
    pub fn abort(&mut self, reason: TerminalReason) {
        self.control.clear();
        self.transmitting = false;
        self.hold_until = None;
        if self.state != ProtocolState::Idle {
            self.end(reason);
        }
    }

    // Inputs

    pub fn handle_frame(&mut self, frame: ProtocolFrame, now: Instant) {
        if self.transmitting {
            log::trace!("dropping {:?} heard during our own transmission", frame.frame_type);
            return;
        }
        // Any traffic on the channel holds it, whoever it is for.
        let hold = if frame.is_over() {
            self.config.turnaround()
        } else {
            self.config.over_timeout()
        };
        self.hold_until = Some(now + hold);

        if frame.destination != self.local_id && frame.destination != StationId::BROADCAST {
            log::trace!("ignoring frame for {}", frame.destination);
            return;
        }

        match frame.frame_type {
            FrameType::ConnectRequest => self.on_connect_request(&frame, now),
            FrameType::ConnectAccept => self.on_connect_accept(&frame, now),
            FrameType::Data => self.on_data(frame, now),
            FrameType::Ack => self.on_ack(&frame, now),
            FrameType::Disconnect => self.on_disconnect(&frame),
            FrameType::DisconnectAck => self.on_disconnect_ack(&frame),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.hold_until.is_some_and(|t| t <= now) {
            self.hold_until = None;
        }

        if let Some(handshake) = self.handshake.as_mut() {
            if handshake.deadline.is_some_and(|d| d <= now) {
                handshake.deadline = None;
                if handshake.transmissions > self.config.max_connect_retries {
                    log::info!(
                        "no answer from {} after {} calls",
                        handshake.remote,
                        handshake.transmissions
                    );
                    self.handshake = None;
                    self.end(TerminalReason::ConnectTimeout);
                    return;
                }
                log::debug!("handshake timeout; calling {} again", handshake.remote);
                handshake.pending = true;
            }
        }

        if let Some(teardown) = self.teardown.as_mut() {
            if teardown.deadline.is_some_and(|d| d <= now) {
                teardown.deadline = None;
                if teardown.transmissions > self.config.max_disconnect_retries {
                    self.teardown = None;
                    self.end(TerminalReason::DisconnectTimeout);
                    return;
                }
                teardown.pending = true;
            }
        }

        if self.state == ProtocolState::Connected {
            if let Some(session) = self.session.as_mut() {
                if let Err(e) = session.on_timeout(now) {
                    log::warn!("session with {} failed: {}", session.remote(), e);
                    self.end(TerminalReason::LinkFailure);
                }
            }
        }
    }

    /// The burst from the last `poll_transmit` has left the air. Timers
    /// waiting for an answer start now.
    pub fn on_transmit_complete(&mut self, now: Instant) {
        if !self.transmitting {
            return;
        }
        self.transmitting = false;
        // Give the remote station a chance to answer before we talk again.
        self.hold_until = Some(now + self.config.over_timeout());

        if let Some(handshake) = self.handshake.as_mut().filter(|h| h.in_flight) {
            handshake.in_flight = false;
            handshake.deadline = Some(now + self.config.handshake_timeout());
        }
        if let Some(teardown) = self.teardown.as_mut().filter(|t| t.in_flight) {
            teardown.in_flight = false;
            teardown.deadline = Some(now + self.config.disconnect_timeout());
        }
        if let Some(session) = self.session.as_mut() {
            session.on_transmitted(now);
        }
    }

    // Outputs

    /// Frames to transmit now, if we hold the channel and have something to
    /// say.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Burst> {
        if self.transmitting || self.hold_until.is_some_and(|t| t > now) {
            return None;
        }

        let mut frames: Vec<ProtocolFrame> = self.control.drain(..).collect();

        if let Some(handshake) = self.handshake.as_mut().filter(|h| h.pending) {
            handshake.pending = false;
            handshake.in_flight = true;
            handshake.transmissions += 1;
            let request = ConnectRequest {
                caller: self.local.clone(),
                callee: handshake.remote.clone(),
                requested: handshake.granted,
                mtu: self.config.mtu.min(crate::MAX_MTU) as u8,
            };
            frames.push(ProtocolFrame::new(
                FrameType::ConnectRequest,
                self.local_id,
                handshake.remote.station_id(),
                handshake.transmissions as u16,
                request.to_bytes(),
            ));
        }

        if self.state == ProtocolState::Connected {
            if let Some(session) = self.session.as_mut() {
                let remote_id = session.remote_id();
                if let Some(ack) = session.take_ack() {
                    frames.push(ProtocolFrame::new(
                        FrameType::Ack,
                        self.local_id,
                        remote_id,
                        ack.next_expected,
                        ack.to_bytes(),
                    ));
                }
                for (sequence, payload) in session.take_data() {
                    frames.push(ProtocolFrame::new(
                        FrameType::Data,
                        self.local_id,
                        remote_id,
                        sequence,
                        payload,
                    ));
                }
            }
        }

        if let Some(teardown) = self.teardown.as_mut().filter(|t| t.pending) {
            teardown.pending = false;
            teardown.in_flight = true;
            teardown.transmissions += 1;
            frames.push(ProtocolFrame::new(
                FrameType::Disconnect,
                self.local_id,
                teardown.remote_id,
                teardown.transmissions as u16,
                Vec::new(),
            ));
        }

        let last = frames.last_mut()?;
        last.flags.insert(FrameFlags::OVER);
        self.transmitting = true;
        log::debug!("transmitting burst of {} frame(s)", frames.len());
        Some(Burst { frames })
    }

    /// Earliest instant `handle_timeout` has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let handshake = self.handshake.as_ref().and_then(|h| h.deadline);
        let teardown = self.teardown.as_ref().and_then(|t| t.deadline);
        let session = match self.state {
            ProtocolState::Connected => self.session.as_ref().and_then(|s| s.next_deadline()),
            _ => None,
        };
        [self.hold_until, handshake, teardown, session]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Whether anything is waiting for the channel.
    pub fn wants_to_transmit(&self) -> bool {
        !self.control.is_empty()
            || self.handshake.as_ref().is_some_and(|h| h.pending)
            || self.teardown.as_ref().is_some_and(|t| t.pending)
            || (self.state == ProtocolState::Connected
                && self.session.as_ref().is_some_and(|s| s.has_traffic()))
    }

    /// Keep the channel for the remote station, e.g. while a frame is being
    /// received. Never shortens an existing hold.
    pub fn hold_channel(&mut self, until: Instant) {
        if self.hold_until.map_or(true, |t| t < until) {
            self.hold_until = Some(until);
        }
    }

    // Frame handlers

    fn on_connect_request(&mut self, frame: &ProtocolFrame, now: Instant) {
        let request = match ConnectRequest::from_bytes(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("malformed connect request: {}", e);
                return;
            }
        };
        if request.callee != self.local {
            log::debug!("connect request for {}, not {}", request.callee, self.local);
            return;
        }

        match self.state {
            ProtocolState::Listening => {
                let negotiated = clamp(request.requested, &self.entitlement);
                if let Err(e) = self.check_mode(negotiated) {
                    log::warn!("{} called us at {}; not accepting: {}", request.caller, negotiated, e);
                    return;
                }
                let mtu = (request.mtu as usize).min(self.config.mtu).max(1);
                log::info!("{} called us; accepting at {}", request.caller, negotiated);
                self.queue_accept(frame.source, negotiated, mtu);
                self.establish(request.caller, negotiated, mtu, now);
            }
            ProtocolState::Connected => {
                // The caller missed our accept.
                if let Some(session) = self.session.as_ref() {
                    if session.remote() == &request.caller {
                        let (negotiated, mtu) = (session.throughput(), session.mtu());
                        self.queue_accept(frame.source, negotiated, mtu);
                    }
                }
            }
            _ => log::debug!("ignoring connect request from {} while {}", request.caller, self.state),
        }
    }

    fn on_connect_accept(&mut self, frame: &ProtocolFrame, now: Instant) {
        if self.state != ProtocolState::Connecting {
            return;
        }
        let Some(handshake) = self.handshake.as_ref() else {
            return;
        };
        if frame.source != handshake.remote.station_id() {
            return;
        }
        let accept = match ConnectAccept::from_bytes(&frame.payload) {
            Ok(accept) => accept,
            Err(e) => {
                log::debug!("malformed connect accept: {}", e);
                return;
            }
        };
        let negotiated = accept.negotiated.min(handshake.granted);
        if let Err(e) = self.check_mode(negotiated) {
            log::warn!("{} accepted at {}; ignoring: {}", handshake.remote, negotiated, e);
            return;
        }
        let mtu = (accept.mtu as usize).min(self.config.mtu).max(1);
        let remote = handshake.remote.clone();
        self.handshake = None;
        self.establish(remote, negotiated, mtu, now);
    }

    fn on_data(&mut self, frame: ProtocolFrame, now: Instant) {
        if self.state != ProtocolState::Connected {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if frame.source != session.remote_id() {
            return;
        }
        match session.receive(frame.sequence, frame.payload, now) {
            Receipt::Delivered(payloads) => {
                self.events
                    .extend(payloads.into_iter().map(SessionEvent::DataReceived));
            }
            Receipt::Buffered => log::debug!("holding frame {} until the gap fills", frame.sequence),
            Receipt::Duplicate => log::debug!("duplicate frame {}", frame.sequence),
            Receipt::OutOfWindow => log::debug!("frame {} outside window", frame.sequence),
        }
    }

    fn on_ack(&mut self, frame: &ProtocolFrame, now: Instant) {
        if self.state != ProtocolState::Connected {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if frame.source != session.remote_id() {
            return;
        }
        let ack = match AckInfo::from_bytes(&frame.payload) {
            Ok(ack) => ack,
            Err(e) => {
                log::debug!("malformed ack: {}", e);
                return;
            }
        };
        match session.on_ack(&ack, now) {
            Ok(acknowledged) => self.events.extend(
                acknowledged
                    .into_iter()
                    .map(|sequence| SessionEvent::DataAcknowledged { sequence }),
            ),
            Err(e) => {
                log::warn!("session with {} failed: {}", session.remote(), e);
                self.end(TerminalReason::LinkFailure);
            }
        }
    }

    fn on_disconnect(&mut self, frame: &ProtocolFrame) {
        let from_remote = self
            .session
            .as_ref()
            .is_some_and(|s| s.remote_id() == frame.source);
        match self.state {
            ProtocolState::Connected if from_remote => {
                self.queue_disconnect_ack(frame.source);
                self.end(TerminalReason::RemoteDisconnect);
            }
            ProtocolState::Disconnecting if from_remote => {
                self.queue_disconnect_ack(frame.source);
                self.teardown = None;
                self.end(TerminalReason::LocalDisconnect);
            }
            // Our earlier ack was lost.
            ProtocolState::Idle | ProtocolState::Listening => {
                self.queue_disconnect_ack(frame.source)
            }
            _ => {}
        }
    }

    fn on_disconnect_ack(&mut self, frame: &ProtocolFrame) {
        if self.state != ProtocolState::Disconnecting {
            return;
        }
        if self.teardown.as_ref().is_some_and(|t| t.remote_id == frame.source) {
            self.teardown = None;
            self.end(TerminalReason::LocalDisconnect);
        }
    }

    // Helpers

    fn queue_accept(&mut self, destination: StationId, negotiated: Throughput, mtu: usize) {
        let accept = ConnectAccept {
            negotiated,
            mtu: mtu as u8,
        };
        self.control
            .retain(|f| f.frame_type != FrameType::ConnectAccept);
        self.control.push_back(ProtocolFrame::new(
            FrameType::ConnectAccept,
            self.local_id,
            destination,
            0,
            accept.to_bytes(),
        ));
    }

    fn queue_disconnect_ack(&mut self, destination: StationId) {
        if self
            .control
            .iter()
            .any(|f| f.frame_type == FrameType::DisconnectAck && f.destination == destination)
        {
            return;
        }
        self.control.push_back(ProtocolFrame::new(
            FrameType::DisconnectAck,
            self.local_id,
            destination,
            0,
            Vec::new(),
        ));
    }

    fn establish(&mut self, remote: Callsign, throughput: Throughput, mtu: usize, now: Instant) {
        self.session = Some(Session::new(
            self.local.clone(),
            remote.clone(),
            throughput,
            mtu,
            &self.config,
            now,
        ));
        self.transition(ProtocolState::Connected, None);
        self.events.push_back(SessionEvent::SessionEstablished {
            remote,
            throughput,
            mtu,
        });
    }

    fn end(&mut self, reason: TerminalReason) {
        self.session = None;
        self.handshake = None;
        self.teardown = None;
        self.transition(ProtocolState::Idle, Some(reason));
    }

    fn transition(&mut self, to: ProtocolState, reason: Option<TerminalReason>) {
        let from = self.state;
        self.state = to;
        match reason {
            Some(reason) => log::info!("{} -> {} ({})", from, to, reason),
            None => log::info!("{} -> {}", from, to),
        }
        self.events
            .push_back(SessionEvent::StateChanged { from, to, reason });
    }
}

fn invalid(operation: &'static str, state: ProtocolState) -> ModemError {
    ModemError::InvalidState {
        operation,
        state: state.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::Tier;
    use std::time::Duration;

    fn call(text: &str) -> Callsign {
        Callsign::new(text).unwrap()
    }

    fn machine(local: &str, tier: Tier) -> ProtocolStateMachine {
        ProtocolStateMachine::new(
            call(local),
            LicenseEntitlement::for_tier(tier),
            ArqConfig::default(),
        )
    }

    fn drain(m: &mut ProtocolStateMachine) -> Vec<SessionEvent> {
        std::iter::from_fn(|| m.poll_event()).collect()
    }

    #[test]
    fn test_listen_and_invalid_requests() {
        let mut m = machine("N0CALL", Tier::Free);
        assert!(matches!(
            m.send(b"x"),
            Err(ModemError::InvalidState { operation: "send", .. })
        ));
        m.listen().unwrap();
        assert_eq!(m.state(), ProtocolState::Listening);
        assert_eq!(
            drain(&mut m),
            vec![SessionEvent::StateChanged {
                from: ProtocolState::Idle,
                to: ProtocolState::Listening,
                reason: None
            }]
        );
        m.disconnect().unwrap();
        assert_eq!(m.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_connect_request_is_clamped() {
        let now = Instant::now();
        let mut m = machine("N0CALL", Tier::Free);
        m.connect(call("K1ABC"), Throughput::new(2000, 300)).unwrap();
        let burst = m.poll_transmit(now).unwrap();
        assert_eq!(burst.len(), 1);
        let frame = &burst.frames[0];
        assert_eq!(frame.frame_type, FrameType::ConnectRequest);
        assert!(frame.is_over());
        assert_eq!(frame.destination, call("K1ABC").station_id());
        let request = ConnectRequest::from_bytes(&frame.payload).unwrap();
        assert_eq!(request.requested, Throughput::new(500, 100));
    }

    fn checked(local: &str, tier: Tier) -> ProtocolStateMachine {
        let mut m = machine(local, tier);
        m.set_mode_check(Box::new(|t| {
            crate::fsk::MfskKernel::check_geometry(8_000, 1_500.0, t).map(|_| ())
        }));
        m
    }

    #[test]
    fn test_connect_rejects_unbuildable_mode() {
        let now = Instant::now();
        let mut m = checked("N0CALL", Tier::Basic);
        let err = m.connect(call("K1ABC"), Throughput::new(150, 100)).unwrap_err();
        assert!(matches!(err, ModemError::ConfigurationInvalid(_)));
        assert_eq!(m.state(), ProtocolState::Idle);
        assert!(m.poll_transmit(now).is_none());
        assert!(drain(&mut m).is_empty());

        m.connect(call("K1ABC"), Throughput::new(500, 100)).unwrap();
        assert_eq!(m.state(), ProtocolState::Connecting);
    }

    #[test]
    fn test_listener_ignores_unbuildable_request() {
        let now = Instant::now();
        let mut caller = machine("N0CALL", Tier::Basic);
        let mut callee = checked("K1ABC", Tier::Basic);
        callee.listen().unwrap();
        drain(&mut callee);
        caller.connect(call("K1ABC"), Throughput::new(150, 100)).unwrap();

        let request = caller.poll_transmit(now).unwrap();
        for frame in request.frames {
            callee.handle_frame(frame, now);
        }
        assert_eq!(callee.state(), ProtocolState::Listening);
        assert!(callee.session().is_none());
        assert!(drain(&mut callee).is_empty());
        assert!(callee.poll_transmit(now + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_nothing_sent_while_transmitting_or_held() {
        let now = Instant::now();
        let mut m = machine("N0CALL", Tier::Free);
        m.connect(call("K1ABC"), Throughput::new(500, 100)).unwrap();
        assert!(m.poll_transmit(now).is_some());
        assert!(m.is_transmitting());
        assert!(m.poll_transmit(now).is_none());

        m.on_transmit_complete(now);
        assert!(!m.is_transmitting());
        // A foreign station starts talking.
        let other = ProtocolFrame::new(
            FrameType::Data,
            call("W1AW").station_id(),
            call("K2XYZ").station_id(),
            0,
            vec![1],
        );
        m.handle_frame(other, now);
        assert!(m.poll_timeout().is_some());
        assert_eq!(m.state(), ProtocolState::Connecting);
    }

    #[test]
    fn test_retransmit_timer_starts_at_transmit_complete() {
        let start = Instant::now();
        let config = ArqConfig::default();
        let mut m = machine("N0CALL", Tier::Free);
        m.connect(call("K1ABC"), Throughput::new(500, 100)).unwrap();
        m.poll_transmit(start).unwrap();
        let airtime = Duration::from_secs(3);
        assert_eq!(m.poll_timeout(), None);
        m.on_transmit_complete(start + airtime);

        m.handle_timeout(start + config.handshake_timeout());
        assert!(!m.wants_to_transmit());
        m.handle_timeout(start + airtime + config.handshake_timeout());
        assert!(m.wants_to_transmit());
    }

    #[test]
    fn test_remote_disconnect_is_acknowledged() {
        let now = Instant::now();
        let mut caller = machine("N0CALL", Tier::Basic);
        let mut callee = machine("K1ABC", Tier::Basic);
        callee.listen().unwrap();
        caller.connect(call("K1ABC"), Throughput::new(2000, 300)).unwrap();

        let request = caller.poll_transmit(now).unwrap();
        caller.on_transmit_complete(now);
        for frame in request.frames {
            callee.handle_frame(frame, now);
        }
        assert_eq!(callee.state(), ProtocolState::Connected);

        let later = now + Duration::from_secs(1);
        let accept = callee.poll_transmit(later).unwrap();
        callee.on_transmit_complete(later);
        for frame in accept.frames {
            caller.handle_frame(frame, later);
        }
        assert_eq!(caller.state(), ProtocolState::Connected);

        caller.disconnect().unwrap();
        let later = later + Duration::from_secs(1);
        let bye = caller.poll_transmit(later).unwrap();
        caller.on_transmit_complete(later);
        for frame in bye.frames {
            callee.handle_frame(frame, later);
        }
        assert_eq!(callee.state(), ProtocolState::Idle);
        assert!(drain(&mut callee).contains(&SessionEvent::StateChanged {
            from: ProtocolState::Connected,
            to: ProtocolState::Idle,
            reason: Some(TerminalReason::RemoteDisconnect),
        }));

        let later = later + Duration::from_secs(1);
        let ack = callee.poll_transmit(later).unwrap();
        assert_eq!(ack.frames[0].frame_type, FrameType::DisconnectAck);
        callee.on_transmit_complete(later);
        for frame in ack.frames {
            caller.handle_frame(frame, later);
        }
        assert_eq!(caller.state(), ProtocolState::Idle);
        assert!(drain(&mut caller).contains(&SessionEvent::StateChanged {
            from: ProtocolState::Disconnecting,
            to: ProtocolState::Idle,
            reason: Some(TerminalReason::LocalDisconnect),
        }));
    }

    #[test]
    fn test_unanswered_disconnect_tears_down() {
        let now = Instant::now();
        let config = ArqConfig::default();
        let mut caller = machine("N0CALL", Tier::Free);
        let mut callee = machine("K1ABC", Tier::Free);
        callee.listen().unwrap();
        caller.connect(call("K1ABC"), Throughput::new(500, 100)).unwrap();
        for frame in caller.poll_transmit(now).unwrap().frames {
            callee.handle_frame(frame, now);
        }
        caller.on_transmit_complete(now);
        let t = now + Duration::from_secs(1);
        for frame in callee.poll_transmit(t).unwrap().frames {
            caller.handle_frame(frame, t);
        }
        callee.on_transmit_complete(t);

        caller.disconnect().unwrap();
        let mut t = t + config.turnaround();
        let mut sent = 0;
        while caller.state() != ProtocolState::Idle {
            caller.handle_timeout(t);
            if caller.poll_transmit(t).is_some() {
                sent += 1;
                caller.on_transmit_complete(t);
            }
            t += Duration::from_millis(500);
            assert!(sent <= 10, "teardown never finished");
        }
        assert_eq!(sent, 1 + config.max_disconnect_retries);
        assert!(drain(&mut caller).contains(&SessionEvent::StateChanged {
            from: ProtocolState::Disconnecting,
            to: ProtocolState::Idle,
            reason: Some(TerminalReason::DisconnectTimeout),
        }));
    }

    #[test]
    fn test_abort_clears_everything() {
        let now = Instant::now();
        let mut m = machine("N0CALL", Tier::Free);
        m.connect(call("K1ABC"), Throughput::new(500, 100)).unwrap();
        m.poll_transmit(now).unwrap();
        m.abort(TerminalReason::StreamDropped);
        assert_eq!(m.state(), ProtocolState::Idle);
        assert!(!m.is_transmitting());
        assert!(!m.wants_to_transmit());
        assert_eq!(m.poll_timeout(), None);
        assert!(TerminalReason::StreamDropped.to_error().is_some());
    }
}
