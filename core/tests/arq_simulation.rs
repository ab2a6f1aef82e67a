//! Two protocol state machines talking over a simulated half-duplex channel.
//!
//! No audio is involved: bursts are handed over as frames, each frame takes
//! a fixed airtime, and a loss function decides what the receiver hears.

use std::time::{Duration, Instant};

use arqmodem_core::config::ArqConfig;
use arqmodem_core::{
    Callsign, FrameType, LicenseEntitlement, ProtocolFrame, ProtocolState, ProtocolStateMachine,
    SessionEvent, TerminalReason, Throughput, Tier,
};

const FRAME_AIRTIME: Duration = Duration::from_millis(400);
const TICK: Duration = Duration::from_millis(50);

struct Station {
    machine: ProtocolStateMachine,
    events: Vec<SessionEvent>,
    sent: Vec<ProtocolFrame>,
}

impl Station {
    fn new(callsign: &str, tier: Tier) -> Self {
        Self {
            machine: ProtocolStateMachine::new(
                call(callsign),
                LicenseEntitlement::for_tier(tier),
                ArqConfig::default(),
            ),
            events: Vec::new(),
            sent: Vec::new(),
        }
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.machine.poll_event() {
            self.events.push(event);
        }
    }

    fn sent_of(&self, frame_type: FrameType) -> Vec<&ProtocolFrame> {
        self.sent
            .iter()
            .filter(|f| f.frame_type == frame_type)
            .collect()
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::DataReceived(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn acknowledged(&self) -> Vec<u16> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::DataAcknowledged { sequence } => Some(*sequence),
                _ => None,
            })
            .collect()
    }

    fn ended_with(&self, reason: TerminalReason) -> bool {
        self.events.iter().any(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    to: ProtocolState::Idle,
                    reason: Some(r),
                    ..
                } if *r == reason
            )
        })
    }
}

type LossFn = Box<dyn FnMut(&ProtocolFrame) -> bool>;

struct Channel {
    a: Station,
    b: Station,
    start: Instant,
    now: Instant,
    /// Returns true for frames that never reach the other station.
    lose: LossFn,
}

impl Channel {
    fn new(a: Station, b: Station) -> Self {
        let now = Instant::now();
        Self {
            a,
            b,
            start: now,
            now,
            lose: Box::new(|_: &ProtocolFrame| false),
        }
    }

    fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    fn tick(&mut self) {
        for a_turn in [true, false] {
            let (tx, rx) = if a_turn {
                (&mut self.a, &mut self.b)
            } else {
                (&mut self.b, &mut self.a)
            };
            tx.machine.handle_timeout(self.now);
            if let Some(burst) = tx.machine.poll_transmit(self.now) {
                let end = self.now + FRAME_AIRTIME * burst.len() as u32;
                tx.machine.on_transmit_complete(end);
                for frame in burst.frames {
                    tx.sent.push(frame.clone());
                    if !(self.lose)(&frame) {
                        rx.machine.handle_frame(frame, end);
                    }
                }
                self.now = end;
            }
            tx.drain_events();
            rx.drain_events();
        }
        self.now += TICK;
    }

    /// Run until `done` holds. Returns false if `limit` of simulated time
    /// passes first.
    fn run_until(&mut self, limit: Duration, done: impl Fn(&Station, &Station) -> bool) -> bool {
        while self.elapsed() < limit {
            if done(&self.a, &self.b) {
                return true;
            }
            self.tick();
        }
        done(&self.a, &self.b)
    }
}

fn call(text: &str) -> Callsign {
    Callsign::new(text).unwrap()
}

fn both_connected(a: &Station, b: &Station) -> bool {
    a.machine.state() == ProtocolState::Connected && b.machine.state() == ProtocolState::Connected
}

fn connected_pair(a_tier: Tier, b_tier: Tier) -> Channel {
    let mut channel = Channel::new(Station::new("N0CALL", a_tier), Station::new("K1ABC", b_tier));
    channel.b.machine.listen().unwrap();
    channel
        .a
        .machine
        .connect(call("K1ABC"), Throughput::new(2000, 300))
        .unwrap();
    assert!(channel.run_until(Duration::from_secs(30), both_connected));
    channel
}

#[test]
fn test_handshake_completes_in_one_round_trip() {
    let channel = connected_pair(Tier::Basic, Tier::Basic);
    assert_eq!(channel.a.sent_of(FrameType::ConnectRequest).len(), 1);
    assert_eq!(channel.b.sent_of(FrameType::ConnectAccept).len(), 1);
    assert!(channel.elapsed() < ArqConfig::default().handshake_timeout());

    let established = |s: &Station| {
        s.events.iter().find_map(|e| match e {
            SessionEvent::SessionEstablished { throughput, .. } => Some(*throughput),
            _ => None,
        })
    };
    assert_eq!(established(&channel.a), Some(Throughput::new(2000, 300)));
    assert_eq!(established(&channel.b), Some(Throughput::new(2000, 300)));
}

#[test]
fn test_free_tier_callee_limits_the_session() {
    let channel = connected_pair(Tier::Pro, Tier::Free);
    let session = channel.a.machine.session().unwrap();
    assert_eq!(session.throughput(), Throughput::new(500, 100));
    assert_eq!(
        channel.b.machine.session().unwrap().throughput(),
        Throughput::new(500, 100)
    );
}

#[test]
fn test_connect_timeout_after_exact_retry_count() {
    let config = ArqConfig::default();
    let mut channel = Channel::new(Station::new("N0CALL", Tier::Basic), Station::new("K1ABC", Tier::Basic));
    let callee = call("K1ABC").station_id();
    // Every accept is lost.
    channel.lose = Box::new(move |frame: &ProtocolFrame| frame.source == callee);
    channel.b.machine.listen().unwrap();
    channel
        .a
        .machine
        .connect(call("K1ABC"), Throughput::new(2000, 300))
        .unwrap();

    assert!(channel.run_until(Duration::from_secs(300), |a, _| {
        a.machine.state() == ProtocolState::Idle
    }));
    assert_eq!(
        channel.a.sent_of(FrameType::ConnectRequest).len() as u32,
        1 + config.max_connect_retries
    );
    assert!(channel.a.ended_with(TerminalReason::ConnectTimeout));
}

#[test]
fn test_in_order_exactly_once_under_reordering_and_duplication() {
    let mut channel = connected_pair(Tier::Basic, Tier::Basic);
    let a_id = call("N0CALL").station_id();
    let b_id = call("K1ABC").station_id();
    let now = channel.now;

    for sequence in [2u16, 0, 0, 3, 1, 2, 1, 3] {
        let frame = ProtocolFrame::new(
            FrameType::Data,
            a_id,
            b_id,
            sequence,
            format!("p{}", sequence).into_bytes(),
        );
        channel.b.machine.handle_frame(frame, now);
    }
    channel.b.drain_events();

    assert_eq!(
        channel.b.received(),
        vec![b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
    );
}

#[test]
fn test_lost_second_frame_is_retransmitted_before_third_is_delivered() {
    let mut channel = connected_pair(Tier::Basic, Tier::Basic);
    let mut lost = false;
    channel.lose = Box::new(move |frame: &ProtocolFrame| {
        if frame.frame_type == FrameType::Data && frame.sequence == 1 && !lost {
            lost = true;
            return true;
        }
        false
    });

    for payload in [b"one".as_slice(), b"two", b"three"] {
        assert_eq!(channel.a.machine.send(payload).unwrap(), 1);
    }
    assert!(channel.run_until(Duration::from_secs(60), |a, b| {
        b.received().len() == 3 && a.acknowledged().len() == 3
    }));

    assert_eq!(
        channel.b.received(),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
    let data = channel.a.sent_of(FrameType::Data);
    let count = |seq: u16| data.iter().filter(|f| f.sequence == seq).count();
    assert_eq!((count(0), count(1), count(2)), (1, 2, 1));
}

#[test]
fn test_lost_ack_leads_to_retransmission_without_duplicate_delivery() {
    let mut channel = connected_pair(Tier::Basic, Tier::Basic);
    let mut acks_lost = 0;
    channel.lose = Box::new(move |frame: &ProtocolFrame| {
        if frame.frame_type == FrameType::Ack && acks_lost == 0 {
            acks_lost += 1;
            return true;
        }
        false
    });

    channel.a.machine.send(b"hello").unwrap();
    channel.a.machine.send(b"world").unwrap();
    assert!(channel.run_until(Duration::from_secs(60), |a, _| {
        a.acknowledged().len() == 2
    }));

    assert_eq!(channel.b.received(), vec![b"hello".to_vec(), b"world".to_vec()]);
    assert_eq!(channel.a.sent_of(FrameType::Data).len(), 4);
    assert_eq!(channel.b.sent_of(FrameType::Ack).len(), 2);
}

#[test]
fn test_data_in_both_directions_then_disconnect() {
    let mut channel = connected_pair(Tier::Basic, Tier::Basic);
    let long: Vec<u8> = (0..200u8).collect();
    let frames = channel.a.machine.send(&long).unwrap();
    assert_eq!(frames, long.len().div_ceil(ArqConfig::default().mtu));
    channel.b.machine.send(b"reply").unwrap();

    assert!(channel.run_until(Duration::from_secs(120), |a, b| {
        b.received().concat() == long && a.received() == vec![b"reply".to_vec()]
    }));

    channel.a.machine.disconnect().unwrap();
    assert!(channel.run_until(Duration::from_secs(60), |a, b| {
        a.machine.state() == ProtocolState::Idle && b.machine.state() == ProtocolState::Idle
    }));
    assert!(channel.a.ended_with(TerminalReason::LocalDisconnect));
    assert!(channel.b.ended_with(TerminalReason::RemoteDisconnect));
}

#[test]
fn test_silent_peer_causes_link_failure() {
    let mut channel = connected_pair(Tier::Basic, Tier::Basic);
    let callee = call("K1ABC").station_id();
    channel.lose = Box::new(move |frame: &ProtocolFrame| frame.source == callee);
    channel.a.machine.send(b"anyone there?").unwrap();

    assert!(channel.run_until(Duration::from_secs(3600), |a, _| {
        a.machine.state() == ProtocolState::Idle
    }));
    assert!(channel.a.ended_with(TerminalReason::LinkFailure));
    let config = ArqConfig::default();
    assert_eq!(
        channel.a.sent_of(FrameType::Data).len() as u32,
        1 + config.max_data_retries
    );
}
