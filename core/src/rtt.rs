//! Round-trip time estimation and retransmission timeout (RFC 6298).

use std::time::Duration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const K: u32 = 4;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    initial: Duration,
    min: Duration,
    max: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        let initial = initial.clamp(min, max);
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial,
            initial,
            min,
            max,
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Feed a measurement. Callers must not sample retransmitted frames
    /// (Karn's rule).
    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar.mul_f64(1.0 - BETA) + delta.mul_f64(BETA);
                self.srtt = Some(srtt.mul_f64(1.0 - ALPHA) + rtt.mul_f64(ALPHA));
            }
        }
        if let Some(srtt) = self.srtt {
            self.rto = (srtt + self.rttvar * K).clamp(self.min, self.max);
        }
    }

    /// Double the timeout after an expiry.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).clamp(self.min, self.max);
    }

    pub fn reset(&mut self) {
        self.srtt = None;
        self.rttvar = Duration::ZERO;
        self.rto = self.initial;
    }
}
