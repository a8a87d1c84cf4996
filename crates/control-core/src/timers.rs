//! Per-transaction countdown timers.
//!
//! A transaction owns one [`TimerSet`]: a fixed table indexed by the closed
//! [`TimerId`] enumeration. Arming a timer records a deadline and what to do
//! on expiry: re-enter the current procedure at a given state, or abort the
//! transaction or the whole channel.

use crate::l3::DispatchKey;
use std::time::{Duration, Instant};

/// The closed set of timers the control layer uses. Q.931/04.08 call
/// control timers, MM timers, and the local ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TimerId {
    /// recv ALERT -> recv CONN
    T301 = 0,
    /// send SETUP ACK -> any progress
    T302,
    /// send SETUP -> recv CALL CONF or REL COMP
    T303,
    /// recv SETUP ACK -> any progress
    T304,
    /// send DISC -> recv REL or DISC
    T305,
    /// send REL -> recv REL or REL COMP
    T308,
    /// recv CALL CONF -> recv ALERT, CONN or DISC
    T310,
    /// send CONNECT -> recv CONNECT ACK
    T313,
    /// channel reassignment guard
    T3101,
    /// paging response guard
    T3113,
    /// AuthenticationRequest -> AuthenticationResponse
    T3260,
    /// IdentityRequest -> IdentityResponse
    T3270,
    /// MO-SMS ack guard (GSM 04.11 TR1M)
    TR1M,
    /// MT-SMS ack guard (GSM 04.11 TR2M)
    TR2M,
    /// generic cancellation timer
    TCancel,
    /// generic MM cancellation timer
    TMMCancel,
    /// scratch timer for whoever needs one
    TMisc1,
    /// wait for HandoverComplete (not a GSM timer)
    THandoverComplete,
    /// wait for the peer BTS answer during handover (not a GSM timer)
    TSipHandover,
}

pub const NUM_TIMERS: usize = TimerId::TSipHandover as usize + 1;

const ALL_TIMERS: [TimerId; NUM_TIMERS] = [
    TimerId::T301,
    TimerId::T302,
    TimerId::T303,
    TimerId::T304,
    TimerId::T305,
    TimerId::T308,
    TimerId::T310,
    TimerId::T313,
    TimerId::T3101,
    TimerId::T3113,
    TimerId::T3260,
    TimerId::T3270,
    TimerId::TR1M,
    TimerId::TR2M,
    TimerId::TCancel,
    TimerId::TMMCancel,
    TimerId::TMisc1,
    TimerId::THandoverComplete,
    TimerId::TSipHandover,
];

impl TimerId {
    pub fn name(&self) -> &'static str {
        match self {
            TimerId::T301 => "T301",
            TimerId::T302 => "T302",
            TimerId::T303 => "T303",
            TimerId::T304 => "T304",
            TimerId::T305 => "T305",
            TimerId::T308 => "T308",
            TimerId::T310 => "T310",
            TimerId::T313 => "T313",
            TimerId::T3101 => "T3101",
            TimerId::T3113 => "T3113",
            TimerId::T3260 => "T3260",
            TimerId::T3270 => "T3270",
            TimerId::TR1M => "TR1M",
            TimerId::TR2M => "TR2M",
            TimerId::TCancel => "TCancel",
            TimerId::TMMCancel => "TMMCancel",
            TimerId::TMisc1 => "TMisc1",
            TimerId::THandoverComplete => "THandoverComplete",
            TimerId::TSipHandover => "TSipHandover",
        }
    }

    /// Default duration, GSM 04.08 table 11.4 / ITU-T Q.931 table 9-1.
    pub fn default_duration(&self) -> Duration {
        let ms: u64 = match self {
            TimerId::T301 => 60_000,
            TimerId::T302 => 12_000,
            TimerId::T303 => 10_000,
            TimerId::T304 => 20_000,
            TimerId::T305 => 30_000,
            TimerId::T308 => 30_000,
            TimerId::T310 => 30_000,
            TimerId::T313 => 30_000,
            TimerId::T3101 => 4_000,
            TimerId::T3113 => 10_000,
            TimerId::T3260 => 12_000,
            TimerId::T3270 => 12_000,
            TimerId::TR1M => 15_000,
            TimerId::TR2M => 15_000,
            TimerId::TCancel => 30_000,
            TimerId::TMMCancel => 30_000,
            TimerId::TMisc1 => 5_000,
            TimerId::THandoverComplete => 5_000,
            TimerId::TSipHandover => 4_000,
        };
        Duration::from_millis(ms)
    }
}

/// What to do when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Re-enter the current procedure at this state.
    State(DispatchKey),
    /// Abort the transaction. Pending transactions on the channel survive.
    AbortTran,
    /// Abort the whole channel and everything on it.
    AbortChannel,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    deadline: Instant,
    action: TimerAction,
}

/// The fixed table of timers owned by one transaction.
#[derive(Debug)]
pub struct TimerSet {
    timers: [Option<ArmedTimer>; NUM_TIMERS],
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            timers: [None; NUM_TIMERS],
        }
    }

    /// Arm a timer; rearming replaces the previous deadline.
    pub fn start(&mut self, id: TimerId, duration: Duration, action: TimerAction) {
        self.timers[id as usize] = Some(ArmedTimer {
            deadline: Instant::now() + duration,
            action,
        });
    }

    pub fn stop(&mut self, id: TimerId) {
        self.timers[id as usize] = None;
    }

    pub fn stop_all(&mut self) {
        self.timers = [None; NUM_TIMERS];
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.timers[id as usize].is_some()
    }

    /// An inactive timer is never expired.
    pub fn is_expired(&self, id: TimerId) -> bool {
        match self.timers[id as usize] {
            Some(t) => Instant::now() >= t.deadline,
            None => false,
        }
    }

    /// Pop at most one expired timer, disarming it. The caller routes the
    /// returned action into the procedure; one expiry per service pass keeps
    /// the invocation single-threaded.
    pub fn take_expired(&mut self) -> Option<(TimerId, TimerAction)> {
        let now = Instant::now();
        for id in ALL_TIMERS {
            if let Some(t) = self.timers[id as usize] {
                if now >= t.deadline {
                    self.timers[id as usize] = None;
                    return Some((id, t.action));
                }
            }
        }
        None
    }

    /// Minimum remaining time across active timers, or None if none armed.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .flatten()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_expire() {
        let mut ts = TimerSet::new();
        ts.start(TimerId::T303, Duration::from_millis(0), TimerAction::AbortTran);
        assert!(ts.is_active(TimerId::T303));
        assert!(ts.is_expired(TimerId::T303));
        let (id, action) = ts.take_expired().unwrap();
        assert_eq!(id, TimerId::T303);
        assert_eq!(action, TimerAction::AbortTran);
        assert!(!ts.is_active(TimerId::T303));
        assert!(ts.take_expired().is_none());
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut ts = TimerSet::new();
        ts.start(TimerId::TR1M, Duration::from_millis(0), TimerAction::AbortTran);
        ts.start(
            TimerId::TR1M,
            Duration::from_secs(3600),
            TimerAction::State(0x42),
        );
        assert!(!ts.is_expired(TimerId::TR1M));
        assert!(ts.take_expired().is_none());
    }

    #[test]
    fn remaining_is_min() {
        let mut ts = TimerSet::new();
        assert!(ts.remaining().is_none());
        ts.start(TimerId::T301, Duration::from_secs(60), TimerAction::AbortTran);
        ts.start(TimerId::T308, Duration::from_secs(1), TimerAction::AbortTran);
        assert!(ts.remaining().unwrap() <= Duration::from_secs(1));
    }
}
