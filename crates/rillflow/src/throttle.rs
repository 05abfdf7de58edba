//! Broker throttle window state machine.
//!
//! Tracks `(throttle_time, throttle_duration)` per topic entry. The
//! effective pause runs until `throttle_time + duration × multiplier`.
//! A fresh event with a larger window extends it; a smaller one never
//! shrinks it. The first observation after the window elapses zeroes the
//! state: *Idle → Throttled → Idle*.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Current phase of the throttle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    /// No active pause window.
    Idle,
    /// A pause window is in effect.
    Throttled,
}

#[derive(Debug, Default)]
struct ThrottleWindow {
    /// Steady time point of the most recent quota pause.
    throttle_time: Option<Instant>,
    /// Effective (multiplied) pause duration.
    throttle_duration: Duration,
}

/// Per-topic throttle control shared by the engine and the callback
/// bridge.
#[derive(Debug)]
pub struct ThrottleControl {
    auto: bool,
    multiplier: u32,
    window: Mutex<ThrottleWindow>,
}

impl ThrottleControl {
    /// Creates a control with the given auto-throttle flag and multiplier.
    #[must_use]
    pub fn new(auto: bool, multiplier: u32) -> Self {
        Self {
            auto,
            multiplier: multiplier.max(1),
            window: Mutex::new(ThrottleWindow::default()),
        }
    }

    /// Returns `true` if the engine honors pause windows.
    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Returns the configured multiplier.
    #[must_use]
    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Records a broker throttle notification.
    ///
    /// A zero duration ends the window immediately. A window that would
    /// end no later than the current one is ignored.
    pub fn on_throttle(&self, duration: Duration) {
        let now = Instant::now();
        let effective = duration * self.multiplier;
        let mut window = self.window.lock();

        if duration.is_zero() {
            *window = ThrottleWindow::default();
            return;
        }

        if let Some(start) = window.throttle_time {
            let current_until = start + window.throttle_duration;
            if now + effective <= current_until {
                return;
            }
        }
        window.throttle_time = Some(now);
        window.throttle_duration = effective;
    }

    /// Returns the remaining pause, zeroing the window once it elapsed.
    ///
    /// Callers invoke this before every handoff to the low-level client;
    /// the first call that observes the window elapsed resets the state
    /// to idle.
    #[must_use]
    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        let mut window = self.window.lock();
        let start = window.throttle_time?;
        let until = start + window.throttle_duration;
        if now >= until {
            *window = ThrottleWindow::default();
            None
        } else {
            Some(until - now)
        }
    }

    /// Returns the current phase without mutating the window.
    #[must_use]
    pub fn state(&self) -> ThrottleState {
        let window = self.window.lock();
        match window.throttle_time {
            Some(start) if Instant::now() < start + window.throttle_duration => {
                ThrottleState::Throttled
            }
            _ => ThrottleState::Idle,
        }
    }

    /// Returns the effective duration of the current window.
    #[must_use]
    pub fn throttle_duration(&self) -> Duration {
        self.window.lock().throttle_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_by_default() {
        let ctl = ThrottleControl::new(true, 1);
        assert_eq!(ctl.state(), ThrottleState::Idle);
        assert_eq!(ctl.pause_remaining(Instant::now()), None);
    }

    #[test]
    fn test_throttle_applies_multiplier() {
        let ctl = ThrottleControl::new(true, 2);
        ctl.on_throttle(Duration::from_millis(500));
        assert_eq!(ctl.throttle_duration(), Duration::from_millis(1000));
        assert_eq!(ctl.state(), ThrottleState::Throttled);

        let remaining = ctl.pause_remaining(Instant::now()).unwrap();
        assert!(remaining > Duration::from_millis(900));
        assert!(remaining <= Duration::from_millis(1000));
    }

    #[test]
    fn test_larger_window_extends_smaller_does_not_shrink() {
        let ctl = ThrottleControl::new(true, 1);
        ctl.on_throttle(Duration::from_secs(10));
        let before = ctl.pause_remaining(Instant::now()).unwrap();

        // A shorter window must not shrink the pause.
        ctl.on_throttle(Duration::from_millis(1));
        let after = ctl.pause_remaining(Instant::now()).unwrap();
        assert!(after >= before - Duration::from_millis(50));

        // A longer one extends it.
        ctl.on_throttle(Duration::from_secs(30));
        let extended = ctl.pause_remaining(Instant::now()).unwrap();
        assert!(extended > Duration::from_secs(20));
    }

    #[test]
    fn test_zero_duration_resets() {
        let ctl = ThrottleControl::new(true, 4);
        ctl.on_throttle(Duration::from_secs(5));
        assert_eq!(ctl.state(), ThrottleState::Throttled);

        ctl.on_throttle(Duration::ZERO);
        assert_eq!(ctl.state(), ThrottleState::Idle);
    }

    #[test]
    fn test_elapsed_window_zeroed_on_observation() {
        let ctl = ThrottleControl::new(true, 1);
        ctl.on_throttle(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(ctl.pause_remaining(Instant::now()), None);
        assert_eq!(ctl.throttle_duration(), Duration::ZERO);
        assert_eq!(ctl.state(), ThrottleState::Idle);
    }

    #[test]
    fn test_multiplier_floor_is_one() {
        let ctl = ThrottleControl::new(false, 0);
        assert_eq!(ctl.multiplier(), 1);
        assert!(!ctl.is_auto());
    }
}
