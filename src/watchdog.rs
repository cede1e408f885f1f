// Command watchdog
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. if the arm planner crashes and stops sending commands, the controller would
// otherwise keep executing the last move

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    /// A command arrived within the timeout
    Active,
    /// Starved: motors are forced to zero speed every tick
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CommandWatchdog {
    last_command_at: Instant,
    timeout: Duration,
    state: WatchdogState,
}

impl CommandWatchdog {
    /// Start the clock at controller startup
    pub fn new(timeout: Duration, started_at: Instant) -> Self {
        Self {
            last_command_at: started_at,
            timeout,
            state: WatchdogState::Active,
        }
    }

    /// Record an accepted command
    pub fn on_command(&mut self, at: Instant) {
        if self.state == WatchdogState::Stopped {
            info!("Command received, watchdog re-armed");
        }
        // commands may be timestamped by the sender slightly out of order
        self.last_command_at = self.last_command_at.max(at);
        self.state = WatchdogState::Active;
    }

    /// Evaluate on every tick. Returns Stopped on every tick while starved,
    /// so the caller re-sends the stop each time.
    pub fn check(&mut self, now: Instant) -> WatchdogState {
        let silence = now.saturating_duration_since(self.last_command_at);
        if silence > self.timeout {
            if self.state == WatchdogState::Active {
                warn!(
                    "No command for {:?} (timeout {:?}), stopping motors",
                    silence, self.timeout
                );
            }
            self.state = WatchdogState::Stopped;
        }
        self.state
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_command_at(&self) -> Instant {
        self.last_command_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_active_within_timeout() {
        let t0 = Instant::now();
        let mut watchdog = CommandWatchdog::new(TIMEOUT, t0);
        assert_eq!(watchdog.check(t0 + Duration::from_millis(500)), WatchdogState::Active);
        // exactly at the deadline is not yet silence
        assert_eq!(watchdog.check(t0 + TIMEOUT), WatchdogState::Active);
    }

    #[test]
    fn test_stops_after_silence_and_stays_stopped() {
        for timeout_ms in [100u64, 250, 1000, 5000] {
            let timeout = Duration::from_millis(timeout_ms);
            let t0 = Instant::now();
            let mut watchdog = CommandWatchdog::new(timeout, t0);
            watchdog.on_command(t0);

            for tick in 1..=20u32 {
                let now = t0 + timeout + Duration::from_millis(1) + Duration::from_millis(100) * tick;
                assert_eq!(watchdog.check(now), WatchdogState::Stopped);
            }
        }
    }

    #[test]
    fn test_new_command_reactivates() {
        let t0 = Instant::now();
        let mut watchdog = CommandWatchdog::new(TIMEOUT, t0);
        let starved = t0 + Duration::from_secs(2);
        assert_eq!(watchdog.check(starved), WatchdogState::Stopped);

        watchdog.on_command(starved);
        assert_eq!(watchdog.state(), WatchdogState::Active);
        assert_eq!(watchdog.check(starved + Duration::from_millis(100)), WatchdogState::Active);
    }

    #[test]
    fn test_starts_starving_from_startup() {
        let t0 = Instant::now();
        let mut watchdog = CommandWatchdog::new(TIMEOUT, t0);
        assert_eq!(
            watchdog.check(t0 + Duration::from_millis(1001)),
            WatchdogState::Stopped
        );
    }

    #[test]
    fn test_older_command_does_not_rewind_clock() {
        let t0 = Instant::now();
        let mut watchdog = CommandWatchdog::new(TIMEOUT, t0);
        watchdog.on_command(t0 + Duration::from_millis(800));
        watchdog.on_command(t0 + Duration::from_millis(200));
        assert_eq!(watchdog.last_command_at(), t0 + Duration::from_millis(800));
    }
}
