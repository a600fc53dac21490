use serde::{Deserialize, Serialize};

use super::challenge::{ChallengeReport, ChallengeState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub actions_performed: u64,
    pub attempt_failures: u64,
    pub retries: u64,
    pub challenges_detected: u64,
    pub challenges_resolved: u64,
    pub challenge_timeouts: u64,
    pub screenshots_captured: u64,
}

impl SessionMetrics {
    pub fn record_action(&mut self) {
        self.actions_performed = self.actions_performed.saturating_add(1);
    }

    /// `attempts` is the total number of invocations of one guarded operation.
    pub fn record_attempts(&mut self, attempts: u32, succeeded: bool) {
        let failures = if succeeded {
            attempts.saturating_sub(1)
        } else {
            attempts
        } as u64;
        self.attempt_failures = self.attempt_failures.saturating_add(failures);
        self.retries = self
            .retries
            .saturating_add(attempts.saturating_sub(1) as u64);
    }

    pub fn record_challenge(&mut self, report: &ChallengeReport) {
        if report.was_challenged() {
            self.challenges_detected = self.challenges_detected.saturating_add(1);
        }
        if report.final_state == ChallengeState::Resolved {
            self.challenges_resolved = self.challenges_resolved.saturating_add(1);
        }
    }

    pub fn record_challenge_timeout(&mut self) {
        self.challenges_detected = self.challenges_detected.saturating_add(1);
        self.challenge_timeouts = self.challenge_timeouts.saturating_add(1);
    }

    pub fn record_screenshot(&mut self) {
        self.screenshots_captured = self.screenshots_captured.saturating_add(1);
    }

    pub fn challenge_resolution_rate(&self) -> f64 {
        if self.challenges_detected == 0 {
            0.0
        } else {
            (self.challenges_resolved as f64 / self.challenges_detected as f64) * 100.0
        }
    }
}
