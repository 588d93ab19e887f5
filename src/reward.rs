use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetrySnapshot;

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Subtracted every step so standing still costs something.
    pub movement_penalty: f64,
    /// Replaces the step reward when a finished episode ends in death or
    /// getting stuck.
    pub death_penalty: f64,
    /// Distance the player starts a level at.
    pub distance_start: i64,
    /// How long, in the emulator's own `time` units, the max distance may
    /// stay unchanged before the player counts as stuck.
    pub stuck_duration: i64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            movement_penalty: 1.0,
            death_penalty: -2.0,
            distance_start: 40,
            stuck_duration: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepOutcome {
    pub reward: f64,
    pub done: bool,
    pub dead: bool,
    pub stuck: bool,
}

/// Reward and termination from consecutive telemetry snapshots. The only
/// state kept across steps is the max-distance watermark for stuck detection.
#[derive(Debug, Clone, Default)]
pub struct RewardEngine {
    pub config: RewardConfig,
    max_distance: i64,
    max_distance_time: i64,
}

impl RewardEngine {
    pub fn new(config: RewardConfig) -> Self {
        Self {
            config,
            max_distance: 0,
            max_distance_time: 0,
        }
    }

    /// Forgets the watermark; called at the start of every episode.
    pub fn reset(&mut self) {
        self.max_distance = 0;
        self.max_distance_time = 0;
    }

    pub fn watermark(&self) -> (i64, i64) {
        (self.max_distance, self.max_distance_time)
    }

    /// Distance plus score progress, minus the movement penalty.
    pub fn progress_reward(&self, prev: Option<&TelemetrySnapshot>, cur: &TelemetrySnapshot) -> f64 {
        let prev_distance = prev.map_or(self.config.distance_start, |p| p.distance);
        let prev_score = prev.map_or(0, |p| p.score);
        (cur.distance - prev_distance + cur.score - prev_score) as f64 - self.config.movement_penalty
    }

    pub fn is_dead(prev: Option<&TelemetrySnapshot>, cur: &TelemetrySnapshot) -> bool {
        prev.map_or(0, |p| p.life) > cur.life
    }

    /// Advances the watermark when the max distance improves, otherwise
    /// compares the time since the last improvement with the threshold.
    pub fn is_stuck(&mut self, cur: &TelemetrySnapshot) -> bool {
        if cur.distance > self.max_distance {
            self.max_distance = cur.distance;
            self.max_distance_time = cur.time;
            return false;
        }
        // Game timers may count down, so only the gap matters.
        (cur.time - self.max_distance_time).abs() >= self.config.stuck_duration
    }

    /// Scores one completed step. `finished` is the emulator's own episode
    /// end signal.
    pub fn evaluate(
        &mut self,
        prev: Option<&TelemetrySnapshot>,
        cur: &TelemetrySnapshot,
        finished: bool,
    ) -> StepOutcome {
        let mut reward = self.progress_reward(prev, cur);
        let dead = Self::is_dead(prev, cur);
        let stuck = self.is_stuck(cur);
        let done = finished || stuck;
        if done && (dead || stuck) {
            reward = self.config.death_penalty;
        }
        StepOutcome {
            reward,
            done,
            dead,
            stuck,
        }
    }
}
