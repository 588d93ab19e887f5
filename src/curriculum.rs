use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::env::{PipeEnv, StepResult};
use crate::error::{EnvError, Result};
use crate::protocol::Command;
use crate::render::Observation;

/// Launch variable carrying the level a fresh emulator starts on.
pub const LEVEL_VAR: &str = "level";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumConfig {
    pub num_levels: usize,
    /// Most recent episodes averaged per level.
    pub average_over: usize,
    /// Average a level needs before the next one unlocks.
    pub passing_grade: f64,
    /// History kept per level; a level's first episode seeds this many zeros.
    pub min_tries_for_avg: usize,
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        Self {
            num_levels: 1,
            average_over: 10,
            passing_grade: 600.0,
            min_tries_for_avg: 5,
        }
    }
}

// =============================================================================
// Level Bookkeeping
// =============================================================================

/// Per-level score history (newest first) and lock state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub scores: Vec<VecDeque<f64>>,
    pub locked: Vec<bool>,
}

impl LevelProgress {
    /// Every level locked except the first.
    pub fn new(num_levels: usize) -> Self {
        let mut locked = vec![true; num_levels];
        if let Some(first) = locked.first_mut() {
            *first = false;
        }
        Self {
            scores: vec![VecDeque::new(); num_levels],
            locked,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.locked.len()
    }

    pub fn averages(&self, average_over: usize) -> Vec<f64> {
        self.scores
            .iter()
            .map(|history| {
                let count = history.len().min(average_over);
                if count == 0 {
                    return 0.0;
                }
                history.iter().take(count).sum::<f64>() / count as f64
            })
            .collect()
    }

    /// Walks from the top level down so a level unlocked in this pass cannot
    /// unlock the one above it until the next evaluation.
    pub fn unlock(&mut self, averages: &[f64], passing_grade: f64) -> Vec<usize> {
        let mut unlocked = Vec::new();
        for i in (0..self.num_levels().saturating_sub(1)).rev() {
            if self.locked[i + 1] && !self.locked[i] && averages[i] >= passing_grade {
                self.locked[i + 1] = false;
                unlocked.push(i + 1);
            }
        }
        unlocked
    }

    /// Unlocked level with the lowest average; ties go to the lowest index.
    pub fn next_level(&self, averages: &[f64]) -> usize {
        let mut best: Option<(usize, f64)> = None;
        for (i, &average) in averages.iter().enumerate() {
            if self.locked[i] {
                continue;
            }
            if best.is_none_or(|(_, lowest)| average < lowest) {
                best = Some((i, average));
            }
        }
        best.map_or(0, |(i, _)| i)
    }

    /// Opens a zeroed slot at the front of the level's history.
    pub fn start_episode(&mut self, level: usize, min_tries: usize) {
        let history = &mut self.scores[level];
        if history.is_empty() {
            history.extend(std::iter::repeat_n(0.0, min_tries.max(1)));
        } else {
            history.push_front(0.0);
            history.truncate(min_tries.max(1));
        }
    }

    /// Overwrites the open slot with the episode's final reward.
    pub fn record(&mut self, level: usize, reward: f64) {
        let history = &mut self.scores[level];
        match history.front_mut() {
            Some(slot) => *slot = reward,
            None => history.push_front(reward),
        }
    }
}

// =============================================================================
// Level Curriculum
// =============================================================================

/// Multi-level campaign on top of one [`PipeEnv`]. Weak levels get played
/// more, and a level opens once the one below it averages a passing grade.
pub struct LevelCurriculum {
    env: PipeEnv,
    config: CurriculumConfig,
    progress: LevelProgress,
    level: usize,
    find_new_level: bool,
    episode_open: bool,
}

impl LevelCurriculum {
    pub fn new(mut env: PipeEnv, config: CurriculumConfig) -> Result<Self> {
        if config.num_levels == 0 {
            return Err(EnvError::Configuration(
                "curriculum needs at least one level".to_string(),
            ));
        }
        env.supervisor_mut().set_launch_var(LEVEL_VAR, 0);
        let mut curriculum = Self {
            env,
            progress: LevelProgress::new(config.num_levels),
            config,
            level: 0,
            find_new_level: false,
            episode_open: false,
        };
        curriculum.unlock_levels();
        Ok(curriculum)
    }

    pub fn env(&self) -> &PipeEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut PipeEnv {
        &mut self.env
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn locked_levels(&self) -> &[bool] {
        &self.progress.locked
    }

    pub fn progress(&self) -> &LevelProgress {
        &self.progress
    }

    pub fn level_change_pending(&self) -> bool {
        self.find_new_level
    }

    /// Per-level moving averages, rounded to four decimals.
    pub fn get_scores(&self) -> Vec<f64> {
        self.progress
            .averages(self.config.average_over)
            .into_iter()
            .map(|avg| (avg * 10_000.0).round() / 10_000.0)
            .collect()
    }

    fn unlock_levels(&mut self) {
        let averages = self.get_scores();
        for level in self.progress.unlock(&averages, self.config.passing_grade) {
            info!(level, "level unlocked");
        }
    }

    pub fn next_level(&self) -> usize {
        self.progress.next_level(&self.get_scores())
    }

    /// Performed by the next `step`.
    pub fn request_level_change(&mut self) {
        self.find_new_level = true;
    }

    /// Switches to `target` when it is an unlocked level, otherwise to the
    /// weakest unlocked level, then starts a new episode there.
    pub fn change_level(&mut self, target: Option<usize>) -> Result<Observation> {
        self.find_new_level = false;
        self.level = match target {
            Some(t) if t < self.progress.num_levels() && !self.progress.locked[t] => t,
            _ => self.next_level(),
        };
        info!(level = self.level, scores = ?self.get_scores(), "changing level");
        self.env.send_command(&Command::ChangeLevel(self.level));
        self.env
            .supervisor_mut()
            .set_launch_var(LEVEL_VAR, self.level);
        self.reset()
    }

    /// Starts an episode on the current level, reusing the live emulator.
    /// Deferred while a level change is pending.
    pub fn reset(&mut self) -> Result<Observation> {
        if self.find_new_level {
            return Ok(self.env.observation());
        }
        let observation = self.env.restart_episode()?;
        self.progress
            .start_episode(self.level, self.config.min_tries_for_avg);
        self.episode_open = true;
        Ok(observation)
    }

    pub fn step(&mut self, action: usize) -> Result<StepResult> {
        if self.find_new_level {
            self.change_level(None)?;
        }
        let result = self.env.step(action)?;
        if result.done && self.episode_open {
            self.episode_open = false;
            self.progress.record(self.level, result.info.episode_reward);
            self.unlock_levels();
            self.find_new_level = true;
            info!(
                level = self.level,
                episode_reward = result.info.episode_reward,
                "episode finished"
            );
        }
        Ok(result)
    }

    pub fn seed(&mut self, seed: Option<u64>) -> Vec<u64> {
        self.env.seed(seed)
    }

    pub fn close(&mut self) {
        self.env.close();
        self.episode_open = false;
    }

    pub fn save_scores<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.progress)
            .map_err(|e| EnvError::Io(e.into()))
    }

    pub fn load_scores<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let progress: LevelProgress = serde_json::from_reader(reader).map_err(|e| {
            EnvError::Configuration(format!("invalid scores {}: {e}", path.display()))
        })?;
        if progress.num_levels() != self.progress.num_levels()
            || progress.scores.len() != progress.num_levels()
        {
            return Err(EnvError::Configuration(format!(
                "scores in {} cover {} levels, expected {}",
                path.display(),
                progress.num_levels(),
                self.progress.num_levels()
            )));
        }
        self.progress = progress;
        Ok(())
    }
}
