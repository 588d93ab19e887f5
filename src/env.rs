use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::buttons_for;
use crate::config::{Config, duration_ms};
use crate::error::Result;
use crate::launch_lock::LaunchLock;
use crate::protocol::Command;
use crate::render::{Observation, RenderMode};
use crate::reward::{RewardConfig, RewardEngine};
use crate::seeding;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};

// =============================================================================
// Environment Constants
// =============================================================================

/// Bounded wait with a growing poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// First sleep between polls; doubled each round up to `poll_max`.
    #[serde(with = "duration_ms")]
    pub poll_min: Duration,
    #[serde(with = "duration_ms")]
    pub poll_max: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(50),
            poll_min: Duration::from_millis(1),
            poll_max: Duration::from_millis(16),
        }
    }
}

impl WaitPolicy {
    /// Polls `ready` (given the elapsed time) until it returns true or the
    /// timeout passes. Returns whether it became ready.
    pub fn poll(&self, mut ready: impl FnMut(Duration) -> bool) -> bool {
        let start = Instant::now();
        let mut sleep = self.poll_min;
        loop {
            let elapsed = start.elapsed();
            if ready(elapsed) {
                return true;
            }
            if elapsed >= self.timeout {
                return false;
            }
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(self.poll_max.max(self.poll_min));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Wait for the first frame of a freshly launched emulator.
    pub first_frame_wait: WaitPolicy,
    /// A first-frame stall longer than this gets the listener reattached once.
    #[serde(with = "duration_ms")]
    pub listener_reattach_after: Duration,
    /// Wait for the emulator to acknowledge a command.
    pub ack_wait: WaitPolicy,
    /// Relaunches allowed before the session is given up.
    pub max_consecutive_resets: u32,
    /// Pause after a relaunch.
    #[serde(with = "duration_ms")]
    pub relaunch_backoff: Duration,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            first_frame_wait: WaitPolicy::default(),
            listener_reattach_after: Duration::from_secs(5),
            ack_wait: WaitPolicy::default(),
            max_consecutive_resets: 5,
            relaunch_backoff: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Step Results
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub telemetry: TelemetrySnapshot,
    pub episode_reward: f64,
    pub dead: bool,
    pub stuck: bool,
    /// The emulator stopped acknowledging commands and was killed.
    pub aborted_stall: bool,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

// =============================================================================
// Pipe Environment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Idle,
    Launching,
    AwaitingFirstFrame,
    Ready,
    AwaitingAck,
    Closed,
}

/// Lock-step control over a free-running emulator: every `step` sends one
/// command and blocks until the emulator reports a later frame.
pub struct PipeEnv {
    content_path: PathBuf,
    supervisor: ProcessSupervisor,
    telemetry: Arc<TelemetryStore>,
    rewards: RewardEngine,
    pub env_config: EnvConfig,
    state: EnvState,
    first_step: bool,
    curr_seed: u64,
    reward: f64,
    episode_reward: f64,
    #[cfg(feature = "viewer")]
    viewer: Option<crate::render::Viewer>,
}

impl PipeEnv {
    pub fn new(
        content_path: PathBuf,
        env_config: EnvConfig,
        reward_config: RewardConfig,
        supervisor_config: SupervisorConfig,
        launch_lock: Arc<dyn LaunchLock>,
    ) -> Self {
        Self {
            content_path,
            supervisor: ProcessSupervisor::new(supervisor_config, launch_lock),
            telemetry: Arc::new(TelemetryStore::new()),
            rewards: RewardEngine::new(reward_config),
            env_config,
            state: EnvState::Idle,
            first_step: false,
            curr_seed: seeding::episode_seed(None),
            reward: 0.0,
            episode_reward: 0.0,
            #[cfg(feature = "viewer")]
            viewer: None,
        }
    }

    pub fn from_config(content_path: PathBuf, config: &Config, launch_lock: Arc<dyn LaunchLock>) -> Self {
        Self::new(
            content_path,
            config.env.clone(),
            config.reward.clone(),
            config.supervisor.clone(),
            launch_lock,
        )
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    /// Content used by the next launch.
    pub fn set_content_path(&mut self, path: PathBuf) {
        self.content_path = path;
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.supervisor.is_live()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.supervisor.session().map(|s| s.id)
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn frame(&self) -> u64 {
        self.telemetry.frame()
    }

    pub fn last_reward(&self) -> f64 {
        self.reward
    }

    pub fn episode_reward(&self) -> f64 {
        self.episode_reward
    }

    pub fn observation(&self) -> Observation {
        self.telemetry.observation()
    }

    pub fn send_command(&self, command: &Command) -> bool {
        self.supervisor.send(&command.to_string())
    }

    /// Seed for the no-op sent at the start of each episode.
    pub fn seed(&mut self, seed: Option<u64>) -> Vec<u64> {
        self.curr_seed = seeding::episode_seed(seed);
        vec![self.curr_seed]
    }

    fn clear_episode(&mut self) {
        self.telemetry.clear();
        self.rewards.reset();
        self.reward = 0.0;
        self.episode_reward = 0.0;
    }

    /// Tears down any live session and launches a fresh one.
    pub fn reset(&mut self) -> Result<Observation> {
        if self.is_initialized() {
            self.close();
        }
        self.clear_episode();
        self.first_step = true;
        self.launch()?;
        // Rows painted while the emulator was starting belong to no step.
        self.telemetry.clear_screen();
        Ok(Observation::blank())
    }

    /// Starts a new episode on the live emulator, launching one only when no
    /// session is live.
    pub fn restart_episode(&mut self) -> Result<Observation> {
        self.reward = 0.0;
        self.episode_reward = 0.0;
        self.rewards.reset();
        self.first_step = true;
        if self.is_initialized() {
            self.telemetry.start_episode();
        } else {
            self.clear_episode();
            self.launch()?;
        }
        self.telemetry.clear_screen();
        Ok(Observation::blank())
    }

    fn launch(&mut self) -> Result<()> {
        self.state = EnvState::Launching;
        match self
            .supervisor
            .launch(&self.content_path, self.telemetry.clone())
        {
            Ok(()) => {
                self.state = EnvState::AwaitingFirstFrame;
                info!(session_id = ?self.session_id(), pid = ?self.supervisor.pid(), "episode launched");
                Ok(())
            }
            Err(e) => {
                self.state = EnvState::Idle;
                Err(e)
            }
        }
    }

    pub fn step(&mut self, action: usize) -> Result<StepResult> {
        if !self.is_initialized() {
            return Ok(self.terminal_step(false));
        }
        let buttons = buttons_for(action)?;

        if !self.await_first_frame() {
            return Ok(self.terminal_step(false));
        }

        let start_frame = self.telemetry.frame();
        if self.first_step {
            self.first_step = false;
            self.curr_seed = seeding::episode_seed(Some(self.curr_seed));
            self.send_command(&Command::Noop {
                frame: start_frame,
                seed: self.curr_seed,
            });
        }

        self.reward = 0.0;
        self.state = EnvState::AwaitingAck;
        self.send_command(&Command::Buttons {
            frame: start_frame,
            buttons,
        });

        if !self.await_ack(start_frame) {
            warn!(
                session_id = ?self.session_id(),
                frame = start_frame,
                "closing episode, emulator stopped acknowledging commands"
            );
            self.supervisor.abort();
            self.state = EnvState::Idle;
            return Ok(self.terminal_step(true));
        }
        self.state = EnvState::Ready;

        let (prev, cur) = self.telemetry.pair();
        let outcome = self
            .rewards
            .evaluate(prev.as_ref(), &cur, self.telemetry.is_finished());
        self.reward = outcome.reward;
        self.episode_reward += outcome.reward;
        let observation = self.observation();
        let info = StepInfo {
            telemetry: cur,
            episode_reward: self.episode_reward,
            dead: outcome.dead,
            stuck: outcome.stuck,
            aborted_stall: false,
        };
        self.telemetry.commit();

        Ok(StepResult {
            observation,
            reward: outcome.reward,
            done: outcome.done,
            info,
        })
    }

    /// Result for a step that could not be played: stale observation, no
    /// reward, episode over.
    fn terminal_step(&self, aborted_stall: bool) -> StepResult {
        StepResult {
            observation: self.observation(),
            reward: 0.0,
            done: true,
            info: StepInfo {
                telemetry: self.telemetry.current(),
                episode_reward: self.episode_reward,
                aborted_stall,
                ..StepInfo::default()
            },
        }
    }

    /// Blocks until the emulator reports its first frame, relaunching it when
    /// it does not. Returns `false` once the relaunch budget is spent and the
    /// session has been closed.
    fn await_first_frame(&mut self) -> bool {
        let mut resets = 0u32;
        loop {
            if self.is_initialized() && self.poll_first_frame() {
                self.state = EnvState::Ready;
                return true;
            }
            resets += 1;
            if resets > self.env_config.max_consecutive_resets {
                warn!(resets, "emulator never became ready, giving up");
                self.close();
                return false;
            }
            warn!(resets, pid = ?self.supervisor.pid(), "emulator not responding, relaunching");
            if let Err(e) = self.reset() {
                warn!("relaunch failed: {e}");
            }
            std::thread::sleep(self.env_config.relaunch_backoff);
        }
    }

    fn poll_first_frame(&self) -> bool {
        let Some(channel) = self.supervisor.channel() else {
            return false;
        };
        if self.telemetry.frame() != 0 {
            return true;
        }
        let reattach_after = self.env_config.listener_reattach_after;
        let mut reattached = false;
        self.env_config.first_frame_wait.poll(|elapsed| {
            channel.ensure_writer();
            if !reattached && elapsed >= reattach_after {
                reattached = true;
                channel.reattach_listener();
            }
            self.telemetry.frame() != 0
        })
    }

    fn await_ack(&self, start_frame: u64) -> bool {
        let acked = self
            .env_config
            .ack_wait
            .poll(|_| self.telemetry.frame() > start_frame || self.telemetry.is_finished());
        if acked {
            debug!(frame = self.telemetry.frame(), start_frame, "command acknowledged");
        }
        acked
    }

    /// Stops the emulator, removes the pipes and zeroes the episode counters.
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        self.supervisor.terminate();
        self.clear_episode();
        self.state = EnvState::Closed;
    }

    pub fn render(&mut self, mode: RenderMode) -> Result<Option<Observation>> {
        match mode {
            RenderMode::RgbArray => Ok(Some(self.observation())),
            RenderMode::Human => {
                self.show()?;
                Ok(None)
            }
        }
    }

    #[cfg(feature = "viewer")]
    fn show(&mut self) -> Result<()> {
        let observation = self.observation();
        if self.viewer.is_none() {
            self.viewer = Some(crate::render::Viewer::new("nes-pipe-env")?);
        }
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.show(&observation)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "viewer"))]
    fn show(&mut self) -> Result<()> {
        Ok(())
    }
}
