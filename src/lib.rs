pub mod action;
pub mod config;
pub mod curriculum;
pub mod env;
pub mod error;
pub mod eval;
pub mod launch_lock;
pub mod pipe;
pub mod protocol;
pub mod render;
pub mod reward;
pub mod seeding;
pub mod supervisor;
pub mod telemetry;

pub use action::{Action, Buttons, buttons_for};
pub use config::Config;
pub use curriculum::{CurriculumConfig, LevelCurriculum, LevelProgress};
pub use env::{EnvConfig, EnvState, PipeEnv, StepInfo, StepResult, WaitPolicy};
pub use error::{EnvError, Result};
pub use eval::{EvalStats, run_baseline, run_curriculum};
pub use launch_lock::{FileLaunchLock, LaunchLock, NoopLaunchLock, ProcessLaunchLock};
pub use protocol::{Command, Inbound};
pub use render::{Observation, RenderMode};
pub use reward::{RewardConfig, RewardEngine, StepOutcome};
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
pub use telemetry::{TelemetrySnapshot, TelemetryStore};
