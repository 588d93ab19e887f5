use rand::Rng;
use tracing::info;

use crate::action::Action;
use crate::curriculum::LevelCurriculum;
use crate::env::{PipeEnv, StepResult};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalStats {
    pub avg_reward: f64,
    pub max_reward: f64,
    pub avg_steps: f64,
    pub episodes: usize,
    /// Episodes cut short because the emulator stopped responding.
    pub aborted: usize,
}

#[derive(Default)]
struct Tally {
    rewards: Vec<f64>,
    steps: u64,
    aborted: usize,
}

impl Tally {
    fn push(&mut self, reward: f64, steps: u64, aborted: bool) {
        self.rewards.push(reward);
        self.steps += steps;
        self.aborted += usize::from(aborted);
    }

    fn finish(self) -> EvalStats {
        let episodes = self.rewards.len();
        if episodes == 0 {
            return EvalStats::default();
        }
        let denom = episodes as f64;
        EvalStats {
            avg_reward: self.rewards.iter().sum::<f64>() / denom,
            max_reward: self.rewards.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            avg_steps: self.steps as f64 / denom,
            episodes,
            aborted: self.aborted,
        }
    }
}

/// Plays one episode with uniformly random actions. Returns the summed
/// reward, the step count and whether the episode ended in a stall.
fn random_episode<R: Rng>(
    rng: &mut R,
    max_steps: u64,
    mut step: impl FnMut(usize) -> Result<StepResult>,
) -> Result<(f64, u64, bool)> {
    let mut total_reward = 0.0;
    let mut steps = 0u64;
    loop {
        let result = step(rng.random_range(0..Action::COUNT))?;
        total_reward += result.reward;
        steps += 1;
        if result.done || steps >= max_steps {
            return Ok((total_reward, steps, result.info.aborted_stall));
        }
    }
}

/// Random-agent baseline on a single level.
pub fn run_baseline<R: Rng>(
    env: &mut PipeEnv,
    episodes: usize,
    max_steps: u64,
    rng: &mut R,
) -> Result<EvalStats> {
    let mut tally = Tally::default();
    for ep in 0..episodes {
        env.reset()?;
        let (reward, steps, aborted) = random_episode(rng, max_steps, |a| env.step(a))?;
        info!(episode = ep + 1, reward, steps, aborted, "baseline episode");
        tally.push(reward, steps, aborted);
    }
    env.close();
    Ok(tally.finish())
}

/// Random agent across a level campaign; `on_episode` sees the curriculum
/// after every episode.
pub fn run_curriculum<R: Rng>(
    curriculum: &mut LevelCurriculum,
    episodes: usize,
    max_steps: u64,
    rng: &mut R,
    mut on_episode: impl FnMut(usize, &LevelCurriculum),
) -> Result<EvalStats> {
    let mut tally = Tally::default();
    for ep in 0..episodes {
        curriculum.reset()?;
        let (reward, steps, aborted) =
            random_episode(rng, max_steps, |a| curriculum.step(a))?;
        tally.push(reward, steps, aborted);
        on_episode(ep, curriculum);
    }
    curriculum.close();
    Ok(tally.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::env::StepInfo;
    use crate::render::Observation;

    fn result(reward: f64, done: bool) -> StepResult {
        StepResult {
            observation: Observation::blank(),
            reward,
            done,
            info: StepInfo::default(),
        }
    }

    #[test]
    fn episode_stops_on_done() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut calls = 0;
        let (reward, steps, aborted) = random_episode(&mut rng, 100, |action| {
            assert!(action < Action::COUNT);
            calls += 1;
            Ok(result(1.0, calls == 4))
        })
        .unwrap();
        assert_eq!((reward, steps, aborted), (4.0, 4, false));
    }

    #[test]
    fn episode_is_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let (_, steps, _) = random_episode(&mut rng, 10, |_| Ok(result(0.0, false))).unwrap();
        assert_eq!(steps, 10);
    }

    #[test]
    fn stats_average_over_episodes() {
        let mut tally = Tally::default();
        tally.push(10.0, 5, false);
        tally.push(-2.0, 3, true);
        let stats = tally.finish();
        assert_eq!(stats.episodes, 2);
        assert_eq!(stats.avg_reward, 4.0);
        assert_eq!(stats.max_reward, 10.0);
        assert_eq!(stats.avg_steps, 4.0);
        assert_eq!(stats.aborted, 1);
    }

    #[test]
    fn no_episodes_gives_empty_stats() {
        assert_eq!(Tally::default().finish(), EvalStats::default());
    }
}
