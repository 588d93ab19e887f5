// =============================================================================
// nes-pipe-env: lock-step control of an NES emulator over named pipes
// =============================================================================
// Run:
//   cargo run --release -- baseline   --rom smb.nes --lua scripts/mario.lua
//   cargo run --release -- curriculum --rom smb.nes --lua scripts/mario.lua --levels 32
//   cargo run --release -- script     --lua scripts/mario.lua --level 4

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;

use nes_pipe_env::curriculum::LEVEL_VAR;
use nes_pipe_env::{
    Config, EvalStats, FileLaunchLock, LevelCurriculum, PipeEnv, ProcessSupervisor, run_baseline,
    run_curriculum, seeding,
};

// =============================================================================
// Section 1: Configuration
// =============================================================================

#[derive(Args)]
struct CommonArgs {
    /// JSON file with any subset of the tunables
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emulator binary (defaults to fceux on the search path)
    #[arg(long)]
    emulator: Option<PathBuf>,
    /// Extension scripts run by the startup script, in order
    #[arg(long)]
    lua: Vec<PathBuf>,
}

impl CommonArgs {
    fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(emulator) = &self.emulator {
            config.supervisor.emulator = Some(emulator.clone());
        }
        if !self.lua.is_empty() {
            config.supervisor.extension_scripts = self.lua.clone();
        }
        Ok(config)
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    StdRng::seed_from_u64(seed.unwrap_or_else(seeding::create_seed))
}

fn print_stats(label: &str, stats: &EvalStats) {
    eprintln!(
        "\n{label}: episodes={}, mean={:.1}, max={:.1}, steps/ep={:.1}, aborted={}",
        stats.episodes, stats.avg_reward, stats.max_reward, stats.avg_steps, stats.aborted
    );
}

// =============================================================================
// Section 2: Random Baseline
// =============================================================================

fn baseline(args: &BaselineArgs) -> Result<()> {
    eprintln!("Running random agent baseline...");
    let config = args.common.load()?;
    let mut env = PipeEnv::from_config(args.rom.clone(), &config, FileLaunchLock::shared());
    let applied = env.seed(args.seed);
    tracing::info!(seed = ?applied, "seeded environment");

    let mut rng = rng_for(args.seed);
    let stats = run_baseline(&mut env, args.episodes, args.max_steps, &mut rng)?;
    print_stats("Baseline", &stats);
    Ok(())
}

// =============================================================================
// Section 3: Level Curriculum
// =============================================================================

fn curriculum(args: &CurriculumArgs) -> Result<()> {
    let mut config = args.common.load()?;
    if let Some(levels) = args.levels {
        config.curriculum.num_levels = levels;
    }
    let env = PipeEnv::from_config(args.rom.clone(), &config, FileLaunchLock::shared());
    let mut curriculum = LevelCurriculum::new(env, config.curriculum.clone())?;
    if let Some(path) = args.scores.as_ref().filter(|p| p.exists()) {
        curriculum
            .load_scores(path)
            .with_context(|| format!("loading scores {}", path.display()))?;
    }
    curriculum.seed(args.seed);

    let mut rng = rng_for(args.seed);
    let stats = run_curriculum(
        &mut curriculum,
        args.episodes,
        args.max_steps,
        &mut rng,
        |ep, c| {
            eprintln!(
                "Episode {}: level={}, scores={:?}, locked={:?}",
                ep + 1,
                c.level(),
                c.get_scores(),
                c.locked_levels()
            );
        },
    )?;
    print_stats("Curriculum", &stats);

    if let Some(path) = &args.scores {
        curriculum
            .save_scores(path)
            .with_context(|| format!("saving scores {}", path.display()))?;
        eprintln!("Scores saved to {}", path.display());
    }
    Ok(())
}

// =============================================================================
// Section 4: Startup Script Preview
// =============================================================================

fn script(args: &ScriptArgs) -> Result<()> {
    let config = args.common.load()?;
    let mut supervisor = ProcessSupervisor::new(config.supervisor, FileLaunchLock::shared());
    if let Some(level) = args.level {
        supervisor.set_launch_var(LEVEL_VAR, level);
    }
    print!("{}", supervisor.preview_script(args.session_id));
    Ok(())
}

// =============================================================================
// Section 5: CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "nes-pipe-env", about = "NES emulator environment over named pipes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Random agent on a single level
    Baseline(BaselineArgs),
    /// Random agent across a level campaign
    Curriculum(CurriculumArgs),
    /// Print the startup script a session would be launched with
    Script(ScriptArgs),
}

#[derive(Parser)]
struct BaselineArgs {
    #[arg(long)]
    rom: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value = "10")]
    episodes: usize,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser)]
struct CurriculumArgs {
    #[arg(long)]
    rom: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
    /// Overrides `curriculum.num_levels` from the config
    #[arg(long)]
    levels: Option<usize>,
    #[arg(long, default_value = "20")]
    episodes: usize,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
    #[arg(long)]
    seed: Option<u64>,
    /// Score history loaded at start (if present) and saved at the end
    #[arg(long)]
    scores: Option<PathBuf>,
}

#[derive(Parser)]
struct ScriptArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value = "0")]
    session_id: u32,
    #[arg(long)]
    level: Option<usize>,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Baseline(args) => baseline(args),
        Commands::Curriculum(args) => curriculum(args),
        Commands::Script(args) => script(args),
    }
}
