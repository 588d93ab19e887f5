//! End-to-end runs against a shell script standing in for the emulator. It
//! reads its pipe names from the generated startup script, speaks the
//! telemetry protocol and advances one frame per command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nes_pipe_env::{
    CurriculumConfig, EnvConfig, EnvState, LevelCurriculum, NoopLaunchLock, PipeEnv,
    RewardConfig, SupervisorConfig, WaitPolicy,
};

/// Pipe locations read back from the startup script.
const PIPE_NAMES: &str = r#"
script="$2"
name=$(sed -n 's/^pipe_name = "\(.*\)";$/\1/p' "$script")
prefix=$(sed -n 's/^pipe_prefix = "\(.*\)";$/\1/p' "$script")
inbound="$prefix-in.$name"
"#;

const PREAMBLE: &str = r#"
exec 3>"$inbound"
exec 4<"$prefix-out.$name"
frame=1
distance=40
life=3
time=400
emit() {
    printf 'data_%d#distance_%d|score_0|life_%d|time_%d!\n' "$frame" "$distance" "$life" "$time" >&3
    printf 'ready_%d!\n' "$frame" >&3
}
"#;

/// Moves right two units per command and loses a life on the third one,
/// which also ends the episode.
const PLAYS_ONE_LIFE: &str = r#"
emit
steps=0
while read -r line <&4; do
    case "$line" in
        exit) break ;;
        changelevel*) printf '%s\n' "$line" >> "$prefix.levels" ;;
        commands_*)
            steps=$((steps + 1))
            frame=$((frame + 1))
            distance=$((distance + 2))
            time=$((time - 1))
            if [ "$steps" -eq 3 ]; then
                life=$((life - 1))
                printf 'data_%d#distance_%d|score_0|life_%d|time_%d!\n' "$frame" "$distance" "$life" "$time" >&3
                printf 'done_%d!\n' "$frame" >&3
                printf 'ready_%d!\n' "$frame" >&3
            else
                emit
            fi
            ;;
    esac
done
"#;

/// Reports its first frame, then never acknowledges anything.
const IGNORES_COMMANDS: &str = r#"
emit
while read -r line <&4; do
    [ "$line" = exit ] && break
done
"#;

/// Paints a screen row while still starting up, then reports frames.
const PAINTS_WHILE_STARTING: &str = r#"
exec 3>"$inbound"
printf 'screen_0#0|2121!\n' >&3
exec 4<"$prefix-out.$name"
printf 'ready_1!\n' >&3
while read -r line <&4; do
    [ "$line" = exit ] && break
done
"#;

/// Drops its telemetry pipe right after attaching, so the listener sees
/// end-of-file and exits. Once a new listener has recreated the pipe it
/// reconnects and plays normally.
const DROPS_TELEMETRY_PIPE: &str = r#"
exec 3>"$inbound"
exec 3>&-
exec 4<"$prefix-out.$name"
sleep 0.2
while [ ! -p "$inbound" ]; do
    sleep 0.05
done
exec 3>"$inbound"
frame=1
emit() {
    printf 'data_%d#distance_%d|score_0|life_3|time_400!\n' "$frame" "$((38 + 2 * frame))" >&3
    printf 'ready_%d!\n' "$frame" >&3
}
emit
while read -r line <&4; do
    case "$line" in
        exit) break ;;
        commands_*)
            frame=$((frame + 1))
            emit
            ;;
    esac
done
"#;

/// Attaches both pipes but never reports a frame.
const NEVER_READY: &str = r#"
while read -r line <&4; do
    [ "$line" = exit ] && break
done
"#;

struct Fixture {
    dir: tempfile::TempDir,
    rom: PathBuf,
    supervisor: SupervisorConfig,
}

fn fixture(behaviour: &str) -> Fixture {
    standalone_fixture(&format!("{PREAMBLE}{behaviour}"))
}

/// Emulator that opens its pipes itself instead of through the preamble.
fn standalone_fixture(body: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let rom = dir.path().join("game.nes");
    std::fs::write(&rom, b"NES\x1a").unwrap();
    let emulator = dir.path().join("fake-emulator.sh");
    std::fs::write(&emulator, format!("{PIPE_NAMES}{body}")).unwrap();
    let supervisor = SupervisorConfig {
        emulator: Some(PathBuf::from("/bin/sh")),
        emulator_args: vec![emulator.display().to_string()],
        temp_dir: dir.path().to_path_buf(),
        startup_grace: Duration::from_millis(300),
        script_removal_grace: Duration::from_millis(500),
        exit_grace: Duration::from_millis(20),
        ..SupervisorConfig::default()
    };
    Fixture {
        dir,
        rom,
        supervisor,
    }
}

fn quick_wait(timeout_ms: u64) -> WaitPolicy {
    WaitPolicy {
        timeout: Duration::from_millis(timeout_ms),
        ..WaitPolicy::default()
    }
}

fn env_for(fixture: &Fixture, env_config: EnvConfig) -> PipeEnv {
    PipeEnv::new(
        fixture.rom.clone(),
        env_config,
        RewardConfig::default(),
        fixture.supervisor.clone(),
        Arc::new(NoopLaunchLock),
    )
}

fn fifos_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("nes-fifo-"))
        })
        .collect()
}

#[test]
fn episode_runs_until_death() {
    let fixture = fixture(PLAYS_ONE_LIFE);
    let mut env = env_for(&fixture, EnvConfig::default());

    let observation = env.reset().unwrap();
    assert!(observation.is_blank());
    assert!(env.is_initialized());
    assert_eq!(fifos_in(fixture.dir.path()).len(), 2);

    let first = env.step(7).unwrap();
    assert_eq!(first.reward, 1.0);
    assert!(!first.done);
    assert_eq!(first.info.telemetry.distance, 42);
    assert_eq!(env.frame(), 2);

    let second = env.step(1).unwrap();
    assert_eq!(second.reward, 1.0);
    assert!(!second.done);

    let last = env.step(0).unwrap();
    assert!(last.done);
    assert!(last.info.dead);
    assert_eq!(last.reward, -2.0);
    assert_eq!(env.episode_reward(), 0.0);

    env.close();
    assert_eq!(env.state(), EnvState::Closed);
    assert!(!env.is_initialized());
    assert!(fifos_in(fixture.dir.path()).is_empty());
}

#[test]
fn reset_starts_a_fresh_session() {
    let fixture = fixture(PLAYS_ONE_LIFE);
    let mut env = env_for(&fixture, EnvConfig::default());

    env.reset().unwrap();
    let first_session = env.session_id();
    env.step(7).unwrap();

    env.reset().unwrap();
    assert_ne!(env.session_id(), first_session);
    assert_eq!(env.episode_reward(), 0.0);
    let step = env.step(7).unwrap();
    assert_eq!(step.reward, 1.0);

    env.close();
    assert!(fifos_in(fixture.dir.path()).is_empty());
}

#[test]
fn reset_observation_ignores_rows_painted_during_startup() {
    let fixture = standalone_fixture(PAINTS_WHILE_STARTING);
    let mut env = env_for(&fixture, EnvConfig::default());

    // The row is sent before the emulator attaches its command pipe, which
    // only happens at the end of the launch.
    let observation = env.reset().unwrap();
    assert!(observation.is_blank());
    assert!(env.observation().is_blank());

    env.close();
}

#[test]
fn dropped_telemetry_pipe_recovers_through_a_new_listener() {
    let fixture = standalone_fixture(DROPS_TELEMETRY_PIPE);
    let mut env = env_for(
        &fixture,
        EnvConfig {
            first_frame_wait: quick_wait(5_000),
            listener_reattach_after: Duration::from_millis(100),
            max_consecutive_resets: 0,
            ..EnvConfig::default()
        },
    );

    env.reset().unwrap();
    let session = env.session_id();

    let step = env.step(7).unwrap();
    assert!(!step.done);
    assert_eq!(step.reward, 1.0);
    assert_eq!(step.info.telemetry.distance, 42);
    assert_eq!(env.session_id(), session);
    assert!(env.supervisor().channel().unwrap().listener_alive());

    env.close();
    assert!(fifos_in(fixture.dir.path()).is_empty());
}

#[test]
fn stalled_emulator_aborts_the_episode() {
    let fixture = fixture(IGNORES_COMMANDS);
    let mut env = env_for(
        &fixture,
        EnvConfig {
            ack_wait: quick_wait(300),
            ..EnvConfig::default()
        },
    );

    env.reset().unwrap();
    let stalled = env.step(3).unwrap();
    assert!(stalled.done);
    assert!(stalled.info.aborted_stall);
    assert_eq!(stalled.reward, 0.0);
    assert!(!env.is_initialized());

    let after = env.step(3).unwrap();
    assert!(after.done);
    assert!(!after.info.aborted_stall);
    assert!(fifos_in(fixture.dir.path()).is_empty());
}

#[test]
fn silent_emulator_is_given_up_after_relaunches() {
    let fixture = fixture(NEVER_READY);
    let mut env = env_for(
        &fixture,
        EnvConfig {
            first_frame_wait: quick_wait(200),
            listener_reattach_after: Duration::from_millis(100),
            max_consecutive_resets: 1,
            relaunch_backoff: Duration::ZERO,
            ..EnvConfig::default()
        },
    );

    env.reset().unwrap();
    let result = env.step(0).unwrap();
    assert!(result.done);
    assert_eq!(result.reward, 0.0);
    assert_eq!(env.state(), EnvState::Closed);
    assert!(!env.is_initialized());
    assert!(fifos_in(fixture.dir.path()).is_empty());
}

#[test]
fn curriculum_records_episode_and_reuses_the_emulator() {
    let fixture = fixture(PLAYS_ONE_LIFE);
    let env = env_for(&fixture, EnvConfig::default());
    let mut curriculum = LevelCurriculum::new(
        env,
        CurriculumConfig {
            num_levels: 2,
            ..CurriculumConfig::default()
        },
    )
    .unwrap();

    curriculum.reset().unwrap();
    let session = curriculum.env().session_id();
    assert!(session.is_some());

    let mut done = false;
    for _ in 0..3 {
        done = curriculum.step(7).unwrap().done;
    }
    assert!(done);
    assert!(curriculum.level_change_pending());
    assert_eq!(curriculum.progress().scores[0].len(), 5);
    assert_eq!(curriculum.get_scores(), vec![0.0, 0.0]);
    assert_eq!(curriculum.locked_levels(), &[false, true]);

    // The pending change happens inside the next step, on the same emulator.
    let next = curriculum.step(7).unwrap();
    assert!(!next.done);
    assert!(!curriculum.level_change_pending());
    assert_eq!(curriculum.level(), 0);
    assert_eq!(curriculum.env().session_id(), session);

    curriculum.close();
    let levels = std::fs::read_to_string(fixture.dir.path().join("nes-fifo.levels")).unwrap();
    assert_eq!(levels.trim(), "changelevel#0");
}
