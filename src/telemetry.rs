use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EnvError, Result};
use crate::protocol::Inbound;
use crate::render::Observation;

// =============================================================================
// Telemetry Snapshot
// =============================================================================

/// Game state read out by the emulator script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub frame: u64,
    pub distance: i64,
    pub score: i64,
    pub life: i64,
    pub time: i64,
    /// Game-specific fields, kept as the raw text the emulator sent.
    pub extra: BTreeMap<String, String>,
}

impl TelemetrySnapshot {
    /// Merges `key_value` fields into this snapshot. Fields not present in
    /// the message keep their previous value. A malformed message leaves the
    /// snapshot untouched.
    pub fn merge_fields(&mut self, frame: u64, fields: &[(String, String)]) -> Result<()> {
        let mut merged = self.clone();
        merged.frame = merged.frame.max(frame);
        for (key, value) in fields {
            let slot = match key.as_str() {
                "distance" => &mut merged.distance,
                "score" => &mut merged.score,
                "life" => &mut merged.life,
                "time" => &mut merged.time,
                _ => {
                    merged.extra.insert(key.clone(), value.clone());
                    continue;
                }
            };
            *slot = value
                .parse()
                .map_err(|_| EnvError::Protocol(format!("{key} is not an integer: {value:?}")))?;
        }
        *self = merged;
        Ok(())
    }
}

// =============================================================================
// Telemetry Store
// =============================================================================

/// Receives each complete inbound message from the pipe listener. An error
/// ends the listener.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &str) -> Result<()>;
}

#[derive(Default)]
struct Snapshots {
    current: TelemetrySnapshot,
    previous: Option<TelemetrySnapshot>,
    screen: Observation,
}

/// Handoff between the listener thread (writer) and the control thread
/// (reader). The frame counter and finished flag are atomics so the control
/// thread can poll them without taking the lock.
#[derive(Default)]
pub struct TelemetryStore {
    frame: AtomicU64,
    finished: AtomicBool,
    snapshots: Mutex<Snapshots>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshots> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn current(&self) -> TelemetrySnapshot {
        self.lock().current.clone()
    }

    pub fn previous(&self) -> Option<TelemetrySnapshot> {
        self.lock().previous.clone()
    }

    /// `(previous, current)` read under one lock.
    pub fn pair(&self) -> (Option<TelemetrySnapshot>, TelemetrySnapshot) {
        let guard = self.lock();
        (guard.previous.clone(), guard.current.clone())
    }

    pub fn observation(&self) -> Observation {
        self.lock().screen.clone()
    }

    /// Promotes `current` to `previous`. Called once per completed step,
    /// after the reward has been computed.
    pub fn commit(&self) {
        let mut guard = self.lock();
        guard.previous = Some(guard.current.clone());
    }

    /// Back to the state of a freshly launched session.
    pub fn clear(&self) {
        let mut guard = self.lock();
        *guard = Snapshots::default();
        self.frame.store(0, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    pub fn clear_screen(&self) {
        self.lock().screen = Observation::blank();
    }

    /// Starts a new episode on a live session. The frame counter keeps
    /// running; only the episode-scoped state is dropped.
    pub fn start_episode(&self) {
        self.lock().previous = None;
        self.finished.store(false, Ordering::Release);
    }

    pub fn apply(&self, message: Inbound) -> Result<()> {
        match message {
            Inbound::Ready { frame } => {
                self.frame.fetch_max(frame, Ordering::AcqRel);
            }
            Inbound::Data { frame, fields } => {
                // Telemetry lands before the frame counter moves so a poller
                // that sees the new frame also sees its data.
                self.lock().current.merge_fields(frame, &fields)?;
            }
            Inbound::Screen { row, codes, .. } => {
                self.lock().screen.apply_row(row, &codes);
            }
            Inbound::Done { frame } => {
                debug!(frame, "episode finished by emulator");
                self.finished.store(true, Ordering::Release);
            }
            Inbound::Reset { frame } => {
                debug!(frame, "emulator restarted level");
                self.finished.store(false, Ordering::Release);
            }
            Inbound::Exit => {}
        }
        Ok(())
    }
}

impl MessageHandler for TelemetryStore {
    fn handle(&self, message: &str) -> Result<()> {
        self.apply(Inbound::parse(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_then_ready_updates_snapshot_and_frame() {
        let store = TelemetryStore::new();
        store
            .handle("data_4#distance_56|score_100|life_3|time_390|world_1")
            .unwrap();
        assert_eq!(store.frame(), 0);
        store.handle("ready_4").unwrap();
        assert_eq!(store.frame(), 4);

        let cur = store.current();
        assert_eq!(cur.frame, 4);
        assert_eq!(cur.distance, 56);
        assert_eq!(cur.score, 100);
        assert_eq!(cur.life, 3);
        assert_eq!(cur.time, 390);
        assert_eq!(cur.extra.get("world").map(String::as_str), Some("1"));
    }

    #[test]
    fn frame_never_moves_backwards() {
        let store = TelemetryStore::new();
        store.handle("ready_10").unwrap();
        store.handle("ready_3").unwrap();
        assert_eq!(store.frame(), 10);
    }

    #[test]
    fn commit_promotes_current() {
        let store = TelemetryStore::new();
        assert!(store.previous().is_none());
        store.handle("data_1#distance_40").unwrap();
        store.commit();
        store.handle("data_2#distance_45").unwrap();
        let (prev, cur) = store.pair();
        assert_eq!(prev.unwrap().distance, 40);
        assert_eq!(cur.distance, 45);
    }

    #[test]
    fn done_and_reset_toggle_finished() {
        let store = TelemetryStore::new();
        store.handle("done_5").unwrap();
        assert!(store.is_finished());
        store.handle("reset_6").unwrap();
        assert!(!store.is_finished());
        store.handle("done_7").unwrap();
        store.clear();
        assert!(!store.is_finished());
        assert_eq!(store.frame(), 0);
    }

    #[test]
    fn non_integer_required_field_is_a_protocol_error() {
        let store = TelemetryStore::new();
        let err = store.handle("data_1#score_lots").unwrap_err();
        assert!(matches!(err, EnvError::Protocol(_)));
    }

    #[test]
    fn malformed_data_leaves_snapshot_untouched() {
        let store = TelemetryStore::new();
        store
            .handle("data_1#distance_40|score_0|life_3|time_400")
            .unwrap();
        let before = store.current();
        assert!(
            store
                .handle("data_2#distance_50|world_2|life_x|time_399")
                .is_err()
        );
        assert_eq!(store.current(), before);
    }

    #[test]
    fn screen_rows_reach_the_observation() {
        let store = TelemetryStore::new();
        store.handle("screen_1#0|21").unwrap();
        assert_eq!(store.observation().pixel(0, 0), (60, 188, 252));
    }
}
