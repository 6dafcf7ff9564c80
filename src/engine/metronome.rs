//! MetronomeScheduler (spec.md §4.7): one lazy tick emitter per room.
//!
//! Grounded on the teacher's `clock::interval`-based background loops
//! (`sharify/websocket/instance.rs::init_spotify_data_loop`), generalized
//! from a data-refresh poller to a monotonic tick source whose period can be
//! rescheduled without retroactively shifting past ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::bus::SharedEventBus;
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::RoomId;
use crate::config::{MAX_BPM, MIN_BPM};

fn interval_for_bpm(bpm: u32) -> Duration {
    Duration::from_millis((60_000 / bpm.max(1)) as u64)
}

struct RunningMetronome {
    bpm_tx: watch::Sender<u32>,
    handle: JoinHandle<()>,
}

/// Owns the per-room tick tasks. One `MetronomeScheduler` instance is shared
/// process-wide; it tracks a handle per room so `set_bpm` can reschedule and
/// room destruction can cancel (spec.md §4.7 "Cancellation: on room
/// destruction").
#[derive(Default)]
pub struct MetronomeScheduler {
    running: RwLock<std::collections::HashMap<RoomId, RunningMetronome>>,
}

impl MetronomeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(
        &self,
        room_id: RoomId,
        initial_bpm: u32,
        bus: SharedEventBus,
        registry: Arc<RwLock<RoomRegistry>>,
    ) {
        let (bpm_tx, mut bpm_rx) = watch::channel(initial_bpm);

        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            let mut current_bpm = *bpm_rx.borrow();
            let mut ticker = tokio::time::interval(interval_for_bpm(current_bpm));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = bpm_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        current_bpm = *bpm_rx.borrow();
                        // Reschedule from the next boundary, never retroactively.
                        ticker = tokio::time::interval(interval_for_bpm(current_bpm));
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                    _ = ticker.tick() => {
                        tick += 1;
                        let timestamp_ms = {
                            let mut guard = registry.write().await;
                            let Some(room) = guard.get_room_mut(&room_id) else {
                                break;
                            };
                            let now = room
                                .created_at
                                .map(|c| c.elapsed().as_millis() as u64)
                                .unwrap_or(0);
                            room.metronome.last_tick_ms = Some(now);
                            now
                        };

                        bus.publish(
                            &super::room::Room::namespace_path(&room_id),
                            ServerEvent::MetronomeTick {
                                bpm: current_bpm,
                                tick,
                                timestamp_ms,
                            },
                        )
                        .await;
                    }
                }
            }
        });

        self.running
            .write()
            .await
            .insert(room_id, RunningMetronome { bpm_tx, handle });
    }

    /// Reschedules from the next tick boundary (spec.md §4.7 "never
    /// retroactively"). No-op if the BPM is out of range or the room has no
    /// running scheduler. Also persists `bpm` onto the `Room` aggregate so a
    /// snapshot taken between ticks reflects the current rate.
    pub async fn set_bpm(&self, registry: &Arc<RwLock<RoomRegistry>>, room_id: RoomId, bpm: u32) -> bool {
        if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            return false;
        }

        let sent = {
            let guard = self.running.read().await;
            match guard.get(&room_id) {
                Some(running) => running.bpm_tx.send(bpm).is_ok(),
                None => false,
            }
        };

        if sent {
            if let Some(room) = registry.write().await.get_room_mut(&room_id) {
                room.metronome.bpm = bpm;
            }
        }

        sent
    }

    pub async fn stop(&self, room_id: RoomId) {
        if let Some(running) = self.running.write().await.remove(&room_id) {
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_matches_60000_over_bpm() {
        assert_eq!(interval_for_bpm(120), Duration::from_millis(500));
        assert_eq!(interval_for_bpm(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn set_bpm_rejects_out_of_range() {
        let scheduler = MetronomeScheduler::new();
        let room_id = RoomId::new_v4();
        let bus = Arc::new(super::super::bus::EventBus::new());
        let registry = Arc::new(RwLock::new(RoomRegistry::new()));

        scheduler.start(room_id, 120, bus, Arc::clone(&registry)).await;

        assert!(!scheduler.set_bpm(&registry, room_id, 10).await);
        assert!(!scheduler.set_bpm(&registry, room_id, 400).await);
        assert!(scheduler.set_bpm(&registry, room_id, 90).await);

        scheduler.stop(room_id).await;
    }
}
