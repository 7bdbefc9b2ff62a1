use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::config::LeaderTimingConfig;
use crate::constants::SLOT_TIME_MS;

/// Timing snapshot for the target validator: the current slot height and
/// the validator's upcoming leader slots (absolute, ascending).
#[derive(Debug, Clone)]
pub struct LeaderSchedule {
    pub current_slot: u64,
    pub leader_slots: Vec<u64>,
}

/// Source of the target validator's schedule. External; mocked in tests.
#[async_trait]
pub trait LeaderSource: Send + Sync {
    async fn schedule(&self) -> Result<LeaderSchedule>;
}

/// Delay before sending so the transaction arrives `preflight_ms` ahead of
/// the validator's next leader window. Zero when the window is already open
/// or no schedule is known; never more than `max_hold_ms`.
pub fn compute_hold_ms(schedule: &LeaderSchedule, timing: &LeaderTimingConfig) -> u64 {
    if !timing.enabled {
        return 0;
    }

    // First leader slot whose window has not already closed.
    let Some(next_leader) = schedule
        .leader_slots
        .iter()
        .copied()
        .find(|&slot| slot + timing.window_slots > schedule.current_slot)
    else {
        return 0;
    };

    if schedule.current_slot >= next_leader {
        return 0;
    }

    let ms_until_window = next_leader.saturating_sub(schedule.current_slot) * SLOT_TIME_MS;
    let hold = ms_until_window.saturating_sub(timing.preflight_ms);
    let clamped = hold.min(timing.max_hold_ms);
    if clamped > 0 {
        debug!(next_leader, hold_ms = clamped, "holding send for leader window");
    }
    clamped
}
