//! Radio frame clock
//!
//! Tracks the transceiver's frame number from periodic clock indications.
//! The clock extrapolates between indications using the host monotonic
//! clock, so reads never go backwards within one base period.

use crate::types::{fn_delta, Time, FRAME_MICROSECONDS, HYPERFRAME};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, warn};

struct ClockBase {
    base_fn: i64,
    base_at: Instant,
    last_fn: Option<i32>,
}

/// The NodeB frame-number clock.
pub struct Clock {
    state: Mutex<ClockBase>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock {
    pub fn new(base_fn: i32) -> Self {
        Clock {
            state: Mutex::new(ClockBase {
                base_fn: base_fn as i64,
                base_at: Instant::now(),
                last_fn: None,
            }),
        }
    }

    /// Re-base the clock from a transceiver clock indication.
    pub fn set_fn(&self, new_fn: u32) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let old = Self::fn_at(&state, now);
        state.base_fn = new_fn as i64;
        state.base_at = now;
        let diff = fn_delta(old, new_fn as i32 % HYPERFRAME);
        if diff.abs() > 1 {
            warn!(old_fn = old, new_fn, diff, "clock indication moved the frame clock");
        }
    }

    fn fn_at(state: &ClockBase, now: Instant) -> i32 {
        let elapsed_us = now.duration_since(state.base_at).as_micros() as i64;
        let frames = elapsed_us / FRAME_MICROSECONDS as i64;
        ((state.base_fn + frames) % HYPERFRAME as i64) as i32
    }

    /// Current frame number. If `fraction_us` is given it receives the
    /// elapsed microseconds into the current frame.
    pub fn fnr_with_fraction(&self, fraction_us: Option<&mut u32>) -> i32 {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let elapsed_us = now.duration_since(state.base_at).as_micros() as i64;
        let current =
            ((state.base_fn + elapsed_us / FRAME_MICROSECONDS as i64) % HYPERFRAME as i64) as i32;
        if let Some(frac) = fraction_us {
            *frac = (elapsed_us % FRAME_MICROSECONDS as i64) as u32;
        }
        // The frame clock must never run backwards between indications.
        if let Some(prev) = state.last_fn {
            if fn_delta(current, prev) < 0 {
                error!(prev, current, "frame clock ran backwards");
                panic!("frame clock regression: {} -> {}", prev, current);
            }
        }
        state.last_fn = Some(current);
        current
    }

    /// Current frame number.
    pub fn fnr(&self) -> i32 {
        self.fnr_with_fraction(None)
    }

    /// Current time at slot 0 of the current frame.
    pub fn now(&self) -> Time {
        Time::new(self.fnr(), 0)
    }

    /// Sleep until the start of the target frame. Returns immediately if the
    /// target is in the past.
    pub async fn wait(&self, when: Time) {
        let mut fraction = 0u32;
        let now_fn = self.fnr_with_fraction(Some(&mut fraction));
        let delta = fn_delta(when.fnr(), now_fn);
        if delta <= 0 {
            return;
        }
        let total_us = delta as u64 * FRAME_MICROSECONDS as u64 - fraction as u64;
        tokio::time::sleep(Duration::from_micros(total_us)).await;
    }
}
