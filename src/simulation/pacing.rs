//! Speed-scaled virtual clock that paces the scheduler thread.
//!
//! Virtual time advances at `speed_percent / 100` times wall-clock time. Tick
//! deadlines are expressed in virtual nanoseconds so a speed change only moves
//! the real-time origin and never reorders or skips a deadline.

use std::time::{Duration, Instant};

pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 1000;

// Fixed-point Q32.32 for speed scaling. 1.0 == 1<<32
const ONE_Q32: u64 = 1u64 << 32;

#[derive(Debug)]
pub(crate) struct PacingClock {
    origin_real: Instant,
    origin_virtual_ns: u64,
    scale_q32: u64,
    // exact percent requested by caller (avoids FP truncation off-by-one)
    last_set_percent: u32,
}

impl PacingClock {
    pub fn new(speed_percent: u32) -> Self {
        let percent = speed_percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        Self {
            origin_real: Instant::now(),
            origin_virtual_ns: 0,
            scale_q32: scale_for(percent),
            last_set_percent: percent,
        }
    }

    pub fn speed_percent(&self) -> u32 {
        self.last_set_percent
    }

    pub fn now_virtual(&self) -> u64 {
        self.map_real_to_virtual(Instant::now())
    }

    pub fn map_real_to_virtual(&self, real: Instant) -> u64 {
        let real_dt = real.saturating_duration_since(self.origin_real).as_nanos();
        let scaled = real_dt * self.scale_q32 as u128 / ONE_Q32 as u128;
        self.origin_virtual_ns.saturating_add(scaled.min(u64::MAX as u128) as u64)
    }

    pub fn map_virtual_to_real(&self, virtual_ns: u64) -> Instant {
        // A target before the origin is already due
        let Some(virtual_dt) = virtual_ns.checked_sub(self.origin_virtual_ns) else {
            return self.origin_real;
        };
        let real_ns = virtual_dt as u128 * ONE_Q32 as u128 / self.scale_q32 as u128;
        self.origin_real + Duration::from_nanos(real_ns.min(u64::MAX as u128) as u64)
    }

    /// Changes the speed without moving the current virtual time.
    /// Returns false if the (clamped) percent was already active.
    pub fn set_speed_percent(&mut self, percent: u32) -> bool {
        let percent = percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        if percent == self.last_set_percent {
            return false;
        }
        let real_now = Instant::now();
        let virtual_now = self.map_real_to_virtual(real_now);
        let new_scale = scale_for(percent);

        // Keep origin_virtual_ns fixed so queued deadlines never land before it;
        // move origin_real so that real_now still maps to virtual_now.
        let delta_v = virtual_now.saturating_sub(self.origin_virtual_ns) as u128;
        let real_elapsed_ns = delta_v * ONE_Q32 as u128 / new_scale as u128;
        let elapsed = Duration::from_nanos(real_elapsed_ns.min(u64::MAX as u128) as u64);
        self.origin_real = real_now.checked_sub(elapsed).unwrap_or(real_now);
        self.scale_q32 = new_scale;
        self.last_set_percent = percent;
        true
    }
}

fn scale_for(percent: u32) -> u64 {
    (percent as u128 * ONE_Q32 as u128 / 100) as u64
}

/// Virtual length of `period` in nanoseconds.
pub(crate) fn period_ns(period: Duration) -> u64 {
    period.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuity_on_speed_change_preserves_mapping() {
        let mut clock = PacingClock::new(100);
        std::thread::sleep(Duration::from_millis(5));
        let anchor = Instant::now();
        let v_before = clock.map_real_to_virtual(anchor);
        assert!(clock.set_speed_percent(400));
        let v_after = clock.map_real_to_virtual(anchor);
        // Allow a small tolerance for the instant taken inside set_speed_percent
        let diff = v_after.abs_diff(v_before);
        assert!(diff <= 10_000_000, "virtual mapping changed too much on speed change: diff={} ns", diff);
    }

    #[test]
    fn virtual_to_real_scales_inverse_with_speed() {
        let mut clock = PacingClock::new(100);
        clock.set_speed_percent(200);
        let now_r = Instant::now();
        let now_v = clock.map_real_to_virtual(now_r);
        let target_r = clock.map_virtual_to_real(now_v + 200_000_000);
        let real_dt = target_r.duration_since(now_r);
        let diff = (real_dt.as_secs_f64() - 0.1).abs();
        assert!(diff < 0.01, "expected ~0.1s, got {:?}", real_dt);
    }

    #[test]
    fn map_virtual_to_real_handles_past_targets() {
        let mut clock = PacingClock::new(100);
        clock.origin_virtual_ns = 1_000;
        let origin_r = clock.origin_real;
        assert_eq!(clock.map_virtual_to_real(999), origin_r);
    }

    #[test]
    fn speed_is_clamped_and_unchanged_speed_is_a_no_op() {
        let mut clock = PacingClock::new(0);
        assert_eq!(clock.speed_percent(), MIN_SPEED_PERCENT);
        assert!(clock.set_speed_percent(5_000));
        assert_eq!(clock.speed_percent(), MAX_SPEED_PERCENT);
        assert!(!clock.set_speed_percent(1_000));
    }
}
