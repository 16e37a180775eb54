//! Pre-roll / post-roll window configuration.

use std::sync::Mutex;

use serde::Serialize;

use rewind_common::clock::ms_to_us;

/// Shortest window either side of a trigger.
pub const MIN_WINDOW_US: i64 = 1_000_000;

/// Resolved pre-roll and post-roll durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureWindow {
    pub pre_roll_us: i64,
    pub post_roll_us: i64,
}

impl CaptureWindow {
    pub fn pre_roll_ms(&self) -> i64 {
        self.pre_roll_us / 1_000
    }

    pub fn post_roll_ms(&self) -> i64 {
        self.post_roll_us / 1_000
    }
}

/// Holds the default capture window used by clip requests.
///
/// Changing the window only affects requests made afterwards; a clip that
/// is already saving keeps the window it resolved when it started.
#[derive(Debug)]
pub struct CaptureWindowController {
    capacity_us: i64,
    current: Mutex<CaptureWindow>,
}

impl CaptureWindowController {
    pub fn new(capacity_us: i64, pre_ms: u64, post_ms: u64) -> Self {
        let capacity_us = capacity_us.max(MIN_WINDOW_US);
        Self {
            capacity_us,
            current: Mutex::new(CaptureWindow {
                pre_roll_us: clamp_window(ms_to_us(pre_ms), capacity_us),
                post_roll_us: clamp_window(ms_to_us(post_ms), capacity_us),
            }),
        }
    }

    pub fn capacity_us(&self) -> i64 {
        self.capacity_us
    }

    /// Replace the default window; both sides are clamped to
    /// `[1 s, buffer capacity]`. Returns the effective window.
    pub fn set_window(&self, pre_ms: u64, post_ms: u64) -> CaptureWindow {
        let window = CaptureWindow {
            pre_roll_us: clamp_window(ms_to_us(pre_ms), self.capacity_us),
            post_roll_us: clamp_window(ms_to_us(post_ms), self.capacity_us),
        };
        *self.lock() = window;
        tracing::info!(
            pre_secs = window.pre_roll_us / 1_000_000,
            post_secs = window.post_roll_us / 1_000_000,
            "Capture window updated"
        );
        window
    }

    /// The current default window.
    pub fn window(&self) -> CaptureWindow {
        *self.lock()
    }

    /// Window for one request. Positive overrides replace the defaults and
    /// are capped at the buffer capacity; non-positive overrides are ignored.
    pub fn resolve(&self, pre_override_us: Option<i64>, post_override_us: Option<i64>) -> CaptureWindow {
        let defaults = self.window();
        let pick = |value: Option<i64>, fallback: i64| {
            value
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
                .min(self.capacity_us)
        };
        CaptureWindow {
            pre_roll_us: pick(pre_override_us, defaults.pre_roll_us),
            post_roll_us: pick(post_override_us, defaults.post_roll_us),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureWindow> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn clamp_window(value_us: i64, capacity_us: i64) -> i64 {
    value_us.clamp(MIN_WINDOW_US, capacity_us)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_window_clamps_to_bounds() {
        let controller = CaptureWindowController::new(10_000_000, 5_000, 5_000);
        let window = controller.set_window(50, 20_000_000);
        assert_eq!(window.pre_roll_ms(), 1_000);
        assert_eq!(window.post_roll_ms(), 10_000);
        assert_eq!(controller.window(), window);
    }

    #[test]
    fn test_initial_values_are_clamped() {
        let controller = CaptureWindowController::new(10_000_000, 0, 60_000);
        assert_eq!(
            controller.window(),
            CaptureWindow {
                pre_roll_us: 1_000_000,
                post_roll_us: 10_000_000
            }
        );
    }

    #[test]
    fn test_resolve_prefers_overrides_capped_at_capacity() {
        let controller = CaptureWindowController::new(10_000_000, 5_000, 4_000);
        let window = controller.resolve(Some(3_000_000), Some(30_000_000));
        assert_eq!(window.pre_roll_us, 3_000_000);
        assert_eq!(window.post_roll_us, 10_000_000);
    }

    #[test]
    fn test_resolve_ignores_non_positive_overrides() {
        let controller = CaptureWindowController::new(10_000_000, 5_000, 4_000);
        let window = controller.resolve(Some(0), Some(-5));
        assert_eq!(window.pre_roll_us, 5_000_000);
        assert_eq!(window.post_roll_us, 4_000_000);
    }

    #[test]
    fn test_resolved_window_survives_reconfiguration() {
        let controller = CaptureWindowController::new(10_000_000, 5_000, 5_000);
        let in_flight = controller.resolve(None, None);
        controller.set_window(2_000, 2_000);
        assert_eq!(in_flight.pre_roll_us, 5_000_000);
        assert_eq!(controller.window().pre_roll_us, 2_000_000);
    }
}
