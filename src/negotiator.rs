//! Capture-rate negotiation.
//!
//! Each running output module reports the capture rate it needs; stopped
//! modules report 0. The camera runs at the maximum positive demand, or at
//! the idle rate when nobody wants frames. Recomputed after every module
//! start/stop via [`Camera::refresh_capture_rate`].
//!
//! [`Camera::refresh_capture_rate`]: crate::capture::Camera::refresh_capture_rate

/// Picks the effective capture rate from per-module demands.
pub fn negotiated_fps(demands: impl IntoIterator<Item = f64>, idle_fps: f64) -> f64 {
    let max_demand = demands
        .into_iter()
        .filter(|fps| *fps > 0.0)
        .fold(0.0_f64, f64::max);
    if max_demand > 0.0 {
        max_demand
    } else {
        idle_fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busiest_consumer_wins() {
        assert_eq!(negotiated_fps([10.0, 25.0, 0.2], 0.05), 25.0);
    }

    #[test]
    fn idle_rate_when_no_demand() {
        assert_eq!(negotiated_fps([], 0.05), 0.05);
        assert_eq!(negotiated_fps([0.0, 0.0], 0.05), 0.05);
    }

    #[test]
    fn sub_hertz_demand_still_counts() {
        // A 5s timelapse interval demands 0.2 fps, which beats idle
        assert_eq!(negotiated_fps([0.0, 0.2], 0.05), 0.2);
    }

    #[test]
    fn negative_demands_ignored() {
        assert_eq!(negotiated_fps([-3.0], 0.05), 0.05);
    }
}
