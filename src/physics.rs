//! Physics helpers for the throw detector.

/// Acceleration magnitude with nominal gravity removed from the z axis (m/s²).
pub fn magnitude(ax: f64, ay: f64, az: f64, gravity: f64) -> f64 {
    let dz = az - gravity;
    (ax * ax + ay * ay + dz * dz).sqrt()
}

/// Adaptive throw trigger: twice the recent mean, never below `floor`.
pub fn dynamic_threshold(mean: f64, floor: f64) -> f64 {
    floor.max(mean * 2.0)
}

/// Height reached for a measured free-fall duration, `g·t²/8`.
///
/// The duration is taken as the whole unsupported flight, up and down, so the
/// time to apex is `t/2` and `h = ½·g·(t/2)²`.
pub fn free_fall_height(free_fall_s: f64, gravity: f64) -> f64 {
    gravity * free_fall_s * free_fall_s / 8.0
}

/// Free-fall duration that produces `height` under [`free_fall_height`].
pub fn free_fall_duration(height: f64, gravity: f64) -> f64 {
    (8.0 * height.max(0.0) / gravity).sqrt()
}
