//! Dynamic per-problem point values.
//!
//! A problem's value decays as more distinct users solve it; the value a
//! submission earns is snapshotted at the moment it is accepted and never
//! changes afterwards.

/// Decay factor for `solvers` distinct accepted users.
///
/// `decay(0) = 1.0` and the curve is non-increasing in `solvers`.
pub fn decay(solvers: u64, alpha: f64) -> f64 {
    1.0 / (1.0 + solvers as f64 / alpha)
}

/// Current point value of a problem with `solvers` distinct solvers.
pub fn problem_points(base_points: f64, solvers: u64, alpha: f64, floor: f64) -> f64 {
    (base_points * decay(solvers, alpha)).max(floor)
}
