//! Volume and concentration helpers
//!
//! Volumes are microliters, concentrations nanomolar. Both are stored as
//! `f64` and canonicalized to one decimal place at every boundary where a
//! value leaves the planner (layouts, worklists, take-out volumes).

/// Tolerance for comparing volumes and concentrations
pub const TOLERANCE: f64 = 1e-6;

/// Number of decimal places kept for volumes
pub const VOLUME_DECIMALS: i32 = 1;

/// Round a volume to canonical precision (one decimal place)
pub fn round_volume(volume: f64) -> f64 {
    let factor = 10f64.powi(VOLUME_DECIMALS);
    (volume * factor).round() / factor
}

/// Round a volume up to canonical precision
///
/// Values already on the grid (within tolerance) are kept as they are.
pub fn ceil_volume(volume: f64) -> f64 {
    let factor = 10f64.powi(VOLUME_DECIMALS);
    let scaled = volume * factor;
    if (scaled - scaled.round()).abs() < TOLERANCE * factor {
        return scaled.round() / factor;
    }
    scaled.ceil() / factor
}

/// Round a concentration for display and comparison (one decimal place)
pub fn round_concentration(concentration: f64) -> f64 {
    (concentration * 10.0).round() / 10.0
}

/// `a == b` within tolerance
pub fn are_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < TOLERANCE
}

/// `a < b` beyond tolerance
pub fn is_smaller_than(a: f64, b: f64) -> bool {
    b - a > TOLERANCE
}

/// `a > b` beyond tolerance
pub fn is_larger_than(a: f64, b: f64) -> bool {
    a - b > TOLERANCE
}

/// Fold of a single dilution step
pub fn dilution_factor(source_concentration: f64, target_concentration: f64) -> f64 {
    source_concentration / target_concentration
}

/// Volume that must be taken from a source to reach `target_concentration`
/// in `target_volume`
pub fn donor_volume(target_volume: f64, target_concentration: f64, source_concentration: f64) -> f64 {
    target_volume * target_concentration / source_concentration
}

/// Format a volume for worklist files (`2.0`, `12.5`)
pub fn format_volume(volume: f64) -> String {
    format!("{:.1}", round_volume(volume))
}

/// Format a concentration for instructions (`50000`, `12.5`)
pub fn format_concentration(concentration: f64) -> String {
    let rounded = round_concentration(concentration);
    if are_equal(rounded, rounded.round()) {
        format!("{}", rounded.round() as i64)
    } else {
        format!("{:.1}", rounded)
    }
}
