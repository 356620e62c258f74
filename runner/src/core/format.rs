//! Formatting helpers for presenting metrics.

pub fn format_ms(value: f64) -> String {
    format!("{value:.0} ms")
}

pub fn format_percent(value: f64) -> String {
    if (value - value.round()).abs() < f64::EPSILON {
        format!("{value:.0}%")
    } else {
        format!("{value:.1}%")
    }
}

/// Round to the given number of decimals, half away from zero.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
