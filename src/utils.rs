use serde::Serialize;

const FLOAT_EPSILON: f64 = 1e-6;

pub fn approx_eq(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= FLOAT_EPSILON
}

/// Round `value` to the nearest multiple of `step` (e.g. 0.5 °C for setpoints).
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let rounded = (value / step).round() * step;
    // trim representation noise such as 21.500000000000004
    (rounded * 1_000.0).round() / 1_000.0
}

/// Serialize a serde-backed enum into its string name (e.g. `lowercase`).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// Render an optional value for log lines, using `-` for unavailable.
pub fn fmt_opt<T: std::fmt::Display>(val: Option<T>) -> String {
    val.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
