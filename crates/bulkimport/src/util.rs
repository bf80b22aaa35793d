//! Small formatting helpers shared by logging and status reporting.

use std::time::Duration;

/// "s" unless `count` is exactly one.
pub fn pluralise(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Render a duration as e.g. `1h 2m 3.456s`, omitting leading zero units.
pub fn human_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d ", days));
    }
    if days > 0 || hours > 0 {
        out.push_str(&format!("{}h ", hours));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m ", minutes));
    }
    out.push_str(&format!("{}.{:03}s", seconds, millis));
    out
}

/// Render a byte count using binary units.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
