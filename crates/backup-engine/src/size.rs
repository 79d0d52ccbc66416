//! Human readable sizes and durations.
//!

const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

/// Format a byte count using 1024 based units, e.g. `1.5 KB`.
#[allow(clippy::as_conversions)]
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{value:.2}");
    let formatted = formatted.trim_end_matches('0').trim_end_matches('.');

    format!("{formatted} {}", UNITS.get(unit).unwrap_or(&"TB"))
}

/// Format a duration in milliseconds as whole seconds, `N/A` when absent.
pub fn format_duration(milliseconds: Option<i64>) -> String {
    match milliseconds {
        Some(milliseconds) => format!("{}s", (milliseconds + 500).div_euclid(1000)),
        None => "N/A".to_string(),
    }
}
