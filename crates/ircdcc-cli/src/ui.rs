//! UI utilities for the ircdcc CLI.

use std::time::Duration;

use ircdcc_core::transfer::meter::Estimate;
use ircdcc_core::transfer::TransferSnapshot;

/// Format a byte count in human-readable form.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a speed estimate as "<size>/s".
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_speed(speed: Estimate<f64>) -> String {
    match speed {
        Estimate::Value(bps) => format!("{}/s", format_size(bps.max(0.0) as u64)),
        Estimate::Calculating => "calculating".to_string(),
        Estimate::NotInTransfer => "--".to_string(),
        Estimate::Infinite => "stalled".to_string(),
    }
}

/// Format remaining duration as "M:SS".
pub fn format_remaining(remaining: Duration) -> String {
    let total_secs = remaining.as_secs();
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{}:{:02}", mins, secs)
}

/// Format a time-left estimate.
pub fn format_estimate(time_left: Estimate<Duration>) -> String {
    match time_left {
        Estimate::Value(d) => format_remaining(d),
        Estimate::Calculating => "--:--".to_string(),
        Estimate::NotInTransfer => "--".to_string(),
        Estimate::Infinite => "∞".to_string(),
    }
}

/// One-line progress for a transferring snapshot.
pub fn progress_line(snapshot: &TransferSnapshot) -> String {
    format!(
        "  [{:>6.2}%] {} - {} of {} - {} - ETA: {}",
        snapshot.progress(),
        snapshot.file_name,
        format_size(snapshot.transferring_position),
        format_size(snapshot.file_size),
        format_speed(snapshot.current_speed),
        format_estimate(snapshot.time_left)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(Estimate::Value(2048.0)), "2.00 KB/s");
        assert_eq!(format_speed(Estimate::Calculating), "calculating");
        assert_eq!(format_speed(Estimate::Infinite), "stalled");
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(300)), "5:00");
        assert_eq!(format_remaining(Duration::from_secs(65)), "1:05");
        assert_eq!(format_remaining(Duration::from_secs(0)), "0:00");
    }

    #[test]
    fn test_format_estimate() {
        assert_eq!(format_estimate(Estimate::Value(Duration::from_secs(61))), "1:01");
        assert_eq!(format_estimate(Estimate::Calculating), "--:--");
        assert_eq!(format_estimate(Estimate::NotInTransfer), "--");
    }
}
