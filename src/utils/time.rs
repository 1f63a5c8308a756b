//! Time formatting utilities

/// Format a microsecond stream position as `HH:MM:SS.uuuuuu`
pub fn format_out_time(us: i64) -> String {
    let us = us.max(0);
    let total_secs = us / 1_000_000;
    let micros = us % 1_000_000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{:02}:{:02}:{:02}.{:06}", hours, minutes, secs, micros)
}

/// Format an elapsed duration as a short human string for the summary log
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, secs)
    } else {
        format!("{}.{:01}s", secs, elapsed.subsec_millis() / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_out_time() {
        assert_eq!(format_out_time(0), "00:00:00.000000");
        assert_eq!(format_out_time(1_500_000), "00:00:01.500000");
        assert_eq!(format_out_time(3_661_000_042), "01:01:01.000042");
    }

    #[test]
    fn test_format_out_time_negative_clamps() {
        // ffmpeg occasionally reports a negative out_time_ms at start
        assert_eq!(format_out_time(-1), "00:00:00.000000");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(7322)), "2h02m02s");
        assert_eq!(format_elapsed(Duration::from_secs(62)), "1m02s");
        assert_eq!(format_elapsed(Duration::from_millis(3400)), "3.4s");
    }
}
