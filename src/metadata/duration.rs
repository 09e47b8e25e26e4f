use regex::Regex;
use std::sync::LazyLock;

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").expect("duration pattern is valid")
});

/// 把 `PT1H30M45S` 这样的时长转成 `1:30:45`，不足一小时为 `M:SS`。
/// 无法识别时返回 `Unknown`。
pub fn format_duration(iso: &str) -> String {
    let Some(caps) = ISO_DURATION.captures(iso.trim()) else {
        return "Unknown".to_string();
    };

    let component = |i: usize| -> Option<u64> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };

    let (Some(hours), Some(minutes), Some(seconds)) = (component(1), component(2), component(3)) else {
        return "Unknown".to_string();
    };

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_duration("PT1H30M45S"), "1:30:45");
        assert_eq!(format_duration("PT2H5S"), "2:00:05");
    }

    #[test]
    fn formats_without_hours() {
        assert_eq!(format_duration("PT45S"), "0:45");
        assert_eq!(format_duration("PT4M3S"), "4:03");
        assert_eq!(format_duration("PT15M"), "15:00");
    }

    #[test]
    fn unknown_for_anything_else() {
        assert_eq!(format_duration("garbage"), "Unknown");
        assert_eq!(format_duration("P1DT2H"), "Unknown");
        assert_eq!(format_duration("PT1H30M45Sx"), "Unknown");
        assert_eq!(format_duration(""), "Unknown");
    }
}
