use chrono::Duration;

/// Fallback when a fulfiller's delivery time cannot be understood.
pub const DEFAULT_SLA_DAYS: i64 = 7;

/// Parses a free-text delivery promise such as "2 weeks", "10 days",
/// "48 hours" or "1 month". Unknown or empty input yields seven days.
pub fn parse_delivery_time(text: Option<&str>) -> Duration {
    text.and_then(parse).unwrap_or_else(|| Duration::days(DEFAULT_SLA_DAYS))
}

fn parse(text: &str) -> Option<Duration> {
    let lowered = text.trim().to_ascii_lowercase();
    let mut parts = lowered.split_whitespace();
    let first = parts.next()?;

    // "2weeks" and "2 weeks" are both seen in the wild
    let (count, unit) = match parts.next() {
        Some(unit) => (first.parse::<i64>().ok()?, unit.to_string()),
        None => {
            let split = first.find(|c: char| !c.is_ascii_digit())?;
            let (digits, unit) = first.split_at(split);
            (digits.parse::<i64>().ok()?, unit.to_string())
        }
    };
    if count <= 0 {
        return None;
    }

    let unit = unit.trim_end_matches('s');
    match unit {
        "hour" | "hr" | "h" => Duration::try_hours(count),
        "day" | "d" => Duration::try_days(count),
        "week" | "wk" | "w" => Duration::try_weeks(count),
        "month" | "mo" => Duration::try_days(count.checked_mul(30)?),
        _ => None,
    }
}
