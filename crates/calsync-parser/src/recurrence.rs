use chrono::{NaiveDate, Utc};
use regex::Regex;
use rrule::RRuleSet;

/// Normalizes free-form recurrence text plus a DTSTART hint into a
/// canonical, re-serialized iCalendar recurrence string (spec.md §4.1).
/// Returns `None` when no FREQ can be inferred — the rule is simply
/// omitted rather than treated as an error.
pub fn normalize(text: &str, dtstart_hint: Option<&str>) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("RRULE:") || upper.starts_with("FREQ=") {
        return reserialize(trimmed, dtstart_hint);
    }

    let candidate = build_from_natural_language(&trimmed.to_ascii_lowercase())?;
    reserialize(&candidate, dtstart_hint)
}

/// Extracts only the `RRULE:` line(s) from a normalized multi-line
/// recurrence string, for embedding in a remote event's `recurrence` list
/// (spec.md §4.2 — the event's DTSTART is conveyed by `start`, not by a
/// duplicated DTSTART line).
pub fn rrule_lines(normalized: &str) -> Vec<String> {
    normalized
        .lines()
        .filter(|line| line.to_ascii_uppercase().starts_with("RRULE:"))
        .map(str::to_string)
        .collect()
}

fn reserialize(text: &str, dtstart_hint: Option<&str>) -> Option<String> {
    let rrule_line = if text.to_ascii_uppercase().starts_with("RRULE:") {
        text.to_string()
    } else {
        format!("RRULE:{text}")
    };

    let candidate = if text.to_ascii_uppercase().contains("DTSTART") {
        rrule_line
    } else {
        format!("DTSTART:{}\n{}", dtstart_from_hint(dtstart_hint), rrule_line)
    };

    match RRuleSet::parse(&candidate) {
        Ok(set) => Some(set.to_string()),
        Err(err) => {
            tracing::warn!(error = %err, candidate = %candidate, "failed to parse recurrence rule");
            None
        }
    }
}

fn build_from_natural_language(lower: &str) -> Option<String> {
    let every_n = Regex::new(r"every\s+(\d+)\s*(day|week|month|year)s?").expect("valid regex");

    let (freq, interval) = if let Some(caps) = every_n.captures(lower) {
        let interval: u32 = caps[1].parse().unwrap_or(1);
        let freq = match &caps[2] {
            "day" => "DAILY",
            "week" => "WEEKLY",
            "month" => "MONTHLY",
            "year" => "YEARLY",
            _ => return None,
        };
        (freq, interval)
    } else if lower.contains("daily") {
        ("DAILY", 1)
    } else if lower.contains("weekly") {
        ("WEEKLY", 1)
    } else if lower.contains("monthly") {
        ("MONTHLY", 1)
    } else if lower.contains("yearly") || lower.contains("annually") {
        ("YEARLY", 1)
    } else {
        return None;
    };

    let mut parts = vec![format!("FREQ={freq}")];
    if interval > 1 {
        parts.push(format!("INTERVAL={interval}"));
    }

    if freq == "MONTHLY" {
        if let Some(caps) = Regex::new(r"on the (\d{1,2})(?:st|nd|rd|th)")
            .expect("valid regex")
            .captures(lower)
        {
            parts.push(format!("BYMONTHDAY={}", &caps[1]));
        }
    }

    if freq == "WEEKLY" {
        const WEEKDAYS: [(&str, &str); 7] = [
            ("monday", "MO"),
            ("tuesday", "TU"),
            ("wednesday", "WE"),
            ("thursday", "TH"),
            ("friday", "FR"),
            ("saturday", "SA"),
            ("sunday", "SU"),
        ];
        let mut days: Vec<&str> = WEEKDAYS
            .iter()
            .filter(|(name, _)| lower.contains(name))
            .map(|(_, code)| *code)
            .collect();
        if lower.contains("weekend") {
            for code in ["SA", "SU"] {
                if !days.contains(&code) {
                    days.push(code);
                }
            }
        } else if lower.contains("weekday") {
            for code in ["MO", "TU", "WE", "TH", "FR"] {
                if !days.contains(&code) {
                    days.push(code);
                }
            }
        }
        if !days.is_empty() {
            parts.push(format!("BYDAY={}", days.join(",")));
        }
    }

    if let Some(caps) = Regex::new(r"for\s+(\d+)\s*(?:occurrences|times)")
        .expect("valid regex")
        .captures(lower)
    {
        parts.push(format!("COUNT={}", &caps[1]));
    } else if let Some(caps) = Regex::new(r"until\s+(\d{4}-\d{2}-\d{2})")
        .expect("valid regex")
        .captures(lower)
    {
        if let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") {
            if let Some(end_of_day) = date.and_hms_opt(23, 59, 59) {
                parts.push(format!("UNTIL={}", end_of_day.format("%Y%m%dT%H%M%SZ")));
            }
        }
    }

    Some(parts.join(";"))
}

fn dtstart_from_hint(hint: Option<&str>) -> String {
    match hint.and_then(ical_basic_datetime) {
        Some(value) => value,
        None => format!("{}T000000", Utc::now().format("%Y%m%d")),
    }
}

/// Converts a `YYYY-MM-DD` or `YYYY-MM-DD[T ]HH:MM[:SS][.fff][Z|±HH:MM]`
/// value into an iCalendar basic-format local datetime (`YYYYMMDDTHHMMSS`).
fn ical_basic_datetime(value: &str) -> Option<String> {
    if value.len() < 10 {
        return None;
    }
    let (date_part, rest) = value.split_at(10);
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;

    let time_part = rest.trim_start_matches(['T', ' ']);
    if time_part.is_empty() {
        return Some(format!("{}T000000", date.format("%Y%m%d")));
    }

    let time_core: String = time_part
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':')
        .collect();
    let mut segments = time_core.split(':');
    let hh: u32 = segments.next().unwrap_or("0").parse().ok()?;
    let mm: u32 = segments.next().unwrap_or("0").parse().ok()?;
    let ss: u32 = segments.next().unwrap_or("0").parse().unwrap_or(0);

    Some(format!(
        "{}T{:02}{:02}{:02}",
        date.format("%Y%m%d"),
        hh,
        mm,
        ss
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ical_basic_datetime_handles_date_only() {
        assert_eq!(
            ical_basic_datetime("2025-01-10").as_deref(),
            Some("20250110T000000")
        );
    }

    #[test]
    fn ical_basic_datetime_handles_time_component() {
        assert_eq!(
            ical_basic_datetime("2025-01-10T09:30:00").as_deref(),
            Some("20250110T093000")
        );
    }

    #[test]
    fn natural_language_builds_weekly_byday() {
        let candidate = build_from_natural_language("weekly on monday and wednesday").unwrap();
        assert!(candidate.contains("FREQ=WEEKLY"));
        assert!(candidate.contains("BYDAY=MO,WE"));
    }

    #[test]
    fn natural_language_returns_none_without_freq() {
        assert!(build_from_natural_language("whenever i feel like it").is_none());
    }
}
