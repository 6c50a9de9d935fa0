use calsync_core::{EventDateTime, ExtendedProperties, Priority, Task};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Settings that influence description composition, independent of the
/// persisted app `Settings` document so this module stays a pure function
/// over plain values (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct DescriptionSettings {
    pub vault_name: String,
    pub include_metadata: bool,
    pub default_duration_minutes: i64,
}

impl Default for DescriptionSettings {
    fn default() -> Self {
        Self {
            vault_name: String::new(),
            include_metadata: true,
            default_duration_minutes: 30,
        }
    }
}

/// Request body for a remote event create/update; the `id` is assigned by
/// the server on insert or already known on update (spec.md §4.2).
#[derive(Debug, Clone, Serialize)]
pub struct RemotePayload {
    pub summary: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    #[serde(rename = "extendedProperties")]
    pub extended_properties: ExtendedProperties,
}

/// Derives a stable task ID: `"obsidian-" + firstHexBytes(sha1(basis), 8)`,
/// where `basis` prefers the explicit block anchor over the
/// path/summary/date/window tuple (spec.md §4.1).
pub fn task_id(
    source_path: &str,
    block_anchor: Option<&str>,
    summary: &str,
    start_date: Option<&str>,
    due_date: Option<&str>,
    time_window_start: Option<&str>,
    time_window_end: Option<&str>,
) -> String {
    let basis = match block_anchor {
        Some(anchor) => format!("{source_path}:{anchor}"),
        None => format!(
            "{source_path}:{summary}:{}:{}:{}-{}",
            start_date.unwrap_or_default(),
            due_date.unwrap_or_default(),
            time_window_start.unwrap_or_default(),
            time_window_end.unwrap_or_default(),
        ),
    };

    let mut hasher = Sha1::new();
    hasher.update(basis.as_bytes());
    let digest = hasher.finalize();
    let prefix: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("obsidian-{prefix}")
}

/// Builds the remote-event request body for a task. Returns `None` when
/// either `startDate` or `dueDate` is missing — such tasks are never
/// emitted as create/update ops (spec.md §4.2/§4.3 step 2).
pub fn to_remote_payload(
    task: &Task,
    settings: &DescriptionSettings,
    recurrence_for_event: &[String],
) -> Option<RemotePayload> {
    let start_date = task.start_date.as_deref()?;
    let due_date = task.due_date.as_deref()?;

    let (start, end) = compute_start_end(start_date, due_date, settings.default_duration_minutes);

    let mut private = BTreeMap::new();
    private.insert("isGcalSync".to_string(), "true".to_string());
    private.insert("obsidianTaskId".to_string(), task.id.clone());

    let recurrence = if start.is_some() && !recurrence_for_event.is_empty() {
        recurrence_for_event.to_vec()
    } else {
        Vec::new()
    };

    Some(RemotePayload {
        summary: if task.summary.trim().is_empty() {
            "Untitled Task".to_string()
        } else {
            task.summary.clone()
        },
        status: if task.is_completed {
            "cancelled"
        } else {
            "confirmed"
        },
        description: build_description(task, settings),
        start,
        end,
        recurrence,
        extended_properties: ExtendedProperties { private },
    })
}

fn compute_start_end(
    start_date: &str,
    due_date: &str,
    default_duration_minutes: i64,
) -> (Option<EventDateTime>, Option<EventDateTime>) {
    let start_has_time = Task::has_time_component(start_date);
    let due_has_time = Task::has_time_component(due_date);

    if start_has_time && due_has_time {
        let (Some(start_instant), Some(due_instant)) =
            (parse_flexible(start_date), parse_flexible(due_date))
        else {
            return fallback_all_day_today();
        };

        let end_instant = if due_instant <= start_instant {
            start_instant + Duration::minutes(default_duration_minutes)
        } else {
            due_instant
        };

        (
            Some(EventDateTime::timed(format_datetime(start_instant))),
            Some(EventDateTime::timed(format_datetime(end_instant))),
        )
    } else {
        let Some(start_naive) = parse_date_only(start_date) else {
            return fallback_all_day_today();
        };
        let due_naive = parse_date_only(due_date).unwrap_or(start_naive);

        let mut end_date = due_naive + Duration::days(1);
        if end_date <= start_naive {
            end_date = start_naive + Duration::days(1);
        }

        (
            Some(EventDateTime::all_day(start_naive.format("%Y-%m-%d").to_string())),
            Some(EventDateTime::all_day(end_date.format("%Y-%m-%d").to_string())),
        )
    }
}

fn fallback_all_day_today() -> (Option<EventDateTime>, Option<EventDateTime>) {
    let today = chrono::Utc::now().date_naive();
    let tomorrow = today + Duration::days(1);
    (
        Some(EventDateTime::all_day(today.format("%Y-%m-%d").to_string())),
        Some(EventDateTime::all_day(tomorrow.format("%Y-%m-%d").to_string())),
    )
}

fn build_description(task: &Task, settings: &DescriptionSettings) -> Option<String> {
    let mut link = format!("obsidian://open?vault={}", urlencode(&settings.vault_name));
    link.push_str(&format!("&file={}", urlencode(&task.source_path)));
    if let Some(anchor) = &task.block_anchor {
        link.push('#');
        link.push_str(&urlencode(anchor));
    }

    if !settings.include_metadata {
        return Some(link);
    }

    let mut lines = vec![link];
    if task.priority != Priority::None {
        lines.push(format!("Priority: {:?}", task.priority));
    }
    if !task.tags.is_empty() {
        lines.push(format!(
            "Tags: {}",
            task.tags
                .iter()
                .map(|t| format!("#{t}"))
                .collect::<Vec<_>>()
                .join(" ")
        ));
    }
    if let Some(created) = &task.created_date {
        lines.push(format!("Created: {created}"));
    }
    if let Some(scheduled) = &task.scheduled_date {
        lines.push(format!("Scheduled: {scheduled}"));
    }
    if let Some(completion) = &task.completion_date {
        lines.push(format!("Completed: {completion}"));
    }

    Some(lines.join("\n"))
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn parse_date_only(value: &str) -> Option<NaiveDate> {
    let date_part = if value.len() >= 10 { &value[..10] } else { value };
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

fn parse_flexible(value: &str) -> Option<NaiveDateTime> {
    if value.len() < 10 {
        return None;
    }
    let date = parse_date_only(value)?;
    let rest = value[10..].trim_start_matches(['T', ' ']);
    if rest.is_empty() {
        return date.and_hms_opt(0, 0, 0);
    }

    let time_core: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':')
        .collect();
    let mut segments = time_core.split(':');
    let hh: u32 = segments.next()?.parse().ok()?;
    let mm: u32 = segments.next().unwrap_or("0").parse().ok()?;
    let ss: u32 = segments.next().unwrap_or("0").parse().unwrap_or(0);
    date.and_hms_opt(hh, mm, ss)
}

fn format_datetime(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_deterministic() {
        let a = task_id("vault/tasks.md", None, "Buy milk", Some("2025-01-10"), Some("2025-01-10"), None, None);
        let b = task_id("vault/tasks.md", None, "Buy milk", Some("2025-01-10"), Some("2025-01-10"), None, None);
        assert_eq!(a, b);
        assert!(a.starts_with("obsidian-"));
    }

    #[test]
    fn task_id_prefers_anchor() {
        let with_anchor = task_id("vault/tasks.md", Some("abc"), "Buy milk", Some("2025-01-10"), None, None, None);
        let different_dates = task_id("vault/tasks.md", Some("abc"), "Other summary", Some("2020-01-01"), None, None, None);
        assert_eq!(with_anchor, different_dates);
    }

    #[test]
    fn all_day_end_exclusive_of_due_plus_one() {
        let (start, end) = compute_start_end("2025-01-10", "2025-01-10", 30);
        assert_eq!(start.unwrap().date.as_deref(), Some("2025-01-10"));
        assert_eq!(end.unwrap().date.as_deref(), Some("2025-01-11"));
    }

    #[test]
    fn timed_end_before_start_uses_default_duration() {
        let (start, end) = compute_start_end("2025-01-10T12:00:00", "2025-01-10T10:00:00", 30);
        assert_eq!(start.unwrap().date_time.as_deref(), Some("2025-01-10T12:00:00"));
        assert_eq!(end.unwrap().date_time.as_deref(), Some("2025-01-10T12:30:00"));
    }
}
