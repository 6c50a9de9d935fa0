use crate::identity;
use crate::metadata;
use crate::recurrence;
use calsync_core::Task;
use regex::Regex;

/// Parses one line of text into a `Task`, or returns `None` if the line is
/// not a checkbox task line. Fenced-code exclusion and file I/O are the
/// caller's responsibility (spec.md §4.1).
pub fn parse_line(line: &str, source_path: &str, source_line: usize) -> Option<Task> {
    let checkbox = Regex::new(r"^\s*-\s*\[(.)\]\s*(.*)$").expect("valid checkbox regex");
    let caps = checkbox.captures(line)?;
    let glyph = caps.get(1)?.as_str();
    let content = caps.get(2)?.as_str();

    let is_completed = glyph != " " && !glyph.is_empty();

    let (remaining, mut meta) = metadata::extract(content);

    if meta.due_date.is_some() && meta.start_date.is_none() {
        meta.start_date = meta.due_date.clone();
    }

    if meta.time_window_start.is_none() {
        if let Some(start) = &meta.start_date {
            if Task::has_time_component(start) {
                if let Some(time) = extract_time_of_day(start) {
                    meta.time_window_start = Some(time);
                    meta.time_window_end = Some("24:00".to_string());
                }
            }
        }
    }

    let summary = collapse_summary(&remaining);

    let dtstart_hint = meta
        .start_date
        .as_deref()
        .or(meta.due_date.as_deref())
        .or(meta.scheduled_date.as_deref());

    let recurrence_rule = meta
        .recurrence_text
        .as_deref()
        .and_then(|text| recurrence::normalize(text, dtstart_hint));

    let id = identity::task_id(
        source_path,
        meta.block_anchor.as_deref(),
        &summary,
        meta.start_date.as_deref(),
        meta.due_date.as_deref(),
        meta.time_window_start.as_deref(),
        meta.time_window_end.as_deref(),
    );

    Some(Task {
        id,
        summary,
        is_completed,
        due_date: meta.due_date,
        start_date: meta.start_date,
        scheduled_date: meta.scheduled_date,
        created_date: meta.created_date,
        completion_date: meta.completion_date,
        priority: meta.priority,
        recurrence_rule,
        time_window_start: meta.time_window_start,
        time_window_end: meta.time_window_end,
        tags: meta.tags,
        block_anchor: meta.block_anchor,
        source_path: source_path.to_string(),
        source_line,
    })
}

fn extract_time_of_day(value: &str) -> Option<String> {
    let rest = if value.len() > 10 {
        value[10..].trim_start_matches(['T', ' '])
    } else {
        return None;
    };
    let time_core: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':')
        .collect();
    let mut parts = time_core.splitn(3, ':');
    let hh = parts.next()?;
    let mm = parts.next()?;
    Some(format!("{hh:0>2}:{mm:0>2}"))
}

fn collapse_summary(remaining: &str) -> String {
    let whitespace = Regex::new(r"\s+").expect("valid whitespace regex");
    let collapsed = whitespace.replace_all(remaining.trim(), " ");
    let all_day = Regex::new(r"(?i)\ball[- ]?day\b|終日|全日").expect("valid all-day regex");
    let stripped = all_day.replace_all(&collapsed, "");
    whitespace.replace_all(stripped.trim(), " ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_task_line_is_none() {
        assert!(parse_line("just some text", "a.md", 1).is_none());
    }

    #[test]
    fn completed_checkbox_sets_is_completed() {
        let task = parse_line("- [x] Buy milk", "a.md", 1).unwrap();
        assert!(task.is_completed);
        assert_eq!(task.summary, "Buy milk");
    }

    #[test]
    fn due_date_fills_missing_start_date() {
        let task = parse_line("- [ ] Buy milk 📅 2025-01-10", "a.md", 1).unwrap();
        assert_eq!(task.due_date.as_deref(), Some("2025-01-10"));
        assert_eq!(task.start_date.as_deref(), Some("2025-01-10"));
    }

    #[test]
    fn timed_start_without_window_sets_default_window() {
        let task = parse_line(
            "- [ ] Call dentist 🛫 2025-01-10T09:00 📅 2025-01-10",
            "a.md",
            1,
        )
        .unwrap();
        assert_eq!(task.time_window_start.as_deref(), Some("09:00"));
        assert_eq!(task.time_window_end.as_deref(), Some("24:00"));
    }

    #[test]
    fn last_occurrence_of_due_wins() {
        let task = parse_line(
            "- [ ] Pay rent 📅 2025-01-01 📅 2025-01-10",
            "a.md",
            1,
        )
        .unwrap();
        assert_eq!(task.due_date.as_deref(), Some("2025-01-10"));
    }
}
