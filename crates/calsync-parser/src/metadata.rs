use calsync_core::Priority;
use regex::Regex;
use std::collections::BTreeSet;

/// Every metadata token this parser recognizes, extracted from task content
/// before the free-text summary is derived.
#[derive(Debug, Default)]
pub struct ExtractedMetadata {
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub scheduled_date: Option<String>,
    pub created_date: Option<String>,
    pub completion_date: Option<String>,
    pub priority: Priority,
    pub recurrence_text: Option<String>,
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
    pub block_anchor: Option<String>,
    pub tags: BTreeSet<String>,
}

const DATE_TIME_VALUE: &str = r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2})?(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)?";
const DATE_ONLY_VALUE: &str = r"\d{4}-\d{2}-\d{2}";
const TIME_SEP: &str = r"[-\x{2013}\x{2014}~\x{301c}\x{ff5e}]|to";

/// Repeatedly removes the leftmost recognized marker from `content`,
/// recording its value, until a full pass finds nothing left to extract.
/// Last occurrence of a given kind wins because later matches simply
/// overwrite the field set by an earlier one (spec.md §4.1).
pub fn extract(content: &str) -> (String, ExtractedMetadata) {
    let mut remaining = content.to_string();
    let mut out = ExtractedMetadata::default();

    loop {
        let mut progressed = false;

        if let Some((range, value)) = find_dated(&remaining, &["📅", "due:"]) {
            out.due_date = Some(value);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, value)) = find_dated(&remaining, &["🛫", "start:"]) {
            out.start_date = Some(value);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, value)) = find_dated(&remaining, &["⏳", "scheduled:"]) {
            out.scheduled_date = Some(value);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, value)) = find_date_only(&remaining, &["➕", "created:"]) {
            out.created_date = Some(value);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, value)) = find_date_only(&remaining, &["✅", "done:"]) {
            out.completion_date = Some(value);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, priority)) = find_priority(&remaining) {
            out.priority = priority;
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, text, window)) = find_recurrence(&remaining) {
            out.recurrence_text = Some(text);
            if let Some((start, end)) = window {
                out.time_window_start = Some(start);
                out.time_window_end = Some(end);
            }
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if out.time_window_start.is_none() {
            if let Some((range, start, end)) = find_standalone_time_window(&remaining) {
                out.time_window_start = Some(start);
                out.time_window_end = Some(end);
                remaining.replace_range(range, " ");
                progressed = true;
                continue;
            }
        }
        if let Some((range, anchor)) = find_block_anchor(&remaining) {
            out.block_anchor = Some(anchor);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }
        if let Some((range, tag)) = find_tag(&remaining) {
            out.tags.insert(tag);
            remaining.replace_range(range, " ");
            progressed = true;
            continue;
        }

        if !progressed {
            break;
        }
    }

    (remaining, out)
}

fn find_dated(content: &str, markers: &[&str]) -> Option<(std::ops::Range<usize>, String)> {
    for marker in markers {
        let pattern = format!(r"{}\s*({DATE_TIME_VALUE})", regex::escape(marker));
        let re = Regex::new(&pattern).expect("valid metadata regex");
        if let Some(caps) = re.captures(content) {
            let whole = caps.get(0).expect("whole match");
            let value = caps.get(1).expect("value group").as_str().to_string();
            return Some((whole.range(), value));
        }
    }
    None
}

fn find_date_only(content: &str, markers: &[&str]) -> Option<(std::ops::Range<usize>, String)> {
    for marker in markers {
        let pattern = format!(r"{}\s*({DATE_ONLY_VALUE})", regex::escape(marker));
        let re = Regex::new(&pattern).expect("valid metadata regex");
        if let Some(caps) = re.captures(content) {
            let whole = caps.get(0).expect("whole match");
            let value = caps.get(1).expect("value group").as_str().to_string();
            return Some((whole.range(), value));
        }
    }
    None
}

fn find_priority(content: &str) -> Option<(std::ops::Range<usize>, Priority)> {
    let re = Regex::new(r"(🔺|⏫|🔼|🔽|⏬)|priority::?\s*(highest|high|medium|low|lowest)")
        .expect("valid priority regex");
    let caps = re.captures(content)?;
    let whole = caps.get(0).expect("whole match");
    let priority = if let Some(glyph) = caps.get(1) {
        match glyph.as_str() {
            "🔺" => Priority::Highest,
            "⏫" => Priority::High,
            "🔼" => Priority::Medium,
            "🔽" => Priority::Low,
            "⏬" => Priority::Lowest,
            _ => return None,
        }
    } else {
        match caps.get(2)?.as_str() {
            "highest" => Priority::Highest,
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            "lowest" => Priority::Lowest,
            _ => return None,
        }
    };
    Some((whole.range(), priority))
}

/// The recurrence token runs up to the next marker, `#`, or `^`; it may
/// embed a time window (`🔁 every week 09:00-17:00`).
fn find_recurrence(
    content: &str,
) -> Option<(std::ops::Range<usize>, String, Option<(String, String)>)> {
    let re = Regex::new(r"(?:🔁|repeat:|recur:)\s*([^📅🛫⏳➕✅🔺⏫🔼🔽⏬#^]*)")
        .expect("valid recurrence regex");
    let caps = re.captures(content)?;
    let whole = caps.get(0).expect("whole match");
    let raw = caps.get(1).expect("value group").as_str().trim();
    let window = extract_time_window(raw);
    let text = match &window {
        Some((_, window_range)) => {
            let mut stripped = raw.to_string();
            stripped.replace_range(window_range.clone(), "");
            stripped.trim().to_string()
        }
        None => raw.to_string(),
    };
    Some((whole.range(), text, window.map(|(pair, _)| pair)))
}

fn find_standalone_time_window(
    content: &str,
) -> Option<(std::ops::Range<usize>, String, String)> {
    let (window, range) = extract_time_window(content)?;
    Some((range, window.0, window.1))
}

fn extract_time_window(text: &str) -> Option<((String, String), std::ops::Range<usize>)> {
    let pattern = format!(r"(\d{{2}}:\d{{2}})\s*(?:{TIME_SEP})\s*(\d{{2}}:\d{{2}}|24:00)");
    let re = Regex::new(&pattern).expect("valid time window regex");
    let caps = re.captures(text)?;
    let whole = caps.get(0).expect("whole match");
    let start = caps.get(1).expect("start group").as_str().to_string();
    let end = caps.get(2).expect("end group").as_str().to_string();
    Some(((start, end), whole.range()))
}

fn find_block_anchor(content: &str) -> Option<(std::ops::Range<usize>, String)> {
    let re = Regex::new(r"\^([A-Za-z0-9-]+)\s*$").expect("valid anchor regex");
    let caps = re.captures(content.trim_end())?;
    let whole = caps.get(0).expect("whole match");
    let anchor = caps.get(1).expect("anchor group").as_str().to_string();
    Some((whole.range(), anchor))
}

fn find_tag(content: &str) -> Option<(std::ops::Range<usize>, String)> {
    let re = Regex::new(r"#(\S+)").expect("valid tag regex");
    let caps = re.captures(content)?;
    let whole = caps.get(0).expect("whole match");
    let tag = caps.get(1).expect("tag group").as_str().to_string();
    Some((whole.range(), tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_due_date_wins() {
        let (_, meta) = extract("task 📅 2025-01-01 📅 2025-01-10");
        assert_eq!(meta.due_date.as_deref(), Some("2025-01-10"));
    }

    #[test]
    fn extracts_priority_glyph() {
        let (_, meta) = extract("task ⏫");
        assert_eq!(meta.priority, Priority::High);
    }

    #[test]
    fn extracts_tags_and_anchor_in_any_order() {
        let (remaining, meta) = extract("task #work #urgent ^abc123");
        assert!(meta.tags.contains("work"));
        assert!(meta.tags.contains("urgent"));
        assert_eq!(meta.block_anchor.as_deref(), Some("abc123"));
        assert_eq!(remaining.trim(), "task");
    }

    #[test]
    fn extracts_standalone_time_window() {
        let (_, meta) = extract("task 09:00-17:00");
        assert_eq!(meta.time_window_start.as_deref(), Some("09:00"));
        assert_eq!(meta.time_window_end.as_deref(), Some("17:00"));
    }
}
