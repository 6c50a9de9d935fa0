use calsync_core::{BatchOp, EventDateTime, HttpMethod, IdMap, OperationType, RemoteEvent, Task};
use calsync_parser::{to_remote_payload, DescriptionSettings, RemotePayload};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Planner output: the ops to execute plus the set of task IDs considered
/// current in this run, used by the deletion sweep (spec.md §4.3).
#[derive(Debug, Default)]
pub struct PlanResult {
    pub ops: Vec<BatchOp>,
    pub current_task_ids: HashSet<String>,
}

/// Pure reconciliation: diffs local tasks against the remote, plugin-owned
/// event set and the prior ID map, producing an idempotent batch-op plan.
/// No network or filesystem access (spec.md §4.3).
pub fn plan(
    tasks: &[Task],
    remote_events: &[RemoteEvent],
    id_map: &IdMap,
    recurrence_for_event: impl Fn(&Task) -> Vec<String>,
    settings: &DescriptionSettings,
) -> PlanResult {
    let owned_events: Vec<&RemoteEvent> =
        remote_events.iter().filter(|event| event.is_plugin_owned()).collect();

    let events_by_id: HashMap<&str, &RemoteEvent> =
        owned_events.iter().map(|event| (event.id.as_str(), *event)).collect();

    let mut events_by_task_id: HashMap<String, &RemoteEvent> = HashMap::new();
    for event in &owned_events {
        let Some(task_id) = event.obsidian_task_id() else {
            continue;
        };
        let replace = match events_by_task_id.get(task_id) {
            Some(existing) => updated_after(event, existing),
            None => true,
        };
        if replace {
            events_by_task_id.insert(task_id.to_string(), event);
        }
    }

    let mut working_id_map = id_map.clone();
    for (task_id, event) in &events_by_task_id {
        working_id_map.insert(task_id.clone(), event.id.clone());
    }

    let mut result = PlanResult::default();

    for task in tasks {
        result.current_task_ids.insert(task.id.clone());

        let linked_event = working_id_map
            .get(&task.id)
            .and_then(|event_id| events_by_id.get(event_id).copied());

        if task.is_completed {
            if let Some(event) = linked_event {
                if !matches!(event.status, calsync_core::EventStatus::Cancelled) {
                    result.ops.push(BatchOp {
                        method: HttpMethod::Patch,
                        path: format!("events/{}", event.id),
                        body: Some(serde_json::json!({ "status": "cancelled" })),
                        operation_type: OperationType::Patch,
                        task_id: Some(task.id.clone()),
                        original_event_id: Some(event.id.clone()),
                    });
                }
            }
            continue;
        }

        if task.start_date.is_none() || task.due_date.is_none() {
            continue;
        }

        let recurrence = recurrence_for_event(task);
        let Some(payload) = to_remote_payload(task, settings, &recurrence) else {
            continue;
        };

        match linked_event {
            Some(event) => {
                if needs_update(event, &payload) {
                    result.ops.push(BatchOp {
                        method: HttpMethod::Put,
                        path: format!("events/{}", event.id),
                        body: Some(serde_json::to_value(&payload).expect("payload serializes")),
                        operation_type: OperationType::Update,
                        task_id: Some(task.id.clone()),
                        original_event_id: Some(event.id.clone()),
                    });
                }
            }
            None => {
                result.ops.push(BatchOp {
                    method: HttpMethod::Post,
                    path: "events".to_string(),
                    body: Some(serde_json::to_value(&payload).expect("payload serializes")),
                    operation_type: OperationType::Insert,
                    task_id: Some(task.id.clone()),
                    original_event_id: None,
                });
            }
        }
    }

    let mut deleted_event_ids: HashSet<String> = HashSet::new();

    for (task_id, event_id) in working_id_map.iter() {
        if !result.current_task_ids.contains(task_id) && deleted_event_ids.insert(event_id.clone())
        {
            result.ops.push(BatchOp {
                method: HttpMethod::Delete,
                path: format!("events/{event_id}"),
                body: None,
                operation_type: OperationType::Delete,
                task_id: Some(task_id.clone()),
                original_event_id: Some(event_id.clone()),
            });
        }
    }

    for event in &owned_events {
        let mapped = event
            .obsidian_task_id()
            .and_then(|task_id| working_id_map.get(task_id))
            .map(|mapped_event_id| mapped_event_id == event.id)
            .unwrap_or(false);

        if !mapped && deleted_event_ids.insert(event.id.clone()) {
            result.ops.push(BatchOp {
                method: HttpMethod::Delete,
                path: format!("events/{}", event.id),
                body: None,
                operation_type: OperationType::Delete,
                task_id: None,
                original_event_id: Some(event.id.clone()),
            });
        }
    }

    result
}

fn updated_after(candidate: &RemoteEvent, current: &RemoteEvent) -> bool {
    match (parse_timestamp(candidate.updated.as_deref()), parse_timestamp(current.updated.as_deref())) {
        (Some(a), Some(b)) => a >= b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => candidate.id >= current.id,
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(v).ok()).map(|v| v.with_timezone(&Utc))
}

/// Implements the change-detection rule of spec.md §4.3.1: an update is
/// required iff any normalized field differs between the existing event
/// and the freshly computed payload.
fn needs_update(existing: &RemoteEvent, payload: &RemotePayload) -> bool {
    if normalize_text(existing.summary.as_deref()) != normalize_text(Some(&payload.summary)) {
        return true;
    }
    if normalize_text(existing.description.as_deref()) != normalize_text(payload.description.as_deref()) {
        return true;
    }
    let existing_status = match existing.status {
        calsync_core::EventStatus::Cancelled => "cancelled",
        calsync_core::EventStatus::Confirmed => "confirmed",
    };
    if existing_status != payload.status {
        return true;
    }
    if !event_datetime_eq(existing.start.as_ref(), payload.start.as_ref()) {
        return true;
    }
    if !event_datetime_eq(existing.end.as_ref(), payload.end.as_ref()) {
        return true;
    }

    let mut existing_recurrence: Vec<String> = existing
        .recurrence
        .iter()
        .map(|rule| strip_rrule_prefix(rule))
        .collect();
    let mut payload_recurrence: Vec<String> = payload
        .recurrence
        .iter()
        .map(|rule| strip_rrule_prefix(rule))
        .collect();
    existing_recurrence.sort();
    payload_recurrence.sort();
    if existing_recurrence != payload_recurrence {
        return true;
    }

    let existing_task_id = existing.extended_properties.private.get("obsidianTaskId").map(String::as_str);
    let payload_task_id = payload.extended_properties.private.get("obsidianTaskId").map(String::as_str);
    if existing_task_id != payload_task_id {
        return true;
    }
    let existing_flag = existing.extended_properties.private.get("isGcalSync").map(String::as_str);
    let payload_flag = payload.extended_properties.private.get("isGcalSync").map(String::as_str);
    if existing_flag != payload_flag {
        return true;
    }

    false
}

fn normalize_text(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_string()
}

fn strip_rrule_prefix(value: &str) -> String {
    value
        .strip_prefix("RRULE:")
        .or_else(|| value.strip_prefix("rrule:"))
        .unwrap_or(value)
        .trim()
        .to_string()
}

fn event_datetime_eq(a: Option<&EventDateTime>, b: Option<&EventDateTime>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.date.as_deref() != b.date.as_deref() {
                return false;
            }
            if a.time_zone.as_deref() != b.time_zone.as_deref() {
                return false;
            }
            match (a.date_time.as_deref(), b.date_time.as_deref()) {
                (None, None) => true,
                (Some(x), Some(y)) => instants_eq(x, y),
                _ => false,
            }
        }
        _ => false,
    }
}

fn instants_eq(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (parse_naive(a), parse_naive(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{ExtendedProperties, IdMap};
    use std::collections::BTreeMap;

    fn owned_event(id: &str, task_id: &str, status: calsync_core::EventStatus) -> RemoteEvent {
        let mut private = BTreeMap::new();
        private.insert("isGcalSync".to_string(), "true".to_string());
        private.insert("obsidianTaskId".to_string(), task_id.to_string());
        RemoteEvent {
            id: id.to_string(),
            status,
            summary: Some("Buy milk".to_string()),
            description: None,
            start: Some(EventDateTime::all_day("2025-01-10")),
            end: Some(EventDateTime::all_day("2025-01-11")),
            recurrence: Vec::new(),
            extended_properties: ExtendedProperties { private },
            updated: Some("2025-01-01T00:00:00Z".to_string()),
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            summary: "Buy milk".to_string(),
            is_completed: false,
            due_date: Some("2025-01-10".to_string()),
            start_date: Some("2025-01-10".to_string()),
            scheduled_date: None,
            created_date: None,
            completion_date: None,
            priority: calsync_core::Priority::None,
            recurrence_rule: None,
            time_window_start: None,
            time_window_end: None,
            tags: Default::default(),
            block_anchor: None,
            source_path: "vault/tasks.md".to_string(),
            source_line: 1,
        }
    }

    fn settings() -> DescriptionSettings {
        DescriptionSettings::default()
    }

    #[test]
    fn empty_everything_produces_no_ops() {
        let result = plan(&[], &[], &IdMap::new(), |_| Vec::new(), &settings());
        assert!(result.ops.is_empty());
    }

    #[test]
    fn new_task_with_no_remote_event_inserts() {
        let result = plan(&[task("t1")], &[], &IdMap::new(), |_| Vec::new(), &settings());
        assert_eq!(result.ops.len(), 1);
        assert_eq!(result.ops[0].operation_type, OperationType::Insert);
    }

    #[test]
    fn matching_existing_event_produces_no_ops() {
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        let events = vec![owned_event("e1", "t1", calsync_core::EventStatus::Confirmed)];
        let result = plan(&[task("t1")], &events, &id_map, |_| Vec::new(), &settings());
        assert!(result.ops.is_empty());
    }

    #[test]
    fn completed_task_with_confirmed_event_emits_patch() {
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        let events = vec![owned_event("e1", "t1", calsync_core::EventStatus::Confirmed)];
        let mut t = task("t1");
        t.is_completed = true;
        let result = plan(&[t], &events, &id_map, |_| Vec::new(), &settings());
        assert_eq!(result.ops.len(), 1);
        assert_eq!(result.ops[0].operation_type, OperationType::Patch);
    }

    #[test]
    fn removed_task_emits_single_delete() {
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        let events = vec![owned_event("e1", "t1", calsync_core::EventStatus::Confirmed)];
        let result = plan(&[], &events, &id_map, |_| Vec::new(), &settings());
        assert_eq!(result.ops.len(), 1);
        assert_eq!(result.ops[0].operation_type, OperationType::Delete);
    }

    #[test]
    fn orphan_event_without_task_id_is_deleted() {
        let events = vec![owned_event("e1", "unmapped-task", calsync_core::EventStatus::Confirmed)];
        let result = plan(&[], &events, &IdMap::new(), |_| Vec::new(), &settings());
        assert_eq!(result.ops.len(), 1);
        assert_eq!(result.ops[0].operation_type, OperationType::Delete);
        assert_eq!(result.ops[0].original_event_id.as_deref(), Some("e1"));
    }
}
