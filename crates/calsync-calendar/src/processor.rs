use calsync_core::{BatchOp, BatchResult, IdMap, OperationType, SyncCounters};

/// Applies per-part batch results to the ID map and run counters. Pure
/// function; the only place IdMap is mutated (spec.md §4.5). Callers must
/// uphold the precondition `results.len() == ops.len()` — the batch
/// executor enforces this before invoking the processor.
pub fn apply_results(ops: &[BatchOp], results: &[BatchResult], id_map: &mut IdMap) -> SyncCounters {
    debug_assert_eq!(ops.len(), results.len());

    let mut counters = SyncCounters::default();

    for (op, result) in ops.iter().zip(results.iter()) {
        classify(op, result, id_map, &mut counters);
    }

    counters
}

fn classify(op: &BatchOp, result: &BatchResult, id_map: &mut IdMap, counters: &mut SyncCounters) {
    match result.status {
        200..=299 => apply_success(op, result, id_map, counters),
        404 | 410 => apply_gone(op, id_map, counters),
        409 if op.operation_type == OperationType::Insert => counters.skipped += 1,
        412 => counters.skipped += 1,
        401 => counters.auth_errors += 1,
        403 => counters.errors += 1,
        _ => counters.errors += 1,
    }
}

fn apply_success(op: &BatchOp, result: &BatchResult, id_map: &mut IdMap, counters: &mut SyncCounters) {
    let Some(task_id) = op.task_id.as_deref() else {
        return;
    };

    match op.operation_type {
        OperationType::Insert => {
            if let Some(id) = result.body.id() {
                id_map.insert(task_id, id);
                counters.created += 1;
            } else {
                counters.errors += 1;
            }
        }
        OperationType::Update => {
            let event_id = result
                .body
                .id()
                .map(str::to_string)
                .or_else(|| op.original_event_id.clone());
            if let Some(event_id) = event_id {
                id_map.insert(task_id, event_id);
            }
            counters.updated += 1;
        }
        OperationType::Patch => {
            counters.updated += 1;
        }
        OperationType::Delete => {
            id_map.remove(task_id);
            counters.deleted += 1;
        }
    }
}

fn apply_gone(op: &BatchOp, id_map: &mut IdMap, counters: &mut SyncCounters) {
    if let Some(task_id) = op.task_id.as_deref() {
        id_map.remove(task_id);
    }

    match op.operation_type {
        OperationType::Delete => counters.deleted += 1,
        _ => counters.skipped += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{HttpMethod, ResponseBody};

    fn op(operation_type: OperationType, task_id: &str, event_id: Option<&str>) -> BatchOp {
        BatchOp {
            method: HttpMethod::Post,
            path: "events".to_string(),
            body: None,
            operation_type,
            task_id: Some(task_id.to_string()),
            original_event_id: event_id.map(str::to_string),
        }
    }

    fn result(status: u16, body: ResponseBody) -> BatchResult {
        BatchResult { status, body }
    }

    #[test]
    fn insert_success_populates_id_map() {
        let mut id_map = IdMap::new();
        let ops = vec![op(OperationType::Insert, "t1", None)];
        let results = vec![result(200, ResponseBody::Json(serde_json::json!({"id": "e1"})))];
        let counters = apply_results(&ops, &results, &mut id_map);
        assert_eq!(counters.created, 1);
        assert_eq!(id_map.get("t1"), Some("e1"));
    }

    #[test]
    fn delete_success_removes_id_map_entry() {
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        let ops = vec![op(OperationType::Delete, "t1", Some("e1"))];
        let results = vec![result(204, ResponseBody::Empty)];
        let counters = apply_results(&ops, &results, &mut id_map);
        assert_eq!(counters.deleted, 1);
        assert_eq!(id_map.get("t1"), None);
    }

    #[test]
    fn gone_on_update_prunes_mapping_without_counting_as_error() {
        let mut id_map = IdMap::new();
        id_map.insert("t1", "e1");
        let ops = vec![op(OperationType::Update, "t1", Some("e1"))];
        let results = vec![result(404, ResponseBody::Empty)];
        let counters = apply_results(&ops, &results, &mut id_map);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.errors, 0);
        assert_eq!(id_map.get("t1"), None);
    }

    #[test]
    fn unauthorized_is_classified_as_auth_error() {
        let mut id_map = IdMap::new();
        let ops = vec![op(OperationType::Insert, "t1", None)];
        let results = vec![result(401, ResponseBody::Empty)];
        let counters = apply_results(&ops, &results, &mut id_map);
        assert_eq!(counters.auth_errors, 1);
    }
}
