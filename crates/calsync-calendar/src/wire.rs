use calsync_core::{BatchOp, BatchResult, ResponseBody};
use regex::Regex;

/// Encodes a sub-batch as a `multipart/mixed` body. This is a bespoke wire
/// format, not `multipart/form-data`, so it is hand-assembled rather than
/// built with `reqwest::multipart::Form` (spec.md §4.4).
pub fn encode(ops: &[BatchOp], calendar_id: &str, boundary: &str) -> String {
    let mut out = String::new();

    for (index, op) in ops.iter().enumerate() {
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str("Content-Type: application/http\r\n");
        out.push_str(&format!("Content-ID: <item-{index}>\r\n\r\n"));

        let path = format!("/calendar/v3/calendars/{calendar_id}/{}", op.path);
        out.push_str(&format!("{} {path}\r\n", op.method.as_str()));

        match &op.body {
            Some(body) => {
                out.push_str("Content-Type: application/json\r\n\r\n");
                out.push_str(&serde_json::to_string(body).expect("batch op body serializes"));
                out.push_str("\r\n");
            }
            None => out.push_str("\r\n"),
        }
    }

    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

/// Parses a `multipart/mixed` batch response into one `BatchResult` per
/// part, in part order. Returns `None` if the part count does not match
/// `expected` — the caller treats this as a structural failure for the
/// whole sub-batch (spec.md §4.4).
pub fn decode(response_body: &str, boundary: &str, expected: usize) -> Option<Vec<BatchResult>> {
    let delimiter = format!("--{boundary}");
    let parts: Vec<&str> = response_body
        .split(delimiter.as_str())
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "--")
        .collect();

    let mut results = Vec::with_capacity(parts.len());
    for part in parts {
        if let Some(result) = parse_part(part) {
            results.push(result);
        }
    }

    if results.len() != expected {
        return None;
    }
    Some(results)
}

fn parse_part(part: &str) -> Option<BatchResult> {
    let status_re = Regex::new(r"HTTP/\d\.\d\s+(\d{3})").expect("valid status regex");
    let caps = status_re.captures(part)?;
    let status: u16 = caps.get(1)?.as_str().parse().ok()?;
    let after_status = &part[caps.get(0)?.end()..];

    let body_str = match after_status.find("\r\n\r\n").or_else(|| after_status.find("\n\n")) {
        Some(idx) => {
            let sep_len = if after_status[idx..].starts_with("\r\n\r\n") { 4 } else { 2 };
            after_status[idx + sep_len..].trim()
        }
        None => after_status.trim(),
    };

    let body = if status == 204 || body_str.is_empty() {
        ResponseBody::Empty
    } else if body_str.starts_with('{') || body_str.starts_with('[') {
        serde_json::from_str::<serde_json::Value>(body_str)
            .map(ResponseBody::Json)
            .unwrap_or_else(|_| ResponseBody::Text(body_str.to_string()))
    } else if (200..300).contains(&status) {
        ResponseBody::Json(serde_json::json!({ "message": body_str }))
    } else {
        ResponseBody::Json(serde_json::json!({ "error": { "message": body_str } }))
    };

    Some(BatchResult { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{HttpMethod, OperationType};

    #[test]
    fn round_trips_a_two_part_batch() {
        let ops = vec![
            BatchOp {
                method: HttpMethod::Post,
                path: "events".to_string(),
                body: Some(serde_json::json!({"summary": "Buy milk"})),
                operation_type: OperationType::Insert,
                task_id: Some("t1".to_string()),
                original_event_id: None,
            },
            BatchOp {
                method: HttpMethod::Delete,
                path: "events/e2".to_string(),
                body: None,
                operation_type: OperationType::Delete,
                task_id: Some("t2".to_string()),
                original_event_id: Some("e2".to_string()),
            },
        ];

        let encoded = encode(&ops, "primary", "batch_boundary");
        assert!(encoded.contains("POST /calendar/v3/calendars/primary/events"));
        assert!(encoded.contains("DELETE /calendar/v3/calendars/primary/events/e2"));

        let response = format!(
            "--batch_boundary\r\nContent-Type: application/http\r\nContent-ID: <item-0>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{{\"id\":\"e1\"}}\r\n--batch_boundary\r\nContent-Type: application/http\r\nContent-ID: <item-1>\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n\r\n--batch_boundary--\r\n"
        );

        let decoded = decode(&response, "batch_boundary", 2).expect("decodes");
        assert_eq!(decoded[0].status, 200);
        assert_eq!(decoded[0].body.id(), Some("e1"));
        assert_eq!(decoded[1].status, 204);
        assert!(matches!(decoded[1].body, ResponseBody::Empty));
    }

    #[test]
    fn part_count_mismatch_returns_none() {
        let response = "--b\r\nHTTP/1.1 200 OK\r\n\r\n{}\r\n--b--\r\n";
        assert!(decode(response, "b", 2).is_none());
    }

    #[test]
    fn non_json_error_text_is_wrapped() {
        let response =
            "--b\r\nHTTP/1.1 500 Internal Server Error\r\n\r\nsomething broke\r\n--b--\r\n";
        let decoded = decode(response, "b", 1).expect("decodes");
        assert_eq!(decoded[0].body.error_message().as_deref(), Some("something broke"));
    }
}
