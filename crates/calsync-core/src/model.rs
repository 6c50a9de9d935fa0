use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Marker the core stamps on every event it creates; ownership filter keys
/// off this field being present and equal to `"true"`.
pub const GCAL_SYNC_FLAG: &str = "isGcalSync";
pub const GCAL_TASK_ID_FIELD: &str = "obsidianTaskId";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
    #[serde(rename = "none")]
    None,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::None
    }
}

/// Parsed local task record. Discarded at the end of every sync run; see
/// SPEC_FULL.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub summary: String,
    pub is_completed: bool,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub scheduled_date: Option<String>,
    pub created_date: Option<String>,
    pub completion_date: Option<String>,
    pub priority: Priority,
    pub recurrence_rule: Option<String>,
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
    pub tags: BTreeSet<String>,
    pub block_anchor: Option<String>,
    pub source_path: String,
    pub source_line: usize,
}

impl Task {
    pub fn has_time_component(value: &str) -> bool {
        value.contains('T') || value.contains(' ')
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Confirmed,
    Cancelled,
}

impl Default for EventStatus {
    fn default() -> Self {
        EventStatus::Confirmed
    }
}

/// Either `{date}` or `{dateTime, timeZone?}`, matching the calendar API's
/// event date/time union (SPEC_FULL.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    pub fn all_day(date: impl Into<String>) -> Self {
        Self {
            date: Some(date.into()),
            date_time: None,
            time_zone: None,
        }
    }

    pub fn timed(date_time: impl Into<String>) -> Self {
        Self {
            date: None,
            date_time: Some(date_time.into()),
            time_zone: None,
        }
    }
}

/// The fields this core reads/writes from a remote calendar event. Only
/// plugin-owned events (extendedProperties.private.isGcalSync == "true")
/// are ever targeted by a `BatchOp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: String,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<EventDateTime>,
    #[serde(default)]
    pub end: Option<EventDateTime>,
    #[serde(default)]
    pub recurrence: Vec<String>,
    #[serde(default, rename = "extendedProperties")]
    pub extended_properties: ExtendedProperties,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default)]
    pub private: BTreeMap<String, String>,
}

impl RemoteEvent {
    pub fn is_plugin_owned(&self) -> bool {
        self.extended_properties
            .private
            .get(GCAL_SYNC_FLAG)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn obsidian_task_id(&self) -> Option<&str> {
        self.extended_properties
            .private
            .get(GCAL_TASK_ID_FIELD)
            .map(String::as_str)
    }
}

/// Persistent `Task.id -> RemoteEvent.id` mapping. Mutated only by the
/// result processor (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdMap(pub BTreeMap<String, String>);

impl IdMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, task_id: &str) -> Option<&str> {
        self.0.get(task_id).map(String::as_str)
    }

    pub fn insert(&mut self, task_id: impl Into<String>, event_id: impl Into<String>) {
        self.0.insert(task_id.into(), event_id.into());
    }

    pub fn remove(&mut self, task_id: &str) -> Option<String> {
        self.0.remove(task_id)
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.0.values().any(|v| v == event_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Patch,
    Delete,
}

/// One reconciliation action produced by the planner and consumed by the
/// batch executor (SPEC_FULL.md §4.3/§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOp {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    pub operation_type: OperationType,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub original_event_id: Option<String>,
}

impl BatchOp {
    /// Every mutating op targets exactly one remote event id, except an
    /// insert (no event exists yet). Used to enforce the "no two ops for
    /// the same event id in one sub-batch" invariant (SPEC_FULL.md §5).
    pub fn target_event_id(&self) -> Option<&str> {
        self.original_event_id.as_deref()
    }
}

/// Inner batch-part body, modeled as a tagged variant rather than raw
/// `serde_json::Value` so the result processor can pull `id`/`error.message`
/// without re-parsing (DESIGN NOTES: "dynamic typing").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Empty,
}

impl ResponseBody {
    pub fn id(&self) -> Option<&str> {
        match self {
            ResponseBody::Json(v) => v.get("id").and_then(|v| v.as_str()),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            ResponseBody::Json(v) => v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string),
            ResponseBody::Text(t) => Some(t.clone()),
            ResponseBody::Empty => None,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            ResponseBody::Json(v) => v.get("summary").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Per-part batch result, paired positionally with the request that
/// produced it (SPEC_FULL.md §4.4/§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: u16,
    pub body: ResponseBody,
}

/// The only persisted secret; access tokens live in memory only
/// (SPEC_FULL.md §3, §4.6).
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
    pub scope: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expiry", &self.expiry)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Credentials {
    pub fn expires_within(&self, minutes: i64) -> bool {
        self.expiry <= Utc::now() + chrono::Duration::minutes(minutes)
    }
}

/// Executor tuning parameters, persisted alongside settings (SPEC_FULL.md
/// §6 persisted state: "executor tuning params").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorTuning {
    pub max_batch_per_http: usize,
    pub max_in_flight_batches: usize,
    pub min_desired_batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub rate_error_cooldown_ms: u64,
    pub latency_sla_ms: u64,
    pub latency_window: usize,
    pub clean_runs_to_increase: u32,
    pub max_retry_attempts: u32,
}

impl Default for ExecutorTuning {
    fn default() -> Self {
        Self {
            max_batch_per_http: 50,
            max_in_flight_batches: 2,
            min_desired_batch_size: 5,
            inter_batch_delay_ms: 100,
            rate_error_cooldown_ms: 2_000,
            latency_sla_ms: 4_000,
            latency_window: 5,
            clean_runs_to_increase: 3,
            max_retry_attempts: 4,
        }
    }
}

/// Settings snapshot captured by value at the start of a sync run
/// (SPEC_FULL.md §3: concurrent edits must not perturb an in-flight run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_port: u16,
    pub calendar_id: String,
    pub sync_interval_minutes: u32,
    pub auto_sync: bool,
    pub default_duration_minutes: i64,
    pub include_description_metadata: bool,
    pub remember_passphrase: bool,
    pub executor: ExecutorTuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            redirect_port: 42813,
            calendar_id: "primary".to_string(),
            sync_interval_minutes: 15,
            auto_sync: true,
            default_duration_minutes: 30,
            include_description_metadata: true,
            remember_passphrase: false,
            executor: ExecutorTuning::default(),
        }
    }
}

/// Run summary surfaced to the host (SPEC_FULL.md §7).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
    pub errors: u32,
    pub auth_errors: u32,
}

impl SyncCounters {
    pub fn merge(&mut self, other: SyncCounters) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.auth_errors += other.auth_errors;
    }
}
