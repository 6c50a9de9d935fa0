use crate::wire;
use crate::CalendarError;
use calsync_core::{BatchOp, BatchResult, ExecutorTuning, ResponseBody};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BATCH_ENDPOINT_URL: &str = "https://www.googleapis.com/batch/calendar/v3";

/// AIMD state for sub-batch sizing, owned by one `execute_all` call — not
/// a global (spec.md §4.4, DESIGN NOTES "no global singletons").
struct BatchSizer {
    desired: usize,
    min: usize,
    max: usize,
    clean_runs: u32,
    clean_runs_needed: u32,
}

impl BatchSizer {
    /// `desiredBatchSize` "starts at settings value" (spec.md §4.4) — this
    /// tuning has no separate starting-size knob, so it starts at
    /// `maxBatchPerHttp` and only ever shrinks from there, exactly like the
    /// settings value it stands in for.
    fn new(tuning: &ExecutorTuning) -> Self {
        Self {
            desired: tuning.max_batch_per_http.max(tuning.min_desired_batch_size).max(1),
            min: tuning.min_desired_batch_size.max(1),
            max: tuning.max_batch_per_http.max(1),
            clean_runs: 0,
            clean_runs_needed: tuning.clean_runs_to_increase.max(1),
        }
    }

    fn current(&self) -> usize {
        self.desired
    }

    fn record_clean(&mut self) {
        self.clean_runs += 1;
        if self.clean_runs >= self.clean_runs_needed {
            self.clean_runs = 0;
            self.desired = (self.desired + 1).min(self.max);
        }
    }

    fn record_degraded(&mut self) {
        self.clean_runs = 0;
        self.desired = (self.desired / 2).max(self.min);
    }
}

/// Splits off up to `max_in_flight` chunks of at most `desired_size` ops
/// each from the front of `remaining` (spec.md §4.4, testable property 6:
/// "no emitted sub-batch contains more than `maxBatchPerHttp` parts; at
/// most `maxInFlightBatches` sub-batches are in flight at any instant").
/// Pulled out of `execute_all` so the chunking shape can be asserted
/// without driving the network transport.
fn build_wave_chunks(
    remaining: &mut VecDeque<(usize, BatchOp)>,
    desired_size: usize,
    max_in_flight: usize,
) -> Vec<Vec<(usize, BatchOp)>> {
    let mut wave_chunks = Vec::new();
    for _ in 0..max_in_flight.max(1) {
        if remaining.is_empty() {
            break;
        }
        let take = desired_size.min(remaining.len());
        let chunk: Vec<(usize, BatchOp)> = remaining.drain(..take).collect();
        wave_chunks.push(chunk);
    }
    wave_chunks
}

struct SubBatchOutcome {
    indices: Vec<usize>,
    results: Vec<BatchResult>,
    rate_limited: bool,
    latency_ms: u64,
}

/// Runs the reconciliation plan's ops against the batch endpoint:
/// sub-batch chunking, AIMD sizing, bounded concurrency, retry, and
/// multipart/mixed transport (spec.md §4.4). Returns the ops and results
/// in lockstep so the result processor can zip them directly; ops never
/// attempted because the run was cancelled get a synthetic result with
/// status 0.
pub async fn execute_all<F, Fut>(
    http: reqwest::Client,
    calendar_id: String,
    ops: Vec<BatchOp>,
    tuning: ExecutorTuning,
    ensure_access_token: F,
    cancelled: Arc<AtomicBool>,
) -> (Vec<BatchOp>, Vec<BatchResult>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, CalendarError>> + Send + 'static,
{
    let run_started = Instant::now();
    let ensure_access_token = Arc::new(ensure_access_token);
    let mut sizer = BatchSizer::new(&tuning);
    let mut ordered: Vec<Option<BatchResult>> = (0..ops.len()).map(|_| None).collect();
    let mut remaining: VecDeque<(usize, BatchOp)> = ops.iter().cloned().enumerate().collect();
    let mut was_cancelled = false;
    let mut first_wave = true;

    while !remaining.is_empty() {
        if cancelled.load(Ordering::SeqCst) {
            was_cancelled = true;
            break;
        }

        if !first_wave && tuning.inter_batch_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(tuning.inter_batch_delay_ms)).await;
        }
        first_wave = false;

        let wave_chunks = build_wave_chunks(&mut remaining, sizer.current(), tuning.max_in_flight_batches);

        let futures_iter = wave_chunks.into_iter().map(|chunk| {
            let http = http.clone();
            let calendar_id = calendar_id.clone();
            let ensure_access_token = ensure_access_token.clone();
            let max_attempts = tuning.max_retry_attempts.max(1);
            async move { run_sub_batch(&http, &calendar_id, chunk, ensure_access_token, max_attempts).await }
        });

        let wave_results: Vec<SubBatchOutcome> = futures::future::join_all(futures_iter).await;

        let mut wave_rate_limited = false;
        let mut wave_max_latency_ms = 0u64;
        for outcome in wave_results {
            wave_rate_limited = wave_rate_limited || outcome.rate_limited;
            wave_max_latency_ms = wave_max_latency_ms.max(outcome.latency_ms);
            for (index, result) in outcome.indices.into_iter().zip(outcome.results) {
                ordered[index] = Some(result);
            }
        }

        if wave_rate_limited {
            sizer.record_degraded();
            tokio::time::sleep(Duration::from_millis(tuning.rate_error_cooldown_ms)).await;
        } else if wave_max_latency_ms > tuning.latency_sla_ms {
            sizer.record_degraded();
        } else {
            sizer.record_clean();
        }
    }

    tracing::info!(
        elapsed_ms = run_started.elapsed().as_millis() as u64,
        cancelled = was_cancelled,
        "execute_all_batches finished"
    );

    let results = ordered
        .into_iter()
        .map(|maybe| {
            maybe.unwrap_or(BatchResult {
                status: 0,
                body: ResponseBody::Json(serde_json::json!({
                    "error": { "message": "not attempted: run was cancelled" }
                })),
            })
        })
        .collect();

    (ops, results)
}

async fn run_sub_batch<F, Fut>(
    http: &reqwest::Client,
    calendar_id: &str,
    chunk: Vec<(usize, BatchOp)>,
    ensure_access_token: Arc<F>,
    max_attempts: u32,
) -> SubBatchOutcome
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, CalendarError>> + Send + 'static,
{
    let indices: Vec<usize> = chunk.iter().map(|(index, _)| *index).collect();
    let ops: Vec<BatchOp> = chunk.into_iter().map(|(_, op)| op).collect();
    let boundary = format!("calsync_{:016x}", rand::random::<u64>());
    let body = wire::encode(&ops, calendar_id, &boundary);

    let span = tracing::info_span!("sub_batch", size = ops.len());
    let _entered = span.enter();

    let started = Instant::now();
    let mut attempt = 0u32;
    let mut rate_limited = false;

    loop {
        attempt += 1;
        let access_token = match ensure_access_token().await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = %err, "failed to obtain access token for sub-batch");
                return synthetic_error_outcome(indices, started, "failed to obtain access token");
            }
        };

        let send_result = http
            .post(BATCH_ENDPOINT_URL)
            .bearer_auth(&access_token)
            .header("Content-Type", format!("multipart/mixed; boundary={boundary}"))
            .body(body.clone())
            .send()
            .await;

        let response = match send_result {
            Ok(response) => response,
            Err(err) => {
                if attempt < max_attempts {
                    sleep_backoff(attempt).await;
                    continue;
                }
                tracing::warn!(error = %err, attempt, "sub-batch connection failure exhausted retries");
                return synthetic_error_outcome(indices, started, "connection failure");
            }
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            if attempt < max_attempts {
                sleep_backoff(attempt).await;
                continue;
            }
            tracing::warn!(status = %status, attempt, "sub-batch outer retry budget exhausted");
            return synthetic_error_outcome(indices, started, "outer retry budget exhausted");
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "failed reading sub-batch response body");
                return synthetic_error_outcome(indices, started, "failed reading response body");
            }
        };

        let results = match wire::decode(&text, &boundary, ops.len()) {
            Some(results) => results,
            None => {
                tracing::warn!("sub-batch response part count did not match request count");
                return synthetic_error_outcome(indices, started, "response part count mismatch");
            }
        };

        rate_limited = results
            .iter()
            .any(|result| result.status == 429 || (result.status == 403 && is_rate_limit_signal(result)));

        return SubBatchOutcome {
            indices,
            results,
            rate_limited,
            latency_ms: started.elapsed().as_millis() as u64,
        };
    }
}

fn is_rate_limit_signal(result: &BatchResult) -> bool {
    result
        .body
        .error_message()
        .map(|message| message.to_ascii_lowercase().contains("rate"))
        .unwrap_or(false)
}

fn synthetic_error_outcome(indices: Vec<usize>, started: Instant, message: &str) -> SubBatchOutcome {
    let results = indices
        .iter()
        .map(|_| BatchResult {
            status: 599,
            body: ResponseBody::Json(serde_json::json!({ "error": { "message": message } })),
        })
        .collect();

    SubBatchOutcome {
        indices,
        results,
        rate_limited: false,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

async fn sleep_backoff(attempt: u32) {
    let base_ms = 200u64.saturating_mul(1u64 << attempt.min(6));
    let jitter_ms = (rand::random::<f64>() * base_ms as f64 * 0.25) as u64;
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{HttpMethod, OperationType};

    fn make_ops(n: usize) -> Vec<BatchOp> {
        (0..n)
            .map(|i| BatchOp {
                method: HttpMethod::Post,
                path: "events".to_string(),
                body: Some(serde_json::json!({"summary": format!("task {i}")})),
                operation_type: OperationType::Insert,
                task_id: Some(format!("t{i}")),
                original_event_id: None,
            })
            .collect()
    }

    #[test]
    fn batch_sizer_halves_on_degraded_and_floors_at_min() {
        let tuning = ExecutorTuning {
            min_desired_batch_size: 5,
            max_batch_per_http: 50,
            clean_runs_to_increase: 3,
            ..ExecutorTuning::default()
        };
        let mut sizer = BatchSizer::new(&tuning);
        sizer.desired = 8;
        sizer.record_degraded();
        assert_eq!(sizer.current(), 5);
    }

    #[test]
    fn batch_sizer_increases_after_n_clean_runs() {
        let tuning = ExecutorTuning {
            min_desired_batch_size: 5,
            max_batch_per_http: 50,
            clean_runs_to_increase: 2,
            ..ExecutorTuning::default()
        };
        let mut sizer = BatchSizer::new(&tuning);
        sizer.desired = 5;
        sizer.record_clean();
        assert_eq!(sizer.current(), 5);
        sizer.record_clean();
        assert_eq!(sizer.current(), 6);
    }

    #[test]
    fn batch_sizer_starts_at_max_batch_per_http() {
        let tuning = ExecutorTuning {
            min_desired_batch_size: 5,
            max_batch_per_http: 50,
            ..ExecutorTuning::default()
        };
        assert_eq!(BatchSizer::new(&tuning).current(), 50);
    }

    #[test]
    fn make_ops_builds_expected_count() {
        assert_eq!(make_ops(3).len(), 3);
    }

    #[test]
    fn wave_chunking_splits_127_ops_into_50_50_27() {
        // 127 operations, maxBatchPerHttp=50, maxInFlightBatches=2
        // -> sub-batches of sizes 50, 50, 27; peak concurrency 2.
        let ops = make_ops(127);
        let mut remaining: VecDeque<(usize, BatchOp)> = ops.into_iter().enumerate().collect();

        let wave1 = build_wave_chunks(&mut remaining, 50, 2);
        assert_eq!(wave1.len(), 2, "peak concurrency should be maxInFlightBatches");
        assert_eq!(wave1.iter().map(Vec::len).collect::<Vec<_>>(), vec![50, 50]);

        let wave2 = build_wave_chunks(&mut remaining, 50, 2);
        assert_eq!(wave2.iter().map(Vec::len).collect::<Vec<_>>(), vec![27]);

        assert!(remaining.is_empty());
        let total: usize = wave1.iter().chain(wave2.iter()).map(Vec::len).sum();
        assert_eq!(total, 127);
    }

    #[test]
    fn wave_chunking_never_exceeds_max_in_flight_or_batch_size() {
        let ops = make_ops(20);
        let mut remaining: VecDeque<(usize, BatchOp)> = ops.into_iter().enumerate().collect();

        let wave1 = build_wave_chunks(&mut remaining, 5, 3);
        assert_eq!(wave1.len(), 3, "capped at maxInFlightBatches even though more ops remain");
        assert!(wave1.iter().all(|chunk| chunk.len() <= 5));
        assert_eq!(remaining.len(), 5);

        let wave2 = build_wave_chunks(&mut remaining, 5, 3);
        assert_eq!(wave2.iter().map(Vec::len).collect::<Vec<_>>(), vec![5]);
        assert!(remaining.is_empty());
    }
}
