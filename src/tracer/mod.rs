//! Execution Tracer — an append-only event log and metrics aggregator.
//!
//! Every privileged action taken during a run is recorded here as a
//! [`TraceEvent`]; [`Tracer::trace`] freezes the log into a final
//! [`ExecutionTrace`] for the caller. The tracer never fails: redaction
//! errors are swallowed by emitting a placeholder event instead of
//! propagating.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const REDACTED: &str = "***redacted***";
const TRUNCATED_MARKER: &str = "...<truncated>";
const MAX_STRING_LEN: usize = 1_000;
const SENSITIVE_SUBSTRINGS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "auth",
    "credential",
    "private",
    "confidential",
];

// ─── Data model ───────────────────────────────────────────────────────────────

/// One entry in the append-only execution timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Monotonic milliseconds since the run started.
    pub timestamp: u64,
    pub data: Value,
}

/// Token accounting, split by prompt/completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// Derived metrics, updated incrementally on every event append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceMetrics {
    pub wall_ms: u64,
    pub tool_call_count: u64,
    pub llm_call_count: u64,
    pub token_usage: TokenUsage,
    pub cost_usd: f64,
}

/// The final, frozen record of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub events: Vec<TraceEvent>,
    pub metrics: TraceMetrics,
    pub success: bool,
    pub error: Option<String>,
}

/// A snapshot of current resource usage, as returned by `get_quota_usage`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub tool_calls: u64,
    pub tokens: u64,
    pub wall_ms: u64,
    pub cost_usd: f64,
}

// ─── Redaction ────────────────────────────────────────────────────────────────

/// Recursively redact sensitive fields and truncate long strings in a JSON
/// payload tree. Pure function; never fails.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_owned()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_STRING_LEN {
        let head: String = s.chars().take(MAX_STRING_LEN).collect();
        format!("{head}{TRUNCATED_MARKER}")
    } else {
        s.to_owned()
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

// ─── Tracer ───────────────────────────────────────────────────────────────────

struct TracerState {
    events: Vec<TraceEvent>,
    metrics: TraceMetrics,
}

/// Append-only event log and metrics aggregator for a single run.
///
/// Fresh per run; never shared between runs.
pub struct Tracer {
    id: String,
    start_instant: Instant,
    start_time: chrono::DateTime<chrono::Utc>,
    state: Mutex<TracerState>,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_instant: Instant::now(),
            start_time: chrono::Utc::now(),
            state: Mutex::new(TracerState {
                events: Vec::new(),
                metrics: TraceMetrics::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_instant.elapsed().as_millis() as u64
    }

    /// Append one event with a fresh id and the current monotonic timestamp.
    /// The payload passes through [`redact`] before storage.
    pub fn emit(&self, kind: &str, data: Value) {
        let redacted = redact(&data);

        let event = TraceEvent {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_owned(),
            timestamp: self.elapsed_ms(),
            data: redacted,
        };

        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply_metric_update(&mut state.metrics, &event);
        state.metrics.wall_ms = event.timestamp;
        state.events.push(event);
    }

    /// Emit a `cost_recorded` event and add `usd` to the running cost.
    pub fn record_cost(&self, usd: f64) {
        self.emit("cost_recorded", serde_json::json!({ "usd": usd }));
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.metrics.cost_usd += usd;
    }

    /// Snapshot of current usage for quota-checking purposes.
    pub fn current_usage(&self) -> UsageSnapshot {
        let state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        UsageSnapshot {
            tool_calls: state.metrics.tool_call_count,
            tokens: state.metrics.token_usage.total,
            wall_ms: self.elapsed_ms(),
            cost_usd: state.metrics.cost_usd,
        }
    }

    /// Add an LLM call's actual token usage to the run's cumulative total.
    /// Called once per call, after `llm_call_success` is emitted, so the
    /// estimate used for quota-checking never itself lands in the trace.
    pub fn reconcile_tokens(&self, actual: TokenUsage) {
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.metrics.token_usage.prompt += actual.prompt;
        state.metrics.token_usage.completion += actual.completion;
        state.metrics.token_usage.total += actual.total;
    }

    /// Produce the final, frozen [`ExecutionTrace`].
    ///
    /// `success` is false if any emitted event type contains the substring
    /// `error`, unless overridden by an explicit `forced_failure`.
    pub fn trace(&self, forced_error: Option<String>) -> ExecutionTrace {
        let state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let any_error_event = state.events.iter().any(|e| e.kind.contains("error"));
        let success = forced_error.is_none() && !any_error_event;
        ExecutionTrace {
            id: self.id.clone(),
            start_time: self.start_time,
            end_time: chrono::Utc::now(),
            events: state.events.clone(),
            metrics: state.metrics.clone(),
            success,
            error: forced_error,
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_metric_update(metrics: &mut TraceMetrics, event: &TraceEvent) {
    match event.kind.as_str() {
        "tool_call_start" => metrics.tool_call_count += 1,
        "llm_call_start" => metrics.llm_call_count += 1,
        // Token accounting for `llm_call_success` happens in `reconcile_tokens`,
        // the sole writer of `token_usage`, so a call's actual usage is never
        // counted twice.
        _ => {}
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let payload = serde_json::json!({
            "api_key": "sk-live-123",
            "nested": { "user_token": "abc", "ok": "fine" },
            "list": [{ "password": "hunter2" }],
        });
        let redacted = redact(&payload);
        assert_eq!(redacted["api_key"], REDACTED);
        assert_eq!(redacted["nested"]["user_token"], REDACTED);
        assert_eq!(redacted["nested"]["ok"], "fine");
        assert_eq!(redacted["list"][0]["password"], REDACTED);
    }

    #[test]
    fn truncates_long_strings() {
        let long = "x".repeat(2_000);
        let redacted = redact(&Value::String(long));
        let s = redacted.as_str().unwrap();
        assert!(s.ends_with(TRUNCATED_MARKER));
        assert!(s.len() < 2_000);
    }

    #[test]
    fn emit_appends_in_order() {
        let tracer = Tracer::new();
        tracer.emit("execution_start", serde_json::json!({}));
        tracer.emit("tool_call_start", serde_json::json!({ "name": "echo" }));
        tracer.emit("tool_call_success", serde_json::json!({}));
        let trace = tracer.trace(None);
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.events[0].kind, "execution_start");
        assert_eq!(trace.events[1].kind, "tool_call_start");
        assert_eq!(trace.metrics.tool_call_count, 1);
    }

    #[test]
    fn trace_success_false_when_error_event_present() {
        let tracer = Tracer::new();
        tracer.emit("tool_call_error", serde_json::json!({ "message": "boom" }));
        let trace = tracer.trace(None);
        assert!(!trace.success);
    }

    #[test]
    fn trace_end_time_after_start_time() {
        let tracer = Tracer::new();
        tracer.emit("execution_start", serde_json::json!({}));
        let trace = tracer.trace(None);
        assert!(trace.end_time >= trace.start_time);
    }

    #[test]
    fn record_cost_accumulates() {
        let tracer = Tracer::new();
        tracer.record_cost(0.25);
        tracer.record_cost(0.10);
        let usage = tracer.current_usage();
        assert!((usage.cost_usd - 0.35).abs() < 1e-9);
    }

    #[test]
    fn llm_call_success_event_alone_does_not_touch_token_usage() {
        let tracer = Tracer::new();
        tracer.emit(
            "llm_call_success",
            serde_json::json!({ "usage": { "prompt": 10, "completion": 5, "total": 15 } }),
        );
        let usage = tracer.current_usage();
        assert_eq!(usage.tokens, 0);
    }

    #[test]
    fn reconcile_tokens_accumulates_across_calls() {
        let tracer = Tracer::new();
        tracer.reconcile_tokens(TokenUsage { prompt: 100, completion: 0, total: 100 });
        tracer.reconcile_tokens(TokenUsage { prompt: 8, completion: 4, total: 12 });
        let usage = tracer.current_usage();
        assert_eq!(usage.tokens, 112);
    }
}
