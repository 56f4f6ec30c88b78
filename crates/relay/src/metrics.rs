use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use tablesync_common::protocol::ws::MessageType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    submit_outcomes_total: Mutex<HashMap<String, u64>>,
    cas_retries_total: AtomicU64,
    presence_dropped_total: AtomicU64,
    notifications_dropped_total: AtomicU64,
    slow_consumer_closes_total: AtomicU64,
    ws_connections: AtomicI64,
}

pub const SUBMIT_OUTCOMES: [&str; 8] = [
    "committed",
    "validation",
    "conflict_exhausted",
    "invalid_version",
    "permission_denied",
    "transform_error",
    "timeout",
    "transport_error",
];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let submit_outcomes_total =
            SUBMIT_OUTCOMES.iter().map(|outcome| (outcome.to_string(), 0)).collect();

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            submit_outcomes_total: Mutex::new(submit_outcomes_total),
            cas_retries_total: AtomicU64::new(0),
            presence_dropped_total: AtomicU64::new(0),
            notifications_dropped_total: AtomicU64::new(0),
            slow_consumer_closes_total: AtomicU64::new(0),
            ws_connections: AtomicI64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

/// Prometheus text for the installed registry; zeroed series when none is set.
pub fn render_global() -> String {
    match global_metrics() {
        Some(metrics) => metrics.render_prometheus(),
        None => RelayMetrics::default().render_prometheus(),
    }
}

pub fn record_ws_message(message_type: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(message_type, is_error);
    }
}

pub fn record_submit_outcome(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_submit_outcome(outcome);
    }
}

pub fn increment_cas_retries() {
    if let Some(metrics) = global_metrics() {
        metrics.cas_retries_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a droppable push lost to a full outbound queue.
pub fn record_dropped_push(message_type: MessageType) {
    if let Some(metrics) = global_metrics() {
        metrics.record_dropped_push(message_type);
    }
}

pub fn increment_slow_consumer_closes() {
    if let Some(metrics) = global_metrics() {
        metrics.slow_consumer_closes_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn adjust_ws_connections(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.ws_connections.fetch_add(delta, Ordering::Relaxed);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_message(&self, message_type: &str, is_error: bool) {
        let label = normalize_label(message_type);
        increment_label_counter(&self.ws_messages_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_submit_outcome(&self, outcome: &str) {
        let label = if SUBMIT_OUTCOMES.contains(&outcome) { outcome } else { "unknown" };
        increment_label_counter(&self.submit_outcomes_total, label, 1);
    }

    pub fn record_dropped_push(&self, message_type: MessageType) {
        let counter = match message_type {
            MessageType::Notification => &self.notifications_dropped_total,
            _ => &self.presence_dropped_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_messages_total Total inbound websocket messages by type.\n");
        output.push_str("# TYPE relay_ws_messages_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_messages_total", "type", &self.ws_messages_total);

        output.push_str("# HELP relay_ws_errors_total Inbound websocket messages answered with an error.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "type", &self.ws_errors_total);

        output.push_str("# HELP relay_submit_total Submissions by outcome.\n");
        output.push_str("# TYPE relay_submit_total counter\n");
        append_label_counter_lines(&mut output, "relay_submit_total", "outcome", &self.submit_outcomes_total);

        output.push_str("# HELP relay_cas_retries_total Compare-and-swap conflicts that triggered a retry.\n");
        output.push_str("# TYPE relay_cas_retries_total counter\n");
        output.push_str(&format!(
            "relay_cas_retries_total {}\n",
            self.cas_retries_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP relay_presence_dropped_total Presence pushes dropped for slow consumers.\n");
        output.push_str("# TYPE relay_presence_dropped_total counter\n");
        output.push_str(&format!(
            "relay_presence_dropped_total {}\n",
            self.presence_dropped_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP relay_notifications_dropped_total Notification pushes dropped for slow consumers.\n");
        output.push_str("# TYPE relay_notifications_dropped_total counter\n");
        output.push_str(&format!(
            "relay_notifications_dropped_total {}\n",
            self.notifications_dropped_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP relay_slow_consumer_closes_total Connections closed because a commit could not be queued.\n");
        output.push_str("# TYPE relay_slow_consumer_closes_total counter\n");
        output.push_str(&format!(
            "relay_slow_consumer_closes_total {}\n",
            self.slow_consumer_closes_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP relay_ws_connections Open websocket connections.\n");
        output.push_str("# TYPE relay_ws_connections gauge\n");
        output.push_str(&format!(
            "relay_ws_connections {}\n",
            self.ws_connections.load(Ordering::Relaxed).max(0)
        ));

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapses document-addressed routes so labels stay bounded.
fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    match segments.as_slice() {
        [] => "/".to_string(),
        ["snapshot", _, _] => "/snapshot/{collection}/{id}".to_string(),
        ["ops", _, _] => "/ops/{collection}/{id}".to_string(),
        ["query", _] => "/query/{collection}".to_string(),
        ["snapshots", _] => "/snapshots/{collection}".to_string(),
        _ => {
            let normalized: Vec<String> = segments
                .iter()
                .map(|segment| {
                    if uuid::Uuid::parse_str(segment).is_ok() {
                        "{uuid}".to_string()
                    } else if segment.chars().all(|character| character.is_ascii_digit()) {
                        "{number}".to_string()
                    } else {
                        segment.to_string()
                    }
                })
                .collect();
            format!("/{}", normalized.join("/"))
        }
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
