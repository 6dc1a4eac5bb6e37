use tracing::trace;

// Trace-backed counters. The Prometheus recorder is installed in main; these
// helpers stay macro-free so tests never need a recorder.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "cardforge.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128, attempts: u32) {
    trace!(
        target = "cardforge.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        attempts = attempts,
        "stage_elapsed"
    );
}

pub fn stage_retry(stage: &'static str, attempt: u32) {
    trace!(
        target = "cardforge.metrics",
        stage = stage,
        attempt = attempt,
        "stage_retries_total_inc"
    );
}

pub fn task_transition(status: &'static str) {
    trace!(
        target = "cardforge.metrics",
        status = status,
        "task_transitions_total_inc"
    );
}
