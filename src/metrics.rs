use tracing::trace;

// Trace-based counters; the Prometheus recorder installed in `main` renders
// whatever the exporter has collected at `/metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "trendforge.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "trendforge.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn job_transition(stage: &'static str, status: &'static str) {
    trace!(
        target = "trendforge.metrics",
        stage = stage,
        status = status,
        "job_transition"
    );
}

pub fn recovery_attempt(kind: &'static str, outcome: &'static str) {
    trace!(
        target = "trendforge.metrics",
        kind = kind,
        outcome = outcome,
        "recovery_attempt_total_inc"
    );
}
