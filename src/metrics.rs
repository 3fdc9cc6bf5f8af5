use tracing::trace;

// Trace-based metric helpers; the Prometheus recorder in main picks up
// request-level series from tower-http, these cover domain events.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "pawtraits.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn slot_outcome(kind: &'static str, outcome: &'static str) {
    trace!(
        target = "pawtraits.metrics",
        kind = kind,
        outcome = outcome,
        "generation_slot_outcome"
    );
}

pub fn token_denied(reason: &'static str) {
    trace!(
        target = "pawtraits.metrics",
        reason = reason,
        "portal_token_denied"
    );
}
