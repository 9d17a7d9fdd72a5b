use tracing::trace;

// Lightweight metrics helpers that stay safe without a recorder wired in.
// Counters are emitted as trace events and scraped from the Prometheus
// recorder installed in main.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "stocksync.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn sync_outcome(outcome: &'static str) {
    trace!(
        target = "stocksync.metrics",
        outcome = outcome,
        "orders_processed_inc"
    );
}

pub fn unsynced_listings(count: usize) {
    trace!(
        target = "stocksync.metrics",
        count = count as u64,
        "unsynced_listings_inc"
    );
}
