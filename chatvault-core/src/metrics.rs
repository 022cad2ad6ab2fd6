//! Metrics facade for chatvault
//!
//! Counters go through the `metrics` crate. The library installs no
//! recorder; without one every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const MESSAGES_APPENDED: &str = "chatvault.messages.appended";
pub const CHUNKS_CREATED: &str = "chatvault.chunks.created";
pub const SESSIONS_CREATED: &str = "chatvault.sessions.created";
pub const SESSIONS_ARCHIVED: &str = "chatvault.sessions.archived";
pub const SESSIONS_PRUNED: &str = "chatvault.sessions.pruned";
pub const INTEGRITY_MISMATCH: &str = "chatvault.integrity.mismatch";
pub const SESSIONS_TOTAL: &str = "chatvault.sessions.total";
pub const MAINTENANCE_DURATION_MS: &str = "chatvault.maintenance.duration_ms";

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(MESSAGES_APPENDED, "Messages appended to chunks");
    describe_counter!(CHUNKS_CREATED, "Chunks opened");
    describe_counter!(SESSIONS_CREATED, "Sessions created");
    describe_counter!(SESSIONS_ARCHIVED, "Sessions archived for inactivity");
    describe_counter!(SESSIONS_PRUNED, "Archived sessions deleted by retention");
    describe_counter!(
        INTEGRITY_MISMATCH,
        "Decrypted payloads whose integrity tag did not match"
    );
    describe_gauge!(SESSIONS_TOTAL, "Sessions in the index at last stats read");
    describe_histogram!(
        MAINTENANCE_DURATION_MS,
        "Maintenance pass duration in milliseconds"
    );
}

pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        record_histogram(self.name, self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
