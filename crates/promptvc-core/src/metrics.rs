//! Process-wide counters for the self-improvement loop.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`]. They never carry prompt-version state: the loop has no
//! notion of an "active" version.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cases_evaluated: AtomicU64,
    case_errors: AtomicU64,
    provider_calls: AtomicU64,
    provider_retries: AtomicU64,
    judge_parse_retries: AtomicU64,
    candidates_generated: AtomicU64,
    promotions: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cases_evaluated: u64,
    pub case_errors: u64,
    pub provider_calls: u64,
    pub provider_retries: u64,
    pub judge_parse_retries: u64,
    pub candidates_generated: u64,
    pub promotions: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, by: u64, name: &'static str) {
    counter.fetch_add(by, Ordering::Relaxed);
    tracing::trace!(metric = name, by, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cases_evaluated: AtomicU64::new(0),
            case_errors: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
            provider_retries: AtomicU64::new(0),
            judge_parse_retries: AtomicU64::new(0),
            candidates_generated: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
        }
    }

    pub fn inc_cases_evaluated(&self) {
        bump(&self.cases_evaluated, 1, "cases_evaluated");
    }

    pub fn inc_case_errors(&self) {
        bump(&self.case_errors, 1, "case_errors");
    }

    pub fn inc_provider_calls(&self) {
        bump(&self.provider_calls, 1, "provider_calls");
    }

    pub fn inc_provider_retries(&self) {
        bump(&self.provider_retries, 1, "provider_retries");
    }

    pub fn inc_judge_parse_retries(&self) {
        bump(&self.judge_parse_retries, 1, "judge_parse_retries");
    }

    pub fn add_candidates_generated(&self, n: u64) {
        bump(&self.candidates_generated, n, "candidates_generated");
    }

    pub fn inc_promotions(&self) {
        bump(&self.promotions, 1, "promotions");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cases_evaluated: self.cases_evaluated.load(Ordering::Relaxed),
            case_errors: self.case_errors.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_retries: self.provider_retries.load(Ordering::Relaxed),
            judge_parse_retries: self.judge_parse_retries.load(Ordering::Relaxed),
            candidates_generated: self.candidates_generated.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as one `info!` event. Call at the end of a loop run.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            cases_evaluated = s.cases_evaluated,
            case_errors = s.case_errors,
            provider_calls = s.provider_calls,
            provider_retries = s.provider_retries,
            judge_parse_retries = s.judge_parse_retries,
            candidates_generated = s.candidates_generated,
            promotions = s.promotions,
        );
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        for c in [
            &self.cases_evaluated,
            &self.case_errors,
            &self.provider_calls,
            &self.provider_retries,
            &self.judge_parse_retries,
            &self.candidates_generated,
            &self.promotions,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
