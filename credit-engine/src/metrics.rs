//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the engine.
//!
//! # Metrics
//!
//! - `credit_contributions_created_total` / `credit_contributions_paid_total`
//! - `credit_credits_issued_total` / `credit_issuance_noop_total`
//! - `credit_cycles_started_total` / `credit_cycles_closed_total`
//! - `credit_groups_terminated_total`
//! - `credit_consumptions_total` / `credit_reversals_total`
//! - `credit_expired_contributions_total` / `credit_expired_credits_total`
//! - `credit_consumed_amount` - Histogram of purchase totals

use crate::events::EngineEvent;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Contributions created
    pub contributions_created: IntCounter,

    /// Contributions paid
    pub contributions_paid: IntCounter,

    /// Credits issued
    pub credits_issued: IntCounter,

    /// Issuance calls short-circuited by an existing active credit
    pub issuance_noops: IntCounter,

    /// Cycles started
    pub cycles_started: IntCounter,

    /// Cycles closed
    pub cycles_closed: IntCounter,

    /// Groups terminated
    pub groups_terminated: IntCounter,

    /// Consumption operations
    pub consumptions: IntCounter,

    /// Consumption reversals
    pub reversals: IntCounter,

    /// Contributions expired by the sweep
    pub expired_contributions: IntCounter,

    /// Credits expired by the sweep
    pub expired_credits: IntCounter,

    /// Purchase totals
    pub consumed_amount: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("credits_issued", &self.credits_issued.get())
            .field("cycles_closed", &self.cycles_closed.get())
            .field("consumptions", &self.consumptions.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let consumed_amount = Histogram::with_opts(
            HistogramOpts::new("credit_consumed_amount", "Histogram of purchase totals")
                .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
        )?;
        registry.register(Box::new(consumed_amount.clone()))?;

        Ok(Self {
            contributions_created: counter(
                &registry,
                "credit_contributions_created_total",
                "Total contributions created",
            )?,
            contributions_paid: counter(
                &registry,
                "credit_contributions_paid_total",
                "Total contributions paid",
            )?,
            credits_issued: counter(
                &registry,
                "credit_credits_issued_total",
                "Total credits issued",
            )?,
            issuance_noops: counter(
                &registry,
                "credit_issuance_noop_total",
                "Issuance calls that found an active credit",
            )?,
            cycles_started: counter(
                &registry,
                "credit_cycles_started_total",
                "Total cycles started",
            )?,
            cycles_closed: counter(&registry, "credit_cycles_closed_total", "Total cycles closed")?,
            groups_terminated: counter(
                &registry,
                "credit_groups_terminated_total",
                "Total groups terminated",
            )?,
            consumptions: counter(&registry, "credit_consumptions_total", "Total consumptions")?,
            reversals: counter(&registry, "credit_reversals_total", "Total consumption reversals")?,
            expired_contributions: counter(
                &registry,
                "credit_expired_contributions_total",
                "Contributions expired by the sweep",
            )?,
            expired_credits: counter(
                &registry,
                "credit_expired_credits_total",
                "Credits expired by the sweep",
            )?,
            consumed_amount,
            registry,
        })
    }

    /// Count committed events
    pub fn record_events(&self, events: &[EngineEvent]) {
        for event in events {
            match event {
                EngineEvent::ContributionPaid { .. } => self.contributions_paid.inc(),
                EngineEvent::CycleStarted { .. } => self.cycles_started.inc(),
                EngineEvent::CycleClosed { .. } => self.cycles_closed.inc(),
                EngineEvent::GroupTerminated { .. } => self.groups_terminated.inc(),
                EngineEvent::CreditIssued { .. } => self.credits_issued.inc(),
                EngineEvent::ConsumptionReversed { .. } => self.reversals.inc(),
                EngineEvent::CreditExhausted { .. } => {}
            }
        }
    }

    /// Record a committed purchase
    pub fn record_consumption(&self, total: f64) {
        self.consumptions.inc();
        self.consumed_amount.observe(total);
    }

    /// Record a sweep report
    pub fn record_sweep(&self, contributions: u64, credits: u64) {
        self.expired_contributions.inc_by(contributions);
        self.expired_credits.inc_by(credits);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
