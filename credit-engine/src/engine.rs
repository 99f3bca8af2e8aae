//! Engine facade
//!
//! Ties storage, services and collaborators into one synchronous API. Every
//! mutating call runs as a single transaction:
//!
//! 1. begin (takes the writer lock, captures `now` from the clock)
//! 2. run the service operation
//! 3. commit, or drop on error so nothing is written
//! 4. count the committed events and hand them to the notifier and audit sink
//!
//! # Example
//!
//! ```no_run
//! use credit_engine::{Amount, BeneficiaryRef, Config, CreditEngine, Directory, PeriodKind};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! fn main() -> credit_engine::Result<()> {
//!     let directory = Arc::new(Directory::new());
//!     let member = BeneficiaryRef::Member(Uuid::new_v4());
//!     directory.register(member);
//!
//!     let engine = CreditEngine::open(Config::default(), directory)?;
//!     let dues =
//!         engine.create_contribution(member, Amount::from_units(5000), PeriodKind::Monthly)?;
//!     let (_, credit) = engine.mark_contribution_paid(dues.contribution_id)?;
//!     println!("credit {}", credit.credit_id());
//!     Ok(())
//! }
//! ```

use crate::amount::Amount;
use crate::audit::HashChainAuditLog;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{AuditSink, Dispatcher, IdentityLookup, LogNotifier, Notifier, NullAudit};
use crate::consumption::{self, CreditConsumption, Inventory, Purchase, Reversal, StockLedger};
use crate::contribution::{self, ContributionTracker};
use crate::issuance::{self, CreditIssuance, IssueOutcome};
use crate::metrics::Metrics;
use crate::rotation::{self, CycleOutcome, RotationEngine, SharePayment};
use crate::storage::{Storage, Transaction};
use crate::sweeper::{SweepReport, Sweeper};
use crate::types::{
    BeneficiaryRef, ConsumptionRecord, Contribution, CreditSource, Cycle, CycleShare, Frequency,
    LineItem, Membership, PeriodKind, RotationGroup, SpendingCredit, StockItem,
};
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use uuid::Uuid;

/// Credit & rotation lifecycle engine
pub struct CreditEngine {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityLookup>,
    contributions: ContributionTracker,
    rotation: RotationEngine,
    issuance: CreditIssuance,
    consumption: CreditConsumption,
    sweeper: Sweeper,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    metrics: Metrics,
    config: Config,
}

impl std::fmt::Debug for CreditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditEngine")
            .field("storage", &self.storage)
            .field("service", &self.config.service_name)
            .finish_non_exhaustive()
    }
}

impl CreditEngine {
    /// Open the store and wire default collaborators
    ///
    /// Defaults: system clock, log notifier, built-in stock ledger, and the
    /// hash-chained audit log when `audit_log_path` is set (no audit otherwise).
    pub fn open(config: Config, identity: Arc<dyn IdentityLookup>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let audit: Arc<dyn AuditSink> = match &config.audit_log_path {
            Some(path) => Arc::new(
                HashChainAuditLog::open(path)
                    .map_err(|e| Error::Config(format!("Cannot open audit log: {}", e)))?,
            ),
            None => Arc::new(NullAudit),
        };
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Cannot register metrics: {}", e)))?;

        let issuance = CreditIssuance::new(config.credit.grace_period()?);
        let contributions = ContributionTracker::new(identity.clone(), issuance.clone());
        let rotation = RotationEngine::new(identity.clone(), issuance.clone());
        let consumption = CreditConsumption::new(Arc::new(StockLedger));
        let sweeper = Sweeper::new(storage.clone(), contributions.clone());
        let dispatcher =
            Dispatcher::new(config.service_name.clone(), notifier.clone(), audit.clone());

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            grace_period_days = config.credit.grace_period_days,
            "Credit engine opened"
        );

        Ok(Self {
            storage,
            clock: Arc::new(SystemClock),
            identity,
            contributions,
            rotation,
            issuance,
            consumption,
            sweeper,
            dispatcher,
            notifier,
            audit,
            metrics,
            config,
        })
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self.rebuild_dispatcher();
        self
    }

    /// Replace the audit sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self.rebuild_dispatcher();
        self
    }

    /// Replace the inventory
    pub fn with_inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.consumption = CreditConsumption::new(inventory);
        self
    }

    fn rebuild_dispatcher(&mut self) {
        self.dispatcher = Dispatcher::new(
            self.config.service_name.clone(),
            self.notifier.clone(),
            self.audit.clone(),
        );
    }

    /// Current time from the injected clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn execute<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.storage.begin(self.clock.now());
        let now = tx.now();

        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(operation, error = %e, "Operation rejected");
                return Err(e);
            }
        };

        let events = tx.commit()?;
        self.metrics.record_events(&events);
        self.dispatcher.dispatch(&events, now);
        Ok(value)
    }

    fn count_issuance(&self, outcome: &IssueOutcome) {
        if !outcome.is_issued() {
            self.metrics.issuance_noops.inc();
        }
    }

    // Contributions

    /// Open a PENDING contribution
    pub fn create_contribution(
        &self,
        beneficiary: BeneficiaryRef,
        amount: Amount,
        period: PeriodKind,
    ) -> Result<Contribution> {
        let contribution = self.execute("create_contribution", |tx| {
            self.contributions.create(tx, beneficiary, amount, period)
        })?;
        self.metrics.contributions_created.inc();
        Ok(contribution)
    }

    /// Mark a contribution paid; issues its credit in the same transaction
    pub fn mark_contribution_paid(
        &self,
        contribution_id: Uuid,
    ) -> Result<(Contribution, IssueOutcome)> {
        let (contribution, outcome) = self.execute("mark_contribution_paid", |tx| {
            self.contributions.mark_paid(tx, contribution_id)
        })?;
        self.count_issuance(&outcome);
        Ok((contribution, outcome))
    }

    /// Load a contribution
    pub fn contribution(&self, contribution_id: Uuid) -> Result<Contribution> {
        contribution::contribution(&*self.storage, contribution_id)
    }

    /// Contributions of a beneficiary
    pub fn contributions_of(&self, beneficiary: &BeneficiaryRef) -> Result<Vec<Contribution>> {
        contribution::contributions_of(&*self.storage, beneficiary)
    }

    // Rotation groups

    /// Create an ACTIVE rotation group
    pub fn create_group(
        &self,
        name: &str,
        cycle_amount: Amount,
        frequency: Frequency,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<RotationGroup> {
        self.execute("create_group", |tx| {
            self.rotation
                .create_group(tx, name, cycle_amount, frequency, start_date, end_date)
        })
    }

    /// ACTIVE → SUSPENDED
    pub fn suspend_group(&self, group_id: Uuid) -> Result<RotationGroup> {
        self.execute("suspend_group", |tx| self.rotation.suspend(tx, group_id))
    }

    /// SUSPENDED → ACTIVE
    pub fn resume_group(&self, group_id: Uuid) -> Result<RotationGroup> {
        self.execute("resume_group", |tx| self.rotation.resume(tx, group_id))
    }

    /// ACTIVE → TERMINATED
    pub fn terminate_group(&self, group_id: Uuid) -> Result<RotationGroup> {
        self.execute("terminate_group", |tx| self.rotation.terminate(tx, group_id))
    }

    /// Join a group before it starts
    pub fn join_group(
        &self,
        group_id: Uuid,
        beneficiary: BeneficiaryRef,
        slot: Option<u32>,
    ) -> Result<Membership> {
        self.execute("join_group", |tx| {
            self.rotation.join(tx, group_id, beneficiary, slot)
        })
    }

    /// Leave a group before it starts
    pub fn leave_group(&self, group_id: Uuid, beneficiary: BeneficiaryRef) -> Result<Membership> {
        self.execute("leave_group", |tx| self.rotation.leave(tx, group_id, beneficiary))
    }

    /// Open the next cycle or terminate the group
    pub fn start_next_cycle(&self, group_id: Uuid) -> Result<CycleOutcome> {
        self.execute("start_next_cycle", |tx| {
            self.rotation.start_next_cycle(tx, group_id)
        })
    }

    /// Pay one member's share into a cycle
    pub fn pay_cycle_share(&self, cycle_id: Uuid, membership_id: Uuid) -> Result<SharePayment> {
        let payment = self.execute("pay_cycle_share", |tx| {
            self.rotation.pay_contribution(tx, cycle_id, membership_id)
        })?;
        if let Some(closure) = &payment.closed {
            self.count_issuance(&closure.credit);
        }
        Ok(payment)
    }

    /// Load a group
    pub fn group(&self, group_id: Uuid) -> Result<RotationGroup> {
        rotation::group(&*self.storage, group_id)
    }

    /// Live members by draw order
    pub fn live_members(&self, group_id: Uuid) -> Result<Vec<Membership>> {
        rotation::live_members(&*self.storage, group_id)
    }

    /// Load a cycle
    pub fn cycle(&self, cycle_id: Uuid) -> Result<Cycle> {
        rotation::cycle(&*self.storage, cycle_id)
    }

    /// Shares of a cycle
    pub fn cycle_shares(&self, cycle_id: Uuid) -> Result<Vec<CycleShare>> {
        rotation::cycle_shares(&*self.storage, cycle_id)
    }

    /// Cycles of a group
    pub fn cycles_of(&self, group_id: Uuid) -> Result<Vec<Cycle>> {
        rotation::cycles_of(&*self.storage, group_id)
    }

    // Credits

    /// Administrative re-trigger of issuance
    ///
    /// Unlike the internal paths, the beneficiary has not been resolved by an
    /// earlier create or join, so it is looked up first.
    pub fn issue_from_source(
        &self,
        beneficiary: BeneficiaryRef,
        source: CreditSource,
        amount: Amount,
    ) -> Result<IssueOutcome> {
        let outcome = self.execute("issue_from_source", |tx| {
            contribution::ensure_beneficiary(self.identity.as_ref(), &beneficiary)?;
            self.issuance.issue_from_source(tx, beneficiary, source, amount)
        })?;
        self.count_issuance(&outcome);
        Ok(outcome)
    }

    /// Debit a credit for a purchase
    pub fn consume(&self, credit_id: Uuid, items: &[LineItem]) -> Result<Purchase> {
        let purchase = self.execute("consume", |tx| {
            self.consumption.consume(tx, credit_id, items)
        })?;
        self.metrics
            .record_consumption(purchase.total.value().to_f64().unwrap_or_default());
        Ok(purchase)
    }

    /// Reverse one consumption record
    pub fn reverse_consumption(&self, consumption_id: Uuid) -> Result<Reversal> {
        self.execute("reverse_consumption", |tx| {
            self.consumption.reverse_consumption(tx, consumption_id)
        })
    }

    /// Add stock to the built-in ledger
    pub fn restock(&self, product_id: Uuid, name: &str, quantity: u64) -> Result<StockItem> {
        self.execute("restock", |tx| StockLedger.restock(tx, product_id, name, quantity))
    }

    /// Load a credit
    pub fn credit(&self, credit_id: Uuid) -> Result<SpendingCredit> {
        issuance::credit(&*self.storage, credit_id)
    }

    /// Credits of a beneficiary
    pub fn credits_of(&self, beneficiary: &BeneficiaryRef) -> Result<Vec<SpendingCredit>> {
        issuance::credits_of(&*self.storage, beneficiary)
    }

    /// Records debited against a credit
    pub fn consumptions_of(&self, credit_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
        consumption::consumptions_of(&*self.storage, credit_id)
    }

    /// Stock row of a product in the built-in ledger
    pub fn stock(&self, product_id: Uuid) -> Result<StockItem> {
        consumption::stock(&*self.storage, product_id)
    }

    /// Spendable balance of a beneficiary right now
    pub fn available_balance(&self, beneficiary: &BeneficiaryRef) -> Result<Amount> {
        issuance::available_balance(&*self.storage, beneficiary, self.clock.now())
    }

    // Sweep

    /// Expire overdue PENDING contributions only, as of `now`
    pub fn sweep_contributions_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.storage.begin(now);
        let expired = self.contributions.sweep_expire(&mut tx, now)?;
        tx.commit()?;
        self.metrics.record_sweep(expired, 0);
        if expired > 0 {
            tracing::info!(%now, contributions_expired = expired, "Contribution sweep complete");
        }
        Ok(expired)
    }

    /// Sweep as of the clock's current time
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(self.clock.now())
    }

    /// Sweep as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.sweeper.run(now)?;
        self.metrics
            .record_sweep(report.contributions_expired, report.credits_expired);
        Ok(report)
    }
}
