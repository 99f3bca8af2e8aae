//! Credit issuance
//!
//! Grants a spending credit when a contribution is paid or a rotation cycle
//! completes. Always runs inside the caller's transaction: the credit commits
//! together with the state change that triggered it, or not at all.
//!
//! At most one ACTIVE credit exists per (beneficiary, source) pair. The pair
//! owns a unique key in the `indices` table that is written with the credit
//! and removed when the credit leaves ACTIVE; a second issuance for the same
//! pair finds the key and reports [`IssueOutcome::AlreadyActive`].

use crate::amount::Amount;
use crate::events::EngineEvent;
use crate::storage::{keys, ReadView, Table, Transaction};
use crate::types::{BeneficiaryRef, CreditSource, CreditStatus, SpendingCredit};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Result of an issuance attempt
#[derive(Debug, Clone, PartialEq)]
pub enum IssueOutcome {
    /// New credit created
    Issued(SpendingCredit),
    /// An ACTIVE credit already exists for this source (no-op)
    AlreadyActive(Uuid),
}

impl IssueOutcome {
    /// Credit id either way
    pub fn credit_id(&self) -> Uuid {
        match self {
            IssueOutcome::Issued(credit) => credit.credit_id,
            IssueOutcome::AlreadyActive(id) => *id,
        }
    }

    /// True when a credit was created
    pub fn is_issued(&self) -> bool {
        matches!(self, IssueOutcome::Issued(_))
    }
}

/// Credit issuance service
#[derive(Debug, Clone)]
pub struct CreditIssuance {
    grace_period: Duration,
}

impl CreditIssuance {
    /// Credits expire `grace_period` after issuance
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Issue a credit for `source` unless one is already active
    pub fn issue_from_source(
        &self,
        tx: &mut Transaction<'_>,
        beneficiary: BeneficiaryRef,
        source: CreditSource,
        amount: Amount,
    ) -> Result<IssueOutcome> {
        if !amount.is_positive() {
            return Err(Error::Validation(format!(
                "Credit amount must be positive, got {}",
                amount
            )));
        }

        let unique_key = keys::active_credit(&beneficiary, &source);
        if let Some(existing) = tx.get::<Uuid>(Table::Indices, &unique_key)? {
            tracing::debug!(
                credit_id = %existing,
                %beneficiary,
                %source,
                "Active credit already exists, issuance skipped"
            );
            return Ok(IssueOutcome::AlreadyActive(existing));
        }

        let now = tx.now();
        let credit = SpendingCredit {
            credit_id: Uuid::now_v7(),
            beneficiary,
            ceiling: amount,
            used: Amount::ZERO,
            remaining: amount,
            source,
            status: CreditStatus::Active,
            issued_at: now,
            expires_at: Some(now + self.grace_period),
        };
        credit.check_balance()?;

        tx.put(Table::Credits, keys::id(&credit.credit_id), &credit)?;
        tx.put(Table::Indices, unique_key, &credit.credit_id)?;
        tx.put(
            Table::Indices,
            keys::credit_by_beneficiary(&beneficiary, &credit.credit_id),
            &(),
        )?;
        tx.emit(EngineEvent::CreditIssued {
            credit_id: credit.credit_id,
            beneficiary,
            source,
            ceiling: amount,
            at: now,
        });

        tracing::info!(
            credit_id = %credit.credit_id,
            %beneficiary,
            %source,
            ceiling = %amount,
            "Credit issued"
        );

        Ok(IssueOutcome::Issued(credit))
    }
}

/// Move a credit out of ACTIVE, freeing its source key
pub(crate) fn deactivate(tx: &mut Transaction<'_>, credit: &SpendingCredit) {
    let unique_key = keys::active_credit(&credit.beneficiary, &credit.source);
    tx.delete(Table::Indices, unique_key);
}

/// Move a credit back into ACTIVE, reclaiming its source key
pub(crate) fn reactivate(tx: &mut Transaction<'_>, credit: &SpendingCredit) -> Result<()> {
    let unique_key = keys::active_credit(&credit.beneficiary, &credit.source);
    if let Some(holder) = tx.get::<Uuid>(Table::Indices, &unique_key)? {
        if holder != credit.credit_id {
            return Err(Error::Conflict(format!(
                "Credit {} holds the active slot for {}",
                holder, credit.source
            )));
        }
    }
    tx.put(Table::Indices, unique_key, &credit.credit_id)
}

/// Load a credit
pub fn credit(view: &impl ReadView, credit_id: Uuid) -> Result<SpendingCredit> {
    view.get(Table::Credits, &keys::id(&credit_id))?
        .ok_or_else(|| Error::not_found("credit", credit_id))
}

/// All credits of a beneficiary, oldest first
pub fn credits_of(
    view: &impl ReadView,
    beneficiary: &BeneficiaryRef,
) -> Result<Vec<SpendingCredit>> {
    view.scan::<()>(Table::Indices, &keys::credits_of(beneficiary))?
        .iter()
        .map(|(key, _)| credit(view, keys::trailing_id(key)?))
        .collect()
}

/// Sum of remaining over the beneficiary's spendable credits at `now`
pub fn available_balance(
    view: &impl ReadView,
    beneficiary: &BeneficiaryRef,
    now: DateTime<Utc>,
) -> Result<Amount> {
    credits_of(view, beneficiary)?
        .iter()
        .filter(|c| c.is_spendable(now))
        .try_fold(Amount::ZERO, |total, c| {
            total.checked_add(c.remaining).ok_or_else(|| {
                Error::InvariantViolation(format!("Balance overflow for {}", beneficiary))
            })
        })
}
