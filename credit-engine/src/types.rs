//! Core types for the credit engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode rows in RocksDB)
//! - Exact arithmetic ([`Amount`] for money)
//! - Monotonic status enums with explicit transition checks

use crate::amount::Amount;
use crate::{Error, Result};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Person who owes contributions, joins groups and holds credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BeneficiaryRef {
    /// Registered member
    Member(Uuid),
    /// Unregistered prospect
    Prospect(Uuid),
}

impl BeneficiaryRef {
    /// Underlying identifier
    pub fn id(&self) -> Uuid {
        match self {
            BeneficiaryRef::Member(id) | BeneficiaryRef::Prospect(id) => *id,
        }
    }

    /// Fixed-width key bytes: tag || uuid
    pub fn key_bytes(&self) -> [u8; 17] {
        let (tag, id) = match self {
            BeneficiaryRef::Member(id) => (1u8, id),
            BeneficiaryRef::Prospect(id) => (2u8, id),
        };
        let mut key = [0u8; 17];
        key[0] = tag;
        key[1..].copy_from_slice(id.as_bytes());
        key
    }
}

impl fmt::Display for BeneficiaryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeneficiaryRef::Member(id) => write!(f, "member:{}", id),
            BeneficiaryRef::Prospect(id) => write!(f, "prospect:{}", id),
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])* $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Upper-case wire name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Contribution period
    PeriodKind {
        /// Due every month
        Monthly => "MONTHLY",
        /// Due every year
        Annual => "ANNUAL",
    }
);

impl PeriodKind {
    /// Expiration for a contribution created at `created_at`
    pub fn expiration_from(&self, created_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let months = match self {
            PeriodKind::Monthly => Months::new(1),
            PeriodKind::Annual => Months::new(12),
        };
        created_at
            .checked_add_months(months)
            .ok_or_else(|| Error::Validation(format!("Expiration overflow from {}", created_at)))
    }
}

wire_enum!(
    /// Contribution status
    ContributionStatus {
        /// Awaiting payment
        Pending => "PENDING",
        /// Paid (terminal for the sweeper)
        Paid => "PAID",
        /// Expired unpaid
        Expired => "EXPIRED",
    }
);

wire_enum!(
    /// Rotation group status
    GroupStatus {
        /// Accepting cycles
        Active => "ACTIVE",
        /// Temporarily frozen
        Suspended => "SUSPENDED",
        /// Finished (terminal)
        Terminated => "TERMINATED",
    }
);

wire_enum!(
    /// Rotation frequency
    Frequency {
        /// Every week
        Weekly => "WEEKLY",
        /// Every two weeks
        Biweekly => "BIWEEKLY",
        /// Every month
        Monthly => "MONTHLY",
    }
);

wire_enum!(
    /// Cycle status
    CycleStatus {
        /// Collecting member shares
        InProgress => "IN_PROGRESS",
        /// All shares paid, pot credited
        Complete => "COMPLETE",
    }
);

wire_enum!(
    /// Per-member cycle share status
    ShareStatus {
        /// Not yet paid
        Pending => "PENDING",
        /// Paid into the pot
        Paid => "PAID",
    }
);

wire_enum!(
    /// Spending credit status
    CreditStatus {
        /// Spendable
        Active => "ACTIVE",
        /// Remaining reached zero
        Exhausted => "EXHAUSTED",
        /// Past expiration
        Expired => "EXPIRED",
    }
);

wire_enum!(
    /// Kind of event that granted a credit
    SourceKind {
        /// Paid membership contribution
        FromContribution => "FROM_CONTRIBUTION",
        /// Completed rotation cycle
        FromRotation => "FROM_ROTATION",
    }
);

/// Origin of a spending credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditSource {
    /// Issued when the contribution was paid
    FromContribution(Uuid),
    /// Issued when the cycle completed
    FromRotation(Uuid),
}

impl CreditSource {
    /// Source kind
    pub fn kind(&self) -> SourceKind {
        match self {
            CreditSource::FromContribution(_) => SourceKind::FromContribution,
            CreditSource::FromRotation(_) => SourceKind::FromRotation,
        }
    }

    /// Source reference id
    pub fn reference(&self) -> Uuid {
        match self {
            CreditSource::FromContribution(id) | CreditSource::FromRotation(id) => *id,
        }
    }

    /// Build from an untyped (kind, reference) pair
    pub fn from_parts(kind: SourceKind, reference: Uuid) -> Self {
        match kind {
            SourceKind::FromContribution => CreditSource::FromContribution(reference),
            SourceKind::FromRotation => CreditSource::FromRotation(reference),
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.reference())
    }
}

/// Membership dues obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Contribution ID
    pub contribution_id: Uuid,
    /// Who owes it
    pub beneficiary: BeneficiaryRef,
    /// Amount due
    pub amount: Amount,
    /// Period kind
    pub period: PeriodKind,
    /// Current status
    pub status: ContributionStatus,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Set iff status is PAID
    pub paid_at: Option<DateTime<Utc>>,
    /// Expiration
    pub expires_at: DateTime<Utc>,
}

impl Contribution {
    /// PENDING, or PAID and not yet expired
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ContributionStatus::Pending => true,
            ContributionStatus::Paid => self.expires_at > now,
            ContributionStatus::Expired => false,
        }
    }
}

/// Rotating savings pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationGroup {
    /// Group ID
    pub group_id: Uuid,
    /// Display name
    pub name: String,
    /// Share each live member pays per cycle
    pub cycle_amount: Amount,
    /// Rotation frequency
    pub frequency: Frequency,
    /// Current status
    pub status: GroupStatus,
    /// Joining and leaving close at this instant
    pub start_date: DateTime<Utc>,
    /// Optional end date
    pub end_date: Option<DateTime<Utc>>,
    /// Number of the most recently created cycle (0 before the first)
    pub last_cycle_number: u32,
    /// Cycle currently collecting shares
    pub running_cycle: Option<Uuid>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Group membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Membership ID
    pub membership_id: Uuid,
    /// Owning group
    pub group_id: Uuid,
    /// Member
    pub beneficiary: BeneficiaryRef,
    /// Payout position (1-based, unique among live members)
    pub draw_order: u32,
    /// Join timestamp
    pub joined_at: DateTime<Utc>,
    /// Leave timestamp; a member is live while this is unset
    pub left_at: Option<DateTime<Utc>>,
}

impl Membership {
    /// Member has not left
    pub fn is_live(&self) -> bool {
        self.left_at.is_none()
    }
}

/// One payout iteration of a rotation group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    /// Cycle ID
    pub cycle_id: Uuid,
    /// Owning group
    pub group_id: Uuid,
    /// Sequential, 1-based
    pub cycle_number: u32,
    /// Membership receiving the pot
    pub membership_id: Uuid,
    /// Beneficiary receiving the pot
    pub beneficiary: BeneficiaryRef,
    /// cycle amount × live members at creation
    pub pot: Amount,
    /// Current status
    pub status: CycleStatus,
    /// Opened timestamp
    pub opened_at: DateTime<Utc>,
    /// Set when the cycle completes
    pub closed_at: Option<DateTime<Utc>>,
}

/// A member's share due into a cycle's pot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleShare {
    /// Owning cycle
    pub cycle_id: Uuid,
    /// Paying membership
    pub membership_id: Uuid,
    /// Paying beneficiary
    pub beneficiary: BeneficiaryRef,
    /// Share amount (the group's cycle amount)
    pub amount: Amount,
    /// Current status
    pub status: ShareStatus,
    /// Payment timestamp
    pub paid_at: Option<DateTime<Utc>>,
}

/// Consumable, capped spending credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingCredit {
    /// Credit ID
    pub credit_id: Uuid,
    /// Holder
    pub beneficiary: BeneficiaryRef,
    /// Granted amount
    pub ceiling: Amount,
    /// Consumed so far
    pub used: Amount,
    /// ceiling - used
    pub remaining: Amount,
    /// What granted it
    pub source: CreditSource,
    /// Current status
    pub status: CreditStatus,
    /// Issued timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiration (None never expires)
    pub expires_at: Option<DateTime<Utc>>,
}

impl SpendingCredit {
    /// Check `ceiling == used + remaining` and the exhaustion rule
    pub fn check_balance(&self) -> Result<()> {
        let total = self
            .used
            .checked_add(self.remaining)
            .ok_or_else(|| Error::InvariantViolation("credit total overflow".to_string()))?;
        if total != self.ceiling {
            return Err(Error::InvariantViolation(format!(
                "credit {}: ceiling {} != used {} + remaining {}",
                self.credit_id, self.ceiling, self.used, self.remaining
            )));
        }
        if self.remaining.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "credit {}: negative remaining {}",
                self.credit_id, self.remaining
            )));
        }
        let exhausted = !self.remaining.is_positive();
        match self.status {
            CreditStatus::Expired => Ok(()),
            CreditStatus::Exhausted if exhausted => Ok(()),
            CreditStatus::Active if !exhausted => Ok(()),
            status => Err(Error::InvariantViolation(format!(
                "credit {}: status {} with remaining {}",
                self.credit_id, status, self.remaining
            ))),
        }
    }

    /// Spendable at `now`
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.status == CreditStatus::Active && self.expires_at.map_or(true, |at| at > now)
    }

    /// Add `amount` to used, recompute remaining and status
    pub(crate) fn apply_debit(&mut self, amount: Amount) -> Result<()> {
        let used = self
            .used
            .checked_add(amount)
            .ok_or_else(|| Error::InvariantViolation("credit used overflow".to_string()))?;
        self.set_used(used)
    }

    /// Remove `amount` from used, recompute remaining and status
    pub(crate) fn apply_refund(&mut self, amount: Amount) -> Result<()> {
        let used = self
            .used
            .checked_sub(amount)
            .ok_or_else(|| Error::InvariantViolation("credit used underflow".to_string()))?;
        if used.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "credit {}: refund {} exceeds used {}",
                self.credit_id, amount, self.used
            )));
        }
        self.set_used(used)
    }

    fn set_used(&mut self, used: Amount) -> Result<()> {
        let remaining = self
            .ceiling
            .checked_sub(used)
            .ok_or_else(|| Error::InvariantViolation("credit remaining overflow".to_string()))?;
        if remaining.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "credit {}: used {} exceeds ceiling {}",
                self.credit_id, used, self.ceiling
            )));
        }
        self.used = used;
        self.remaining = remaining;
        if self.status != CreditStatus::Expired {
            self.status = if remaining.is_positive() {
                CreditStatus::Active
            } else {
                CreditStatus::Exhausted
            };
        }
        Ok(())
    }
}

/// One purchase line against a credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product being bought
    pub product_id: Uuid,
    /// Units (> 0)
    pub quantity: u32,
    /// Price per unit
    pub unit_price: Amount,
}

impl LineItem {
    /// quantity × unit price
    pub fn line_amount(&self) -> Result<Amount> {
        self.unit_price
            .checked_mul(u64::from(self.quantity))
            .ok_or_else(|| {
                Error::Validation(format!("Line amount overflow for {}", self.product_id))
            })
    }
}

/// Immutable debit against a spending credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    /// Record ID
    pub consumption_id: Uuid,
    /// Debited credit
    pub credit_id: Uuid,
    /// Product bought
    pub product_id: Uuid,
    /// Units
    pub quantity: u32,
    /// Price per unit
    pub unit_price: Amount,
    /// quantity × unit price
    pub line_amount: Amount,
    /// Timestamp
    pub consumed_at: DateTime<Utc>,
}

/// Compensating entry for a reversed consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionReversal {
    /// Reversed record
    pub consumption_id: Uuid,
    /// Credit refunded
    pub credit_id: Uuid,
    /// Refunded amount
    pub amount: Amount,
    /// Timestamp
    pub reversed_at: DateTime<Utc>,
}

/// Stock row kept by the built-in inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    /// Product ID
    pub product_id: Uuid,
    /// Display name
    pub name: String,
    /// Units on hand
    pub available: u64,
}
