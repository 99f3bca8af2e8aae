//! Events emitted by committed state transitions
//!
//! A transaction collects events while it runs; they are handed to the
//! notifier and audit sink only after the transaction commits.

use crate::amount::Amount;
use crate::types::{BeneficiaryRef, CreditSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role set addressed by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cooperative administrators
    Admin,
    /// Treasurers handling rotation payouts
    Treasurer,
    /// Store staff serving credit purchases
    Cashier,
}

/// Committed state transition
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Contribution moved to PAID
    ContributionPaid {
        contribution_id: Uuid,
        beneficiary: BeneficiaryRef,
        amount: Amount,
        at: DateTime<Utc>,
    },
    /// Cycle created for a group
    CycleStarted {
        group_id: Uuid,
        cycle_id: Uuid,
        cycle_number: u32,
        pot: Amount,
        at: DateTime<Utc>,
    },
    /// All shares paid, cycle complete
    CycleClosed {
        group_id: Uuid,
        cycle_id: Uuid,
        beneficiary: BeneficiaryRef,
        pot: Amount,
        at: DateTime<Utc>,
    },
    /// Group ran out of members to pay
    GroupTerminated {
        group_id: Uuid,
        at: DateTime<Utc>,
    },
    /// Spending credit granted
    CreditIssued {
        credit_id: Uuid,
        beneficiary: BeneficiaryRef,
        source: CreditSource,
        ceiling: Amount,
        at: DateTime<Utc>,
    },
    /// Credit remaining reached zero
    CreditExhausted {
        credit_id: Uuid,
        beneficiary: BeneficiaryRef,
        at: DateTime<Utc>,
    },
    /// Consumption reversed by an administrator
    ConsumptionReversed {
        consumption_id: Uuid,
        credit_id: Uuid,
        amount: Amount,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Short event name for logs and audit entries
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ContributionPaid { .. } => "contribution_paid",
            EngineEvent::CycleStarted { .. } => "cycle_started",
            EngineEvent::CycleClosed { .. } => "cycle_closed",
            EngineEvent::GroupTerminated { .. } => "group_terminated",
            EngineEvent::CreditIssued { .. } => "credit_issued",
            EngineEvent::CreditExhausted { .. } => "credit_exhausted",
            EngineEvent::ConsumptionReversed { .. } => "consumption_reversed",
        }
    }

    /// Roles that should hear about this event
    pub fn audience(&self) -> &'static [Role] {
        match self {
            EngineEvent::ContributionPaid { .. } | EngineEvent::GroupTerminated { .. } => {
                &[Role::Admin]
            }
            EngineEvent::CycleStarted { .. } | EngineEvent::CycleClosed { .. } => {
                &[Role::Admin, Role::Treasurer]
            }
            EngineEvent::CreditIssued { .. } | EngineEvent::CreditExhausted { .. } => {
                &[Role::Admin, Role::Cashier]
            }
            EngineEvent::ConsumptionReversed { .. } => &[Role::Admin, Role::Cashier],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::GroupTerminated {
            group_id: Uuid::nil(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "group_terminated");
        assert_eq!(event.name(), "group_terminated");
    }

    #[test]
    fn test_cycle_events_reach_treasurer() {
        let event = EngineEvent::CycleClosed {
            group_id: Uuid::nil(),
            cycle_id: Uuid::nil(),
            beneficiary: BeneficiaryRef::Member(Uuid::nil()),
            pot: Amount::from_units(4000),
            at: Utc::now(),
        };
        assert!(event.audience().contains(&Role::Treasurer));
    }
}
