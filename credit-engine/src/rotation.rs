//! Rotation group engine
//!
//! Group lifecycle:
//!
//! ```text
//! ACTIVE ──suspend──▶ SUSPENDED ──resume──▶ ACTIVE
//!    │
//!    └──terminate / no member for next draw──▶ TERMINATED
//! ```
//!
//! Each cycle pays its pot to the live member whose draw order equals the
//! cycle number. The pot is notional: the only realized effect of a completed
//! cycle is the spending credit issued to that member.
//!
//! Membership is frozen once the group's start date is reached and no cycle
//! opens before it, so the set of live members (and therefore each pot) is
//! fixed for every cycle of the group.

use crate::amount::Amount;
use crate::collaborators::IdentityLookup;
use crate::contribution::ensure_beneficiary;
use crate::events::EngineEvent;
use crate::issuance::{CreditIssuance, IssueOutcome};
use crate::storage::{keys, ReadView, Table, Transaction};
use crate::types::{
    BeneficiaryRef, CreditSource, Cycle, CycleShare, CycleStatus, Frequency, GroupStatus,
    Membership, RotationGroup, ShareStatus,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of [`RotationEngine::start_next_cycle`]
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// New cycle opened with one pending share per live member
    Started {
        /// The cycle
        cycle: Cycle,
        /// Its pending shares
        shares: Vec<CycleShare>,
    },
    /// No live member holds the next draw order; the group is finished
    Terminated(RotationGroup),
}

/// Result of [`RotationEngine::pay_contribution`]
#[derive(Debug, Clone, PartialEq)]
pub struct SharePayment {
    /// The share after payment
    pub share: CycleShare,
    /// Set when this payment completed the cycle
    pub closed: Option<CycleClosure>,
}

/// Cycle completion and the credit it produced
#[derive(Debug, Clone, PartialEq)]
pub struct CycleClosure {
    /// Completed cycle
    pub cycle: Cycle,
    /// Issuance result for the pot
    pub credit: IssueOutcome,
}

/// Rotation group engine
#[derive(Clone)]
pub struct RotationEngine {
    identity: Arc<dyn IdentityLookup>,
    issuance: CreditIssuance,
}

impl std::fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationEngine")
            .field("issuance", &self.issuance)
            .finish()
    }
}

impl RotationEngine {
    /// Create engine
    pub fn new(identity: Arc<dyn IdentityLookup>, issuance: CreditIssuance) -> Self {
        Self { identity, issuance }
    }

    /// Create an ACTIVE group
    pub fn create_group(
        &self,
        tx: &mut Transaction<'_>,
        name: &str,
        cycle_amount: Amount,
        frequency: Frequency,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<RotationGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Group name must not be empty".to_string()));
        }
        if !cycle_amount.is_positive() {
            return Err(Error::Validation(format!(
                "Cycle amount must be positive, got {}",
                cycle_amount
            )));
        }
        if let Some(end) = end_date {
            if end <= start_date {
                return Err(Error::Validation(format!(
                    "End date {} is not after start date {}",
                    end, start_date
                )));
            }
        }

        let group = RotationGroup {
            group_id: Uuid::now_v7(),
            name: name.to_string(),
            cycle_amount,
            frequency,
            status: GroupStatus::Active,
            start_date,
            end_date,
            last_cycle_number: 0,
            running_cycle: None,
            created_at: tx.now(),
        };
        tx.put(Table::Groups, keys::id(&group.group_id), &group)?;

        tracing::info!(
            group_id = %group.group_id,
            name = %group.name,
            cycle_amount = %cycle_amount,
            %frequency,
            start_date = %start_date,
            "Rotation group created"
        );

        Ok(group)
    }

    /// ACTIVE → SUSPENDED
    pub fn suspend(&self, tx: &mut Transaction<'_>, group_id: Uuid) -> Result<RotationGroup> {
        self.transition(tx, group_id, GroupStatus::Active, GroupStatus::Suspended)
    }

    /// SUSPENDED → ACTIVE
    pub fn resume(&self, tx: &mut Transaction<'_>, group_id: Uuid) -> Result<RotationGroup> {
        self.transition(tx, group_id, GroupStatus::Suspended, GroupStatus::Active)
    }

    /// ACTIVE → TERMINATED
    pub fn terminate(&self, tx: &mut Transaction<'_>, group_id: Uuid) -> Result<RotationGroup> {
        let mut group = group(tx, group_id)?;
        if group.status != GroupStatus::Active {
            return Err(Error::Conflict(format!(
                "Group {} cannot be terminated from {}",
                group_id, group.status
            )));
        }
        if let Some(cycle_id) = group.running_cycle {
            return Err(Error::Conflict(format!(
                "Group {} has cycle {} in progress",
                group_id, cycle_id
            )));
        }
        mark_terminated(tx, &mut group)?;
        Ok(group)
    }

    fn transition(
        &self,
        tx: &mut Transaction<'_>,
        group_id: Uuid,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<RotationGroup> {
        let mut group = group(tx, group_id)?;
        if group.status != from {
            return Err(Error::Conflict(format!(
                "Group {} is {}, expected {}",
                group_id, group.status, from
            )));
        }
        group.status = to;
        tx.put(Table::Groups, keys::id(&group_id), &group)?;
        tracing::info!(%group_id, %from, %to, "Rotation group status changed");
        Ok(group)
    }

    /// Add a live member before the group starts
    ///
    /// Without `slot` the member gets the smallest draw order not held by a
    /// live member.
    pub fn join(
        &self,
        tx: &mut Transaction<'_>,
        group_id: Uuid,
        beneficiary: BeneficiaryRef,
        slot: Option<u32>,
    ) -> Result<Membership> {
        ensure_beneficiary(self.identity.as_ref(), &beneficiary)?;
        let group = open_for_membership(tx, group_id)?;

        let live = live_members(tx, group_id)?;
        if live.iter().any(|m| m.beneficiary == beneficiary) {
            return Err(Error::Conflict(format!(
                "{} is already a member of group {}",
                beneficiary, group_id
            )));
        }

        let taken: BTreeSet<u32> = live.iter().map(|m| m.draw_order).collect();
        let draw_order = match slot {
            Some(0) => {
                return Err(Error::Validation("Draw order starts at 1".to_string()));
            }
            Some(slot) if taken.contains(&slot) => {
                return Err(Error::Conflict(format!(
                    "Draw order {} is taken in group {}",
                    slot, group_id
                )));
            }
            Some(slot) => slot,
            None => (1..).find(|n| !taken.contains(n)).ok_or_else(|| {
                Error::Conflict(format!("No free draw order in group {}", group_id))
            })?,
        };

        let membership = Membership {
            membership_id: Uuid::now_v7(),
            group_id: group.group_id,
            beneficiary,
            draw_order,
            joined_at: tx.now(),
            left_at: None,
        };
        tx.put(
            Table::Memberships,
            keys::pair(&group_id, &membership.membership_id),
            &membership,
        )?;

        tracing::info!(
            %group_id,
            membership_id = %membership.membership_id,
            %beneficiary,
            draw_order,
            "Member joined"
        );

        Ok(membership)
    }

    /// Remove a live member before the group starts
    pub fn leave(
        &self,
        tx: &mut Transaction<'_>,
        group_id: Uuid,
        beneficiary: BeneficiaryRef,
    ) -> Result<Membership> {
        open_for_membership(tx, group_id)?;

        let mut membership = live_members(tx, group_id)?
            .into_iter()
            .find(|m| m.beneficiary == beneficiary)
            .ok_or_else(|| {
                Error::not_found("membership", format!("{}/{}", group_id, beneficiary))
            })?;

        membership.left_at = Some(tx.now());
        tx.put(
            Table::Memberships,
            keys::pair(&group_id, &membership.membership_id),
            &membership,
        )?;

        tracing::info!(
            %group_id,
            membership_id = %membership.membership_id,
            %beneficiary,
            "Member left"
        );

        Ok(membership)
    }

    /// Open the next cycle, or terminate the group when nobody holds its draw
    pub fn start_next_cycle(
        &self,
        tx: &mut Transaction<'_>,
        group_id: Uuid,
    ) -> Result<CycleOutcome> {
        let mut group = group(tx, group_id)?;
        if group.status != GroupStatus::Active {
            return Err(Error::Conflict(format!(
                "Group {} is {}",
                group_id, group.status
            )));
        }
        if let Some(cycle_id) = group.running_cycle {
            return Err(Error::Conflict(format!(
                "Cycle already running: {}",
                cycle_id
            )));
        }
        // Membership is still open until the start date, so the pot is not fixed yet
        if tx.now() < group.start_date {
            return Err(Error::Conflict(format!(
                "Group {} starts at {}",
                group_id, group.start_date
            )));
        }

        let live = live_members(tx, group_id)?;
        if live.is_empty() {
            return Err(Error::Conflict(format!(
                "Group {} has no live members",
                group_id
            )));
        }

        let cycle_number = group
            .last_cycle_number
            .checked_add(1)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("Cycle number overflow in {}", group_id))
            })?;

        let Some(recipient) = live.iter().find(|m| m.draw_order == cycle_number) else {
            mark_terminated(tx, &mut group)?;
            return Ok(CycleOutcome::Terminated(group));
        };

        let pot = group
            .cycle_amount
            .checked_mul(live.len() as u64)
            .ok_or_else(|| Error::Validation(format!("Pot overflow in group {}", group_id)))?;

        let now = tx.now();
        let cycle = Cycle {
            cycle_id: Uuid::now_v7(),
            group_id,
            cycle_number,
            membership_id: recipient.membership_id,
            beneficiary: recipient.beneficiary,
            pot,
            status: CycleStatus::InProgress,
            opened_at: now,
            closed_at: None,
        };

        let shares: Vec<CycleShare> = live
            .iter()
            .map(|m| CycleShare {
                cycle_id: cycle.cycle_id,
                membership_id: m.membership_id,
                beneficiary: m.beneficiary,
                amount: group.cycle_amount,
                status: ShareStatus::Pending,
                paid_at: None,
            })
            .collect();

        tx.put(Table::Cycles, keys::id(&cycle.cycle_id), &cycle)?;
        tx.put(
            Table::Indices,
            keys::cycle_by_number(&group_id, cycle_number),
            &cycle.cycle_id,
        )?;
        for share in &shares {
            tx.put(
                Table::CycleShares,
                keys::pair(&cycle.cycle_id, &share.membership_id),
                share,
            )?;
        }

        group.last_cycle_number = cycle_number;
        group.running_cycle = Some(cycle.cycle_id);
        tx.put(Table::Groups, keys::id(&group_id), &group)?;

        tx.emit(EngineEvent::CycleStarted {
            group_id,
            cycle_id: cycle.cycle_id,
            cycle_number,
            pot,
            at: now,
        });

        tracing::info!(
            %group_id,
            cycle_id = %cycle.cycle_id,
            cycle_number,
            beneficiary = %cycle.beneficiary,
            pot = %pot,
            shares = shares.len(),
            "Cycle started"
        );

        Ok(CycleOutcome::Started { cycle, shares })
    }

    /// Pay one member's share; the last payment closes the cycle
    ///
    /// The pending count is read after the payment is staged and under the
    /// same writer lock, so exactly one payer observes zero.
    pub fn pay_contribution(
        &self,
        tx: &mut Transaction<'_>,
        cycle_id: Uuid,
        membership_id: Uuid,
    ) -> Result<SharePayment> {
        let mut cycle = cycle(tx, cycle_id)?;
        let share_key = keys::pair(&cycle_id, &membership_id);
        let mut share: CycleShare = tx
            .get(Table::CycleShares, &share_key)?
            .ok_or_else(|| {
                Error::not_found("cycle share", format!("{}/{}", cycle_id, membership_id))
            })?;

        if share.status == ShareStatus::Paid {
            return Err(Error::AlreadyPaid(membership_id));
        }
        if cycle.status != CycleStatus::InProgress {
            return Err(Error::Conflict(format!(
                "Cycle {} is {}",
                cycle_id, cycle.status
            )));
        }

        let now = tx.now();
        share.status = ShareStatus::Paid;
        share.paid_at = Some(now);
        tx.put(Table::CycleShares, share_key, &share)?;

        tracing::info!(
            %cycle_id,
            %membership_id,
            amount = %share.amount,
            "Cycle share paid"
        );

        let pending = cycle_shares(tx, cycle_id)?
            .iter()
            .filter(|s| s.status == ShareStatus::Pending)
            .count();
        if pending > 0 {
            tracing::debug!(%cycle_id, pending, "Cycle still collecting");
            return Ok(SharePayment { share, closed: None });
        }

        cycle.status = CycleStatus::Complete;
        cycle.closed_at = Some(now);
        tx.put(Table::Cycles, keys::id(&cycle_id), &cycle)?;

        let mut group = group(tx, cycle.group_id)?;
        if group.running_cycle == Some(cycle_id) {
            group.running_cycle = None;
            tx.put(Table::Groups, keys::id(&group.group_id), &group)?;
        }

        tx.emit(EngineEvent::CycleClosed {
            group_id: cycle.group_id,
            cycle_id,
            beneficiary: cycle.beneficiary,
            pot: cycle.pot,
            at: now,
        });

        tracing::info!(
            %cycle_id,
            group_id = %cycle.group_id,
            beneficiary = %cycle.beneficiary,
            pot = %cycle.pot,
            "Cycle complete"
        );

        let credit = self.issuance.issue_from_source(
            tx,
            cycle.beneficiary,
            CreditSource::FromRotation(cycle_id),
            cycle.pot,
        )?;

        Ok(SharePayment {
            share,
            closed: Some(CycleClosure { cycle, credit }),
        })
    }
}

fn open_for_membership(tx: &Transaction<'_>, group_id: Uuid) -> Result<RotationGroup> {
    let group = group(tx, group_id)?;
    if group.status != GroupStatus::Active {
        return Err(Error::Conflict(format!(
            "Group {} is {}",
            group_id, group.status
        )));
    }
    if tx.now() >= group.start_date {
        return Err(Error::Conflict(format!(
            "Group {} started at {}; membership is closed",
            group_id, group.start_date
        )));
    }
    Ok(group)
}

fn mark_terminated(tx: &mut Transaction<'_>, group: &mut RotationGroup) -> Result<()> {
    let now = tx.now();
    group.status = GroupStatus::Terminated;
    group.running_cycle = None;
    tx.put(Table::Groups, keys::id(&group.group_id), &*group)?;
    tx.emit(EngineEvent::GroupTerminated {
        group_id: group.group_id,
        at: now,
    });
    tracing::info!(
        group_id = %group.group_id,
        last_cycle_number = group.last_cycle_number,
        "Rotation group terminated"
    );
    Ok(())
}

/// Load a group
pub fn group(view: &impl ReadView, group_id: Uuid) -> Result<RotationGroup> {
    view.get(Table::Groups, &keys::id(&group_id))?
        .ok_or_else(|| Error::not_found("rotation group", group_id))
}

/// Live members ordered by draw order
pub fn live_members(view: &impl ReadView, group_id: Uuid) -> Result<Vec<Membership>> {
    let mut members: Vec<Membership> = view
        .scan::<Membership>(Table::Memberships, group_id.as_bytes())?
        .into_iter()
        .map(|(_, m)| m)
        .filter(Membership::is_live)
        .collect();
    members.sort_by_key(|m| m.draw_order);
    Ok(members)
}

/// Load a cycle
pub fn cycle(view: &impl ReadView, cycle_id: Uuid) -> Result<Cycle> {
    view.get(Table::Cycles, &keys::id(&cycle_id))?
        .ok_or_else(|| Error::not_found("cycle", cycle_id))
}

/// Shares of a cycle
pub fn cycle_shares(view: &impl ReadView, cycle_id: Uuid) -> Result<Vec<CycleShare>> {
    Ok(view
        .scan::<CycleShare>(Table::CycleShares, cycle_id.as_bytes())?
        .into_iter()
        .map(|(_, s)| s)
        .collect())
}

/// Cycles of a group by cycle number
pub fn cycles_of(view: &impl ReadView, group_id: Uuid) -> Result<Vec<Cycle>> {
    view.scan::<Uuid>(Table::Indices, &keys::cycles_of(&group_id))?
        .into_iter()
        .map(|(_, cycle_id)| cycle(view, cycle_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Directory;
    use crate::storage::Storage;
    use crate::types::CreditStatus;
    use crate::Config;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    struct Fixture {
        storage: Storage,
        engine: RotationEngine,
        directory: Arc<Directory>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let directory = Arc::new(Directory::new());
        Fixture {
            storage: Storage::open(&config).unwrap(),
            engine: RotationEngine::new(directory.clone(), CreditIssuance::new(Duration::days(30))),
            directory,
            _temp: temp,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn start() -> DateTime<Utc> {
        t0() + Duration::days(7)
    }

    fn member(f: &Fixture) -> BeneficiaryRef {
        let who = BeneficiaryRef::Member(Uuid::new_v4());
        f.directory.register(who);
        who
    }

    /// Group with `n` members joined in order, committed before start
    fn group_with_members(f: &Fixture, n: usize, amount: i64) -> (RotationGroup, Vec<Membership>) {
        let mut tx = f.storage.begin(t0());
        let cycle_amount = Amount::from_units(amount);
        let group = f
            .engine
            .create_group(&mut tx, "Tanda", cycle_amount, Frequency::Monthly, start(), None)
            .unwrap();
        let members = (0..n)
            .map(|_| {
                let who = member(f);
                f.engine.join(&mut tx, group.group_id, who, None).unwrap()
            })
            .collect();
        tx.commit().unwrap();
        (group, members)
    }

    fn started(outcome: CycleOutcome) -> (Cycle, Vec<CycleShare>) {
        match outcome {
            CycleOutcome::Started { cycle, shares } => (cycle, shares),
            other => panic!("expected a started cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_create_group_validation() {
        let f = fixture();
        let mut tx = f.storage.begin(t0());
        assert!(matches!(
            f.engine.create_group(&mut tx, "G", Amount::ZERO, Frequency::Weekly, start(), None),
            Err(Error::Validation(_))
        ));
        let one = Amount::from_units(1);
        assert!(matches!(
            f.engine
                .create_group(&mut tx, "G", one, Frequency::Weekly, start(), Some(t0())),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.engine.create_group(&mut tx, "  ", one, Frequency::Weekly, start(), None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_join_assigns_free_slots() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 3, 100);
        let orders: Vec<u32> = members.iter().map(|m| m.draw_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);

        let mut tx = f.storage.begin(t0());
        f.engine.leave(&mut tx, group.group_id, members[1].beneficiary).unwrap();
        let newcomer = member(&f);
        let joined = f.engine.join(&mut tx, group.group_id, newcomer, None).unwrap();
        assert_eq!(joined.draw_order, 2);
    }

    #[test]
    fn test_join_with_taken_slot_conflicts() {
        let f = fixture();
        let (group, _) = group_with_members(&f, 2, 100);
        let mut tx = f.storage.begin(t0());
        let who = member(&f);
        assert!(matches!(
            f.engine.join(&mut tx, group.group_id, who, Some(2)),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            f.engine.join(&mut tx, group.group_id, who, Some(0)),
            Err(Error::Validation(_))
        ));
        assert_eq!(f.engine.join(&mut tx, group.group_id, who, Some(7)).unwrap().draw_order, 7);
    }

    #[test]
    fn test_join_twice_conflicts() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 1, 100);
        let mut tx = f.storage.begin(t0());
        assert!(matches!(
            f.engine.join(&mut tx, group.group_id, members[0].beneficiary, None),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_join_unknown_beneficiary() {
        let f = fixture();
        let (group, _) = group_with_members(&f, 1, 100);
        let mut tx = f.storage.begin(t0());
        let stranger = BeneficiaryRef::Prospect(Uuid::new_v4());
        assert!(matches!(
            f.engine.join(&mut tx, group.group_id, stranger, None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_membership_closed_after_start() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 2, 100);
        let mut tx = f.storage.begin(start() + Duration::hours(1));
        let who = member(&f);
        assert!(matches!(
            f.engine.join(&mut tx, group.group_id, who, None),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            f.engine.leave(&mut tx, group.group_id, members[0].beneficiary),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_leave_without_membership_is_not_found() {
        let f = fixture();
        let (group, _) = group_with_members(&f, 1, 100);
        let mut tx = f.storage.begin(t0());
        let outsider = member(&f);
        assert!(matches!(
            f.engine.leave(&mut tx, group.group_id, outsider),
            Err(Error::NotFound { entity: "membership", .. })
        ));
    }

    #[test]
    fn test_start_cycle_before_start_date_conflicts() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 3, 100);

        let mut tx = f.storage.begin(start() - Duration::minutes(1));
        assert!(matches!(
            f.engine.start_next_cycle(&mut tx, group.group_id),
            Err(Error::Conflict(msg)) if msg.contains("starts at")
        ));
        assert!(tx.events().is_empty());
        drop(tx);
        assert!(cycles_of(&f.storage, group.group_id).unwrap().is_empty());
        assert_eq!(group_of(&f, group.group_id).last_cycle_number, 0);

        // Members can still rearrange before the start, and the first cycle
        // then sees the final roster
        let mut tx = f.storage.begin(t0());
        f.engine.leave(&mut tx, group.group_id, members[0].beneficiary).unwrap();
        let newcomer = member(&f);
        assert_eq!(f.engine.join(&mut tx, group.group_id, newcomer, None).unwrap().draw_order, 1);
        tx.commit().unwrap();

        let mut tx = f.storage.begin(start());
        let (cycle, shares) = started(f.engine.start_next_cycle(&mut tx, group.group_id).unwrap());
        assert_eq!(cycle.beneficiary, newcomer);
        assert!(shares.iter().all(|s| s.beneficiary != members[0].beneficiary));
    }

    #[test]
    fn test_suspend_resume_terminate() {
        let f = fixture();
        let (group, _) = group_with_members(&f, 1, 100);
        let mut tx = f.storage.begin(t0());
        let id = group.group_id;

        assert!(matches!(f.engine.resume(&mut tx, id), Err(Error::Conflict(_))));
        assert_eq!(f.engine.suspend(&mut tx, id).unwrap().status, GroupStatus::Suspended);
        assert!(matches!(f.engine.start_next_cycle(&mut tx, id), Err(Error::Conflict(_))));
        assert!(matches!(f.engine.terminate(&mut tx, id), Err(Error::Conflict(_))));
        assert_eq!(f.engine.resume(&mut tx, id).unwrap().status, GroupStatus::Active);
        assert_eq!(f.engine.terminate(&mut tx, id).unwrap().status, GroupStatus::Terminated);
        assert!(matches!(f.engine.resume(&mut tx, id), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_start_cycle_without_members_conflicts() {
        let f = fixture();
        let (group, _) = group_with_members(&f, 0, 100);
        let mut tx = f.storage.begin(start());
        assert!(matches!(
            f.engine.start_next_cycle(&mut tx, group.group_id),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_start_cycle_fans_out_shares() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 4, 1000);
        let mut tx = f.storage.begin(start());
        let (cycle, shares) = started(f.engine.start_next_cycle(&mut tx, group.group_id).unwrap());
        tx.commit().unwrap();

        assert_eq!(cycle.cycle_number, 1);
        assert_eq!(cycle.pot, Amount::from_units(4000));
        assert_eq!(cycle.beneficiary, members[0].beneficiary);
        assert_eq!(shares.len(), 4);
        assert!(shares
            .iter()
            .all(|s| s.status == ShareStatus::Pending && s.amount == Amount::from_units(1000)));

        assert_eq!(cycle_shares(&f.storage, cycle.cycle_id).unwrap().len(), 4);
        assert_eq!(cycles_of(&f.storage, group.group_id).unwrap(), vec![cycle.clone()]);
        assert_eq!(group_of(&f, group.group_id).running_cycle, Some(cycle.cycle_id));

        let mut tx = f.storage.begin(start());
        assert!(matches!(
            f.engine.start_next_cycle(&mut tx, group.group_id),
            Err(Error::Conflict(msg)) if msg.contains("already running")
        ));
    }

    fn group_of(f: &Fixture, id: Uuid) -> RotationGroup {
        group(&f.storage, id).unwrap()
    }

    #[test]
    fn test_last_payment_closes_and_issues() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 4, 1000);
        let mut tx = f.storage.begin(start());
        let (cycle, _) = started(f.engine.start_next_cycle(&mut tx, group.group_id).unwrap());
        tx.commit().unwrap();

        let mut tx = f.storage.begin(start() + Duration::days(1));
        for m in &members[..3] {
            let payment = f
                .engine
                .pay_contribution(&mut tx, cycle.cycle_id, m.membership_id)
                .unwrap();
            assert!(payment.closed.is_none());
        }
        let last = f
            .engine
            .pay_contribution(&mut tx, cycle.cycle_id, members[3].membership_id)
            .unwrap();
        tx.commit().unwrap();

        let closure = last.closed.expect("cycle should close");
        assert_eq!(closure.cycle.status, CycleStatus::Complete);
        let IssueOutcome::Issued(credit) = closure.credit else {
            panic!("expected a new credit");
        };
        assert_eq!(credit.ceiling, Amount::from_units(4000));
        assert_eq!(credit.beneficiary, members[0].beneficiary);
        assert_eq!(credit.source, CreditSource::FromRotation(cycle.cycle_id));
        assert_eq!(credit.status, CreditStatus::Active);
        assert_eq!(group_of(&f, group.group_id).running_cycle, None);
    }

    #[test]
    fn test_pay_twice_and_unknown_share() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 2, 10);
        let mut tx = f.storage.begin(start());
        let (cycle, _) = started(f.engine.start_next_cycle(&mut tx, group.group_id).unwrap());
        f.engine
            .pay_contribution(&mut tx, cycle.cycle_id, members[0].membership_id)
            .unwrap();
        assert!(matches!(
            f.engine.pay_contribution(&mut tx, cycle.cycle_id, members[0].membership_id),
            Err(Error::AlreadyPaid(_))
        ));
        assert!(matches!(
            f.engine.pay_contribution(&mut tx, cycle.cycle_id, Uuid::new_v4()),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            f.engine.pay_contribution(&mut tx, Uuid::new_v4(), members[0].membership_id),
            Err(Error::NotFound { entity: "cycle", .. })
        ));
    }

    #[test]
    fn test_group_terminates_after_last_draw() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 3, 50);

        for round in 1..=3u32 {
            let mut tx = f.storage.begin(start() + Duration::days(i64::from(round)));
            let (cycle, _) = started(f.engine.start_next_cycle(&mut tx, group.group_id).unwrap());
            assert_eq!(cycle.cycle_number, round);
            for m in &members {
                f.engine.pay_contribution(&mut tx, cycle.cycle_id, m.membership_id).unwrap();
            }
            tx.commit().unwrap();
        }

        let mut tx = f.storage.begin(start() + Duration::days(10));
        let outcome = f.engine.start_next_cycle(&mut tx, group.group_id).unwrap();
        let events = tx.commit().unwrap();

        let CycleOutcome::Terminated(terminated) = outcome else {
            panic!("expected termination");
        };
        assert_eq!(terminated.status, GroupStatus::Terminated);
        assert_eq!(cycles_of(&f.storage, group.group_id).unwrap().len(), 3);
        assert!(matches!(events.as_slice(), [EngineEvent::GroupTerminated { .. }]));
    }

    #[test]
    fn test_gap_in_draw_orders_terminates_early() {
        let f = fixture();
        let (group, members) = group_with_members(&f, 3, 50);
        let mut tx = f.storage.begin(t0());
        f.engine.leave(&mut tx, group.group_id, members[0].beneficiary).unwrap();
        tx.commit().unwrap();

        let mut tx = f.storage.begin(start());
        assert!(matches!(
            f.engine.start_next_cycle(&mut tx, group.group_id).unwrap(),
            CycleOutcome::Terminated(_)
        ));
    }
}
