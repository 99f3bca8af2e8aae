//! Contribution tracker
//!
//! Owns the dues state machine:
//!
//! ```text
//! PENDING ──mark_paid──▶ PAID        (issues a credit in the same transaction)
//!    │
//!    └──sweep (expires_at < now)──▶ EXPIRED
//! ```
//!
//! A beneficiary holds at most one live contribution (PENDING, or PAID and not
//! yet past its expiration); `create` checks this under the writer lock.

use crate::amount::Amount;
use crate::collaborators::IdentityLookup;
use crate::events::EngineEvent;
use crate::issuance::{CreditIssuance, IssueOutcome};
use crate::storage::{keys, ReadView, Table, Transaction};
use crate::types::{BeneficiaryRef, Contribution, ContributionStatus, CreditSource, PeriodKind};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Contribution tracker service
#[derive(Clone)]
pub struct ContributionTracker {
    identity: Arc<dyn IdentityLookup>,
    issuance: CreditIssuance,
}

impl std::fmt::Debug for ContributionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContributionTracker")
            .field("issuance", &self.issuance)
            .finish()
    }
}

impl ContributionTracker {
    /// Create tracker
    pub fn new(identity: Arc<dyn IdentityLookup>, issuance: CreditIssuance) -> Self {
        Self { identity, issuance }
    }

    /// Open a PENDING contribution expiring one period from now
    pub fn create(
        &self,
        tx: &mut Transaction<'_>,
        beneficiary: BeneficiaryRef,
        amount: Amount,
        period: PeriodKind,
    ) -> Result<Contribution> {
        if !amount.is_positive() {
            return Err(Error::Validation(format!(
                "Contribution amount must be positive, got {}",
                amount
            )));
        }
        ensure_beneficiary(self.identity.as_ref(), &beneficiary)?;

        let now = tx.now();
        if let Some(live) = contributions_of(tx, &beneficiary)?
            .into_iter()
            .find(|c| c.is_live(now))
        {
            return Err(Error::Conflict(format!(
                "{} already holds live contribution {} ({})",
                beneficiary, live.contribution_id, live.status
            )));
        }

        let contribution = Contribution {
            contribution_id: Uuid::now_v7(),
            beneficiary,
            amount,
            period,
            status: ContributionStatus::Pending,
            created_at: now,
            paid_at: None,
            expires_at: period.expiration_from(now)?,
        };

        tx.put(
            Table::Contributions,
            keys::id(&contribution.contribution_id),
            &contribution,
        )?;
        tx.put(
            Table::Indices,
            keys::contribution_by_beneficiary(&beneficiary, &contribution.contribution_id),
            &(),
        )?;

        tracing::info!(
            contribution_id = %contribution.contribution_id,
            %beneficiary,
            amount = %amount,
            period = %period,
            expires_at = %contribution.expires_at,
            "Contribution created"
        );

        Ok(contribution)
    }

    /// Mark a PENDING contribution paid and issue its credit
    pub fn mark_paid(
        &self,
        tx: &mut Transaction<'_>,
        contribution_id: Uuid,
    ) -> Result<(Contribution, IssueOutcome)> {
        let mut contribution = contribution(tx, contribution_id)?;

        match contribution.status {
            ContributionStatus::Pending => {}
            ContributionStatus::Paid => return Err(Error::AlreadyPaid(contribution_id)),
            ContributionStatus::Expired => {
                return Err(Error::Conflict(format!(
                    "Contribution {} expired at {}",
                    contribution_id, contribution.expires_at
                )))
            }
        }

        let now = tx.now();
        contribution.status = ContributionStatus::Paid;
        contribution.paid_at = Some(now);
        tx.put(Table::Contributions, keys::id(&contribution_id), &contribution)?;
        tx.emit(EngineEvent::ContributionPaid {
            contribution_id,
            beneficiary: contribution.beneficiary,
            amount: contribution.amount,
            at: now,
        });

        tracing::info!(
            %contribution_id,
            beneficiary = %contribution.beneficiary,
            "Contribution paid"
        );

        let outcome = self.issuance.issue_from_source(
            tx,
            contribution.beneficiary,
            CreditSource::FromContribution(contribution_id),
            contribution.amount,
        )?;

        Ok((contribution, outcome))
    }

    /// Expire every PENDING contribution whose expiration is before `now`
    pub fn sweep_expire(&self, tx: &mut Transaction<'_>, now: DateTime<Utc>) -> Result<u64> {
        let overdue: Vec<Contribution> = tx
            .scan::<Contribution>(Table::Contributions, &[])?
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| c.status == ContributionStatus::Pending && c.expires_at < now)
            .collect();

        for mut contribution in overdue.iter().cloned() {
            contribution.status = ContributionStatus::Expired;
            tx.put(
                Table::Contributions,
                keys::id(&contribution.contribution_id),
                &contribution,
            )?;
            tracing::debug!(
                contribution_id = %contribution.contribution_id,
                "Contribution expired"
            );
        }

        Ok(overdue.len() as u64)
    }
}

/// Fail unless the identity collaborator knows `beneficiary`
pub(crate) fn ensure_beneficiary(
    identity: &dyn IdentityLookup,
    beneficiary: &BeneficiaryRef,
) -> Result<()> {
    match identity.exists(beneficiary) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::not_found("beneficiary", beneficiary)),
        Err(e) => Err(Error::Identity(e.to_string())),
    }
}

/// Load a contribution
pub fn contribution(view: &impl ReadView, contribution_id: Uuid) -> Result<Contribution> {
    view.get(Table::Contributions, &keys::id(&contribution_id))?
        .ok_or_else(|| Error::not_found("contribution", contribution_id))
}

/// All contributions of a beneficiary, oldest first
pub fn contributions_of(
    view: &impl ReadView,
    beneficiary: &BeneficiaryRef,
) -> Result<Vec<Contribution>> {
    let index = view.scan::<()>(Table::Indices, &keys::contributions_of(beneficiary))?;
    index
        .iter()
        .map(|(key, _)| contribution(view, keys::trailing_id(key)?))
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
        tracker: ContributionTracker,
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
            tracker: ContributionTracker::new(
                directory.clone(),
                CreditIssuance::new(Duration::days(30)),
            ),
            directory,
            _temp: temp,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn member(f: &Fixture) -> BeneficiaryRef {
        let member = BeneficiaryRef::Member(Uuid::new_v4());
        f.directory.register(member);
        member
    }

    #[test]
    fn test_create_pending_with_monthly_expiry() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        let c = f
            .tracker
            .create(&mut tx, who, Amount::from_units(5000), PeriodKind::Monthly)
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(c.status, ContributionStatus::Pending);
        assert_eq!(c.paid_at, None);
        assert_eq!(c.expires_at, Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap());
        assert_eq!(contributions_of(&f.storage, &who).unwrap(), vec![c]);
    }

    #[test]
    fn test_create_rejects_unknown_beneficiary() {
        let f = fixture();
        let mut tx = f.storage.begin(t0());
        let result = f.tracker.create(
            &mut tx,
            BeneficiaryRef::Prospect(Uuid::new_v4()),
            Amount::from_units(10),
            PeriodKind::Annual,
        );
        assert!(matches!(result, Err(Error::NotFound { entity: "beneficiary", .. })));
    }

    #[test]
    fn test_create_rejects_second_live_contribution() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        f.tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        let second = f.tracker.create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly);
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_create_allowed_after_paid_contribution_expires() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        let c = f
            .tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        f.tracker.mark_paid(&mut tx, c.contribution_id).unwrap();
        tx.commit().unwrap();

        // Still live a week later
        let mut tx = f.storage.begin(t0() + Duration::days(7));
        assert!(f
            .tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .is_err());
        drop(tx);

        let mut tx = f.storage.begin(t0() + Duration::days(40));
        f.tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
    }

    #[test]
    fn test_mark_paid_issues_credit() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        let c = f
            .tracker
            .create(&mut tx, who, Amount::from_units(5000), PeriodKind::Monthly)
            .unwrap();
        tx.commit().unwrap();

        let paid_at = t0() + Duration::days(3);
        let mut tx = f.storage.begin(paid_at);
        let (paid, outcome) = f.tracker.mark_paid(&mut tx, c.contribution_id).unwrap();
        let events = tx.commit().unwrap();

        assert_eq!(paid.status, ContributionStatus::Paid);
        assert_eq!(paid.paid_at, Some(paid_at));
        let IssueOutcome::Issued(credit) = outcome else {
            panic!("expected a new credit");
        };
        assert_eq!(credit.ceiling, Amount::from_units(5000));
        assert_eq!(credit.status, CreditStatus::Active);
        assert_eq!(credit.expires_at, Some(paid_at + Duration::days(30)));
        assert_eq!(credit.source, CreditSource::FromContribution(c.contribution_id));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_mark_paid_twice_fails() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        let c = f
            .tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        f.tracker.mark_paid(&mut tx, c.contribution_id).unwrap();
        let again = f.tracker.mark_paid(&mut tx, c.contribution_id);
        assert!(matches!(again, Err(Error::AlreadyPaid(id)) if id == c.contribution_id));
    }

    #[test]
    fn test_mark_paid_missing() {
        let f = fixture();
        let mut tx = f.storage.begin(t0());
        let result = f.tracker.mark_paid(&mut tx, Uuid::new_v4());
        assert!(matches!(result, Err(Error::NotFound { entity: "contribution", .. })));
    }

    #[test]
    fn test_sweep_expires_only_overdue_pending() {
        let f = fixture();
        let (a, b) = (member(&f), member(&f));
        let mut tx = f.storage.begin(t0());
        let pending = f
            .tracker
            .create(&mut tx, a, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        let paid = f
            .tracker
            .create(&mut tx, b, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        f.tracker.mark_paid(&mut tx, paid.contribution_id).unwrap();
        tx.commit().unwrap();

        let later = t0() + Duration::days(45);
        let mut tx = f.storage.begin(later);
        assert_eq!(f.tracker.sweep_expire(&mut tx, later).unwrap(), 1);
        tx.commit().unwrap();

        assert_eq!(
            contribution(&f.storage, pending.contribution_id).unwrap().status,
            ContributionStatus::Expired
        );
        assert_eq!(
            contribution(&f.storage, paid.contribution_id).unwrap().status,
            ContributionStatus::Paid
        );

        let mut tx = f.storage.begin(later);
        assert_eq!(f.tracker.sweep_expire(&mut tx, later).unwrap(), 0);
    }

    #[test]
    fn test_mark_paid_after_expiry_conflicts() {
        let f = fixture();
        let who = member(&f);
        let mut tx = f.storage.begin(t0());
        let c = f
            .tracker
            .create(&mut tx, who, Amount::from_units(10), PeriodKind::Monthly)
            .unwrap();
        let later = t0() + Duration::days(45);
        f.tracker.sweep_expire(&mut tx, later).unwrap();
        assert!(matches!(
            f.tracker.mark_paid(&mut tx, c.contribution_id),
            Err(Error::Conflict(_))
        ));
    }
}
