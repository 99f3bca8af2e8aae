//! Expiration sweep
//!
//! Two passes, each in its own transaction:
//!
//! 1. PENDING contributions with `expires_at < now` become EXPIRED
//! 2. ACTIVE credits with `expires_at < now` become EXPIRED (balances untouched)
//!
//! Each row is re-read and re-checked under the writer lock before it is
//! changed, so overlapping sweeps cannot double count and a second run at the
//! same `now` reports zero.

use crate::contribution::ContributionTracker;
use crate::issuance;
use crate::storage::{keys, Storage, Table, Transaction};
use crate::types::{CreditStatus, SpendingCredit};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rows changed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Contributions moved PENDING → EXPIRED
    pub contributions_expired: u64,
    /// Credits moved ACTIVE → EXPIRED
    pub credits_expired: u64,
}

impl SweepReport {
    /// Nothing changed
    pub fn is_empty(&self) -> bool {
        self.contributions_expired == 0 && self.credits_expired == 0
    }
}

/// Expiration sweeper
#[derive(Debug, Clone)]
pub struct Sweeper {
    storage: Arc<Storage>,
    contributions: ContributionTracker,
}

impl Sweeper {
    /// Create sweeper over `storage`
    pub fn new(storage: Arc<Storage>, contributions: ContributionTracker) -> Self {
        Self {
            storage,
            contributions,
        }
    }

    /// Run both passes as of `now`
    pub fn run(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut tx = self.storage.begin(now);
        let contributions_expired = self.contributions.sweep_expire(&mut tx, now)?;
        tx.commit()?;

        let mut tx = self.storage.begin(now);
        let credits_expired = expire_credits(&mut tx, now)?;
        tx.commit()?;

        let report = SweepReport {
            contributions_expired,
            credits_expired,
        };
        if report.is_empty() {
            tracing::debug!(%now, "Sweep found nothing to expire");
        } else {
            tracing::info!(
                %now,
                contributions_expired,
                credits_expired,
                "Sweep complete"
            );
        }
        Ok(report)
    }
}

/// Expire every ACTIVE credit past its expiration
pub fn expire_credits(tx: &mut Transaction<'_>, now: DateTime<Utc>) -> Result<u64> {
    let overdue: Vec<SpendingCredit> = tx
        .scan::<SpendingCredit>(Table::Credits, &[])?
        .into_iter()
        .map(|(_, credit)| credit)
        .filter(|credit| {
            credit.status == CreditStatus::Active && credit.expires_at.map_or(false, |at| at < now)
        })
        .collect();

    for mut credit in overdue.iter().cloned() {
        credit.status = CreditStatus::Expired;
        tx.put(Table::Credits, keys::id(&credit.credit_id), &credit)?;
        issuance::deactivate(tx, &credit);
        tracing::debug!(
            credit_id = %credit.credit_id,
            remaining = %credit.remaining,
            "Credit expired"
        );
    }

    Ok(overdue.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::collaborators::Directory;
    use crate::issuance::CreditIssuance;
    use crate::types::{BeneficiaryRef, ContributionStatus, CreditSource, PeriodKind};
    use crate::Config;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn setup() -> (Sweeper, Arc<Storage>, ContributionTracker, Arc<Directory>, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config).unwrap());
        let directory = Arc::new(Directory::new());
        let tracker =
            ContributionTracker::new(directory.clone(), CreditIssuance::new(Duration::days(30)));
        let sweeper = Sweeper::new(storage.clone(), tracker.clone());
        (sweeper, storage, tracker, directory, temp)
    }

    #[test]
    fn test_sweep_twice_is_noop() {
        let (sweeper, storage, tracker, directory, _temp) = setup();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let mut tx = storage.begin(t0);
        for _ in 0..3 {
            let who = BeneficiaryRef::Prospect(Uuid::new_v4());
            directory.register(who);
            tracker
                .create(&mut tx, who, Amount::from_units(20), PeriodKind::Monthly)
                .unwrap();
        }
        let payer = BeneficiaryRef::Member(Uuid::new_v4());
        directory.register(payer);
        let paid = tracker
            .create(&mut tx, payer, Amount::from_units(20), PeriodKind::Monthly)
            .unwrap();
        tracker.mark_paid(&mut tx, paid.contribution_id).unwrap();
        tx.commit().unwrap();

        let now = t0 + Duration::days(60);
        let first = sweeper.run(now).unwrap();
        assert_eq!(
            first,
            SweepReport {
                contributions_expired: 3,
                credits_expired: 1,
            }
        );
        assert!(sweeper.run(now).unwrap().is_empty());

        let stored = crate::contribution::contribution(&*storage, paid.contribution_id).unwrap();
        assert_eq!(stored.status, ContributionStatus::Paid);
    }

    #[test]
    fn test_expired_credit_keeps_balance_and_frees_slot() {
        let (sweeper, storage, _, _, _temp) = setup();
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let who = BeneficiaryRef::Member(Uuid::new_v4());
        let source = CreditSource::FromContribution(Uuid::new_v4());

        let mut tx = storage.begin(t0);
        let issued = CreditIssuance::new(Duration::days(30))
            .issue_from_source(&mut tx, who, source, Amount::from_units(500))
            .unwrap();
        tx.commit().unwrap();

        // Not yet due
        assert!(sweeper.run(t0 + Duration::days(29)).unwrap().is_empty());

        let report = sweeper.run(t0 + Duration::days(31)).unwrap();
        assert_eq!(report.credits_expired, 1);

        let credit = issuance::credit(&*storage, issued.credit_id()).unwrap();
        assert_eq!(credit.status, CreditStatus::Expired);
        assert_eq!(credit.remaining, Amount::from_units(500));
        let slot = keys::active_credit(&who, &source);
        assert_eq!(storage.get::<Uuid>(Table::Indices, &slot).unwrap(), None);
    }

    #[test]
    fn test_credit_expiring_exactly_now_is_kept() {
        let (sweeper, storage, _, _, _temp) = setup();
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut tx = storage.begin(t0);
        CreditIssuance::new(Duration::days(30))
            .issue_from_source(
                &mut tx,
                BeneficiaryRef::Member(Uuid::new_v4()),
                CreditSource::FromRotation(Uuid::new_v4()),
                Amount::from_units(1),
            )
            .unwrap();
        tx.commit().unwrap();

        assert!(sweeper.run(t0 + Duration::days(30)).unwrap().is_empty());
    }
}
