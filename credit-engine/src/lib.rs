//! Cooperative Credit Engine
//!
//! Lifecycle engine for a community savings cooperative: membership dues,
//! rotating savings groups, and the capped spending credits both of them
//! produce.
//!
//! # Architecture
//!
//! - **Unit of work**: every transition runs in one [`storage::Transaction`]
//!   that holds the store's writer lock and commits as a single RocksDB batch
//! - **Services take the transaction**: issuance runs inside the caller's
//!   transaction, so a payment and the credit it triggers commit together
//! - **Post-commit side channels**: notifications and audit entries are
//!   delivered only after commit and can never fail an operation
//! - **Injected clock**: expiration math and the sweep are deterministic
//!
//! # Invariants
//!
//! - Credit balance: `ceiling == used + remaining`, remaining never negative
//! - Exhaustion: a non-expired credit is EXHAUSTED iff `remaining <= 0`
//! - One ACTIVE credit per (beneficiary, source kind, source reference)
//! - A cycle closes exactly once and issues exactly one credit
//! - A second sweep at the same instant changes nothing

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod amount;
pub mod audit;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod consumption;
pub mod contribution;
pub mod engine;
pub mod error;
pub mod events;
pub mod issuance;
pub mod metrics;
pub mod rotation;
pub mod scheduler;
pub mod storage;
pub mod sweeper;
pub mod types;

// Re-exports
pub use amount::Amount;
pub use audit::HashChainAuditLog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AuditEntry, AuditSink, CollaboratorError, Directory, IdentityLookup, LogNotifier, Notifier,
    NullAudit,
};
pub use config::Config;
pub use consumption::{CreditConsumption, Inventory, Purchase, Reversal, StockLedger};
pub use contribution::ContributionTracker;
pub use engine::CreditEngine;
pub use error::{Error, Result};
pub use events::{EngineEvent, Role};
pub use issuance::{CreditIssuance, IssueOutcome};
pub use metrics::Metrics;
pub use rotation::{CycleClosure, CycleOutcome, RotationEngine, SharePayment};
pub use scheduler::{SweepSchedule, SweepScheduler};
pub use storage::Storage;
pub use sweeper::{SweepReport, Sweeper};
pub use types::{
    BeneficiaryRef, ConsumptionRecord, ConsumptionReversal, Contribution, ContributionStatus,
    CreditSource, CreditStatus, Cycle, CycleShare, CycleStatus, Frequency, GroupStatus, LineItem,
    Membership, PeriodKind, RotationGroup, ShareStatus, SourceKind, SpendingCredit, StockItem,
};
