//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `contributions` - Membership dues (key: contribution_id)
//! - `groups` - Rotation groups (key: group_id)
//! - `memberships` - Group members (key: group_id || membership_id)
//! - `cycles` - Rotation cycles (key: cycle_id)
//! - `cycle_shares` - Per-member cycle shares (key: cycle_id || membership_id)
//! - `credits` - Spending credits (key: credit_id)
//! - `consumptions` - Consumption records (key: consumption_id)
//! - `reversals` - Consumption reversals (key: consumption_id)
//! - `stock` - Built-in inventory (key: product_id)
//! - `indices` - Secondary indices, see [`keys`]
//!
//! # Transactions
//!
//! Every mutation goes through a [`Transaction`]. A transaction holds the
//! store's single writer lock from `begin` until it is committed or dropped,
//! which makes all read-check-write sequences inside it serializable. Writes
//! are staged in memory and applied with one `WriteBatch` on commit; a
//! dropped transaction leaves the database untouched.

use crate::{
    error::{Error, Result},
    events::EngineEvent,
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Logical tables, one column family each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Membership dues
    Contributions,
    /// Rotation groups
    Groups,
    /// Group memberships
    Memberships,
    /// Rotation cycles
    Cycles,
    /// Per-member cycle shares
    CycleShares,
    /// Spending credits
    Credits,
    /// Consumption records
    Consumptions,
    /// Consumption reversals
    Reversals,
    /// Built-in inventory
    Stock,
    /// Secondary indices
    Indices,
}

impl Table {
    /// Every table
    pub const ALL: [Table; 10] = [
        Table::Contributions,
        Table::Groups,
        Table::Memberships,
        Table::Cycles,
        Table::CycleShares,
        Table::Credits,
        Table::Consumptions,
        Table::Reversals,
        Table::Stock,
        Table::Indices,
    ];

    /// Column family name
    pub fn cf_name(&self) -> &'static str {
        match self {
            Table::Contributions => "contributions",
            Table::Groups => "groups",
            Table::Memberships => "memberships",
            Table::Cycles => "cycles",
            Table::CycleShares => "cycle_shares",
            Table::Credits => "credits",
            Table::Consumptions => "consumptions",
            Table::Reversals => "reversals",
            Table::Stock => "stock",
            Table::Indices => "indices",
        }
    }
}

/// Key layouts
///
/// Composite keys are raw byte concatenations of fixed-width parts, so a
/// prefix scan on the leading parts returns the rows of one parent in order.
pub mod keys {
    use crate::types::{BeneficiaryRef, CreditSource};
    use crate::{Error, Result};
    use uuid::Uuid;

    const CONTRIBUTION_BY_BENEFICIARY: &[u8] = b"cb";
    const CYCLE_BY_NUMBER: &[u8] = b"gc";
    const ACTIVE_CREDIT: &[u8] = b"ac";
    const CREDIT_BY_BENEFICIARY: &[u8] = b"bc";
    const CONSUMPTION_BY_CREDIT: &[u8] = b"cc";

    fn compose(parts: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    /// Primary key of a single-id row
    pub fn id(id: &Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    /// Primary key of a child row: parent || child
    pub fn pair(parent: &Uuid, child: &Uuid) -> Vec<u8> {
        compose(&[parent.as_bytes(), child.as_bytes()])
    }

    /// Index: beneficiary -> contributions
    pub fn contribution_by_beneficiary(
        beneficiary: &BeneficiaryRef,
        contribution_id: &Uuid,
    ) -> Vec<u8> {
        compose(&[
            CONTRIBUTION_BY_BENEFICIARY,
            &beneficiary.key_bytes(),
            contribution_id.as_bytes(),
        ])
    }

    /// Prefix for [`contribution_by_beneficiary`]
    pub fn contributions_of(beneficiary: &BeneficiaryRef) -> Vec<u8> {
        compose(&[CONTRIBUTION_BY_BENEFICIARY, &beneficiary.key_bytes()])
    }

    /// Index: group || cycle number -> cycle_id
    pub fn cycle_by_number(group_id: &Uuid, cycle_number: u32) -> Vec<u8> {
        compose(&[CYCLE_BY_NUMBER, group_id.as_bytes(), &cycle_number.to_be_bytes()])
    }

    /// Prefix for [`cycle_by_number`]
    pub fn cycles_of(group_id: &Uuid) -> Vec<u8> {
        compose(&[CYCLE_BY_NUMBER, group_id.as_bytes()])
    }

    /// Unique key: (beneficiary, source kind, source ref) -> ACTIVE credit_id
    pub fn active_credit(beneficiary: &BeneficiaryRef, source: &CreditSource) -> Vec<u8> {
        compose(&[
            ACTIVE_CREDIT,
            &beneficiary.key_bytes(),
            source.kind().as_str().as_bytes(),
            source.reference().as_bytes(),
        ])
    }

    /// Index: beneficiary -> credits
    pub fn credit_by_beneficiary(beneficiary: &BeneficiaryRef, credit_id: &Uuid) -> Vec<u8> {
        compose(&[CREDIT_BY_BENEFICIARY, &beneficiary.key_bytes(), credit_id.as_bytes()])
    }

    /// Prefix for [`credit_by_beneficiary`]
    pub fn credits_of(beneficiary: &BeneficiaryRef) -> Vec<u8> {
        compose(&[CREDIT_BY_BENEFICIARY, &beneficiary.key_bytes()])
    }

    /// Index: credit -> consumptions
    pub fn consumption_by_credit(credit_id: &Uuid, consumption_id: &Uuid) -> Vec<u8> {
        compose(&[CONSUMPTION_BY_CREDIT, credit_id.as_bytes(), consumption_id.as_bytes()])
    }

    /// Prefix for [`consumption_by_credit`]
    pub fn consumptions_of(credit_id: &Uuid) -> Vec<u8> {
        compose(&[CONSUMPTION_BY_CREDIT, credit_id.as_bytes()])
    }

    /// Last 16 bytes of a key as a UUID
    pub fn trailing_id(key: &[u8]) -> Result<Uuid> {
        if key.len() < 16 {
            return Err(Error::Storage(format!("Index key too short: {} bytes", key.len())));
        }
        Uuid::from_slice(&key[key.len() - 16..]).map_err(|e| Error::Storage(e.to_string()))
    }
}

/// Read access shared by committed storage and open transactions
pub trait ReadView {
    /// Read one row
    fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>>;

    /// Read rows whose key starts with `prefix`
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>>;
}

impl ReadView for Storage {
    fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        Storage::get(self, table, key)
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        Storage::scan(self, table, prefix)
    }
}

impl ReadView for Transaction<'_> {
    fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        Transaction::get(self, table, key)
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        Transaction::scan(self, table, prefix)
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    writer: Mutex<()>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.cf_name(), Self::cf_options(*table)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Table::ALL.len(),
            "Opened credit store"
        );

        Ok(Self {
            db,
            writer: Mutex::new(()),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf_options(table: Table) -> Options {
        let mut opts = Options::default();
        match table {
            // Immutable history compresses well
            Table::Consumptions | Table::Reversals => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            Table::Indices => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, table: Table) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(table.cf_name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", table.cf_name())))
    }

    /// Begin a unit of work; blocks until the writer lock is free
    pub fn begin(&self, now: DateTime<Utc>) -> Transaction<'_> {
        let guard = self.writer.lock();
        Transaction {
            storage: self,
            _guard: guard,
            now,
            writes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Read a committed row
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read committed rows whose key starts with `prefix`
    pub fn scan<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_raw(table, prefix)?
            .into_iter()
            .map(|(key, value)| Ok((key, bincode::deserialize(&value)?)))
            .collect()
    }

    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(table)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn scan_raw(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(table)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };

        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn write_batch(&self, writes: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>) -> Result<usize> {
        let mut batch = WriteBatch::default();
        for ((table, key), value) in &writes {
            let cf = self.cf_handle(*table)?;
            match value {
                Some(bytes) => batch.put_cf(cf, key, bytes),
                None => batch.delete_cf(cf, key),
            }
        }

        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(writes.len())
    }
}

/// Unit of work over the store
///
/// Services receive `&mut Transaction` and must never begin their own; the
/// caller that began the transaction decides whether it commits.
pub struct Transaction<'a> {
    storage: &'a Storage,
    _guard: MutexGuard<'a, ()>,
    now: DateTime<Utc>,
    writes: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
    events: Vec<EngineEvent>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("now", &self.now)
            .field("staged_writes", &self.writes.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl<'a> Transaction<'a> {
    /// Clock value captured when the transaction began
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Read a row, seeing this transaction's staged writes
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        let bytes = match self.writes.get(&(table, key.to_vec())) {
            Some(staged) => staged.clone(),
            None => self.storage.get_raw(table, key)?,
        };
        match bytes {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read rows whose key starts with `prefix`, merged with staged writes
    pub fn scan<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.storage.scan_raw(table, prefix)?.into_iter().collect();

        let start = (table, prefix.to_vec());
        for ((staged_table, key), value) in self.writes.range(start..) {
            if *staged_table != table || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged
            .into_iter()
            .map(|(key, value)| Ok((key, bincode::deserialize(&value)?)))
            .collect()
    }

    /// Stage a row write
    pub fn put<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.writes.insert((table, key), Some(bytes));
        Ok(())
    }

    /// Stage a row deletion
    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.writes.insert((table, key), None);
    }

    /// Record an event to dispatch after commit
    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Events recorded so far
    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Apply all staged writes atomically and release the writer lock
    pub fn commit(mut self) -> Result<Vec<EngineEvent>> {
        let writes = std::mem::take(&mut self.writes);
        let events = std::mem::take(&mut self.events);
        if !writes.is_empty() {
            let count = self.storage.write_batch(writes)?;
            tracing::debug!(writes = count, events = events.len(), "Transaction committed");
        }
        Ok(events)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.writes.is_empty() {
            tracing::debug!(
                discarded_writes = self.writes.len(),
                "Transaction rolled back"
            );
        }
    }
}
