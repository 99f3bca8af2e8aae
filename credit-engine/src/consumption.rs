//! Credit consumption
//!
//! Debits a spending credit against a purchase and takes the goods out of
//! stock. Validation runs to completion before anything is staged:
//!
//! 1. credit exists
//! 2. credit is ACTIVE and not past its expiration
//! 3. every line has quantity > 0 and a non-negative unit price
//! 4. every product exists and has enough stock (summed over its lines)
//! 5. the purchase total fits in the credit's remaining amount
//!
//! A rejected purchase leaves credit, stock and history untouched.

use crate::amount::Amount;
use crate::events::EngineEvent;
use crate::issuance::{self, credit};
use crate::storage::{keys, ReadView, Table, Transaction};
use crate::types::{
    ConsumptionRecord, ConsumptionReversal, CreditStatus, LineItem, SpendingCredit, StockItem,
};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Product stock seen by the consumption service
///
/// Implementations stage their changes in the caller's transaction so stock
/// moves commit together with the credit debit.
pub trait Inventory: Send + Sync {
    /// Units on hand, `None` when the product is unknown
    fn available(&self, tx: &Transaction<'_>, product_id: Uuid) -> Result<Option<u64>>;

    /// Remove units from stock
    fn decrement(&self, tx: &mut Transaction<'_>, product_id: Uuid, quantity: u64) -> Result<()>;

    /// Return units to stock
    fn increment(&self, tx: &mut Transaction<'_>, product_id: Uuid, quantity: u64) -> Result<()>;
}

/// Inventory kept in the engine's own `stock` table
#[derive(Debug, Default, Clone, Copy)]
pub struct StockLedger;

impl StockLedger {
    /// Add units of a product, creating it if needed
    pub fn restock(
        &self,
        tx: &mut Transaction<'_>,
        product_id: Uuid,
        name: &str,
        quantity: u64,
    ) -> Result<StockItem> {
        let item = match tx.get::<StockItem>(Table::Stock, &keys::id(&product_id))? {
            Some(mut item) => {
                item.available = item.available.checked_add(quantity).ok_or_else(|| {
                    Error::Validation(format!("Stock overflow for product {}", product_id))
                })?;
                if !name.is_empty() {
                    item.name = name.to_string();
                }
                item
            }
            None => StockItem {
                product_id,
                name: name.to_string(),
                available: quantity,
            },
        };
        tx.put(Table::Stock, keys::id(&product_id), &item)?;
        tracing::info!(
            %product_id,
            added = quantity,
            available = item.available,
            "Product restocked"
        );
        Ok(item)
    }

    fn load(tx: &Transaction<'_>, product_id: Uuid) -> Result<StockItem> {
        tx.get(Table::Stock, &keys::id(&product_id))?
            .ok_or_else(|| Error::not_found("product", product_id))
    }
}

impl Inventory for StockLedger {
    fn available(&self, tx: &Transaction<'_>, product_id: Uuid) -> Result<Option<u64>> {
        Ok(tx
            .get::<StockItem>(Table::Stock, &keys::id(&product_id))?
            .map(|item| item.available))
    }

    fn decrement(&self, tx: &mut Transaction<'_>, product_id: Uuid, quantity: u64) -> Result<()> {
        let mut item = Self::load(tx, product_id)?;
        item.available = item
            .available
            .checked_sub(quantity)
            .ok_or(Error::InsufficientStock {
                product_id,
                requested: quantity,
                available: item.available,
            })?;
        tx.put(Table::Stock, keys::id(&product_id), &item)
    }

    fn increment(&self, tx: &mut Transaction<'_>, product_id: Uuid, quantity: u64) -> Result<()> {
        let mut item = Self::load(tx, product_id)?;
        item.available = item.available.checked_add(quantity).ok_or_else(|| {
            Error::Validation(format!("Stock overflow for product {}", product_id))
        })?;
        tx.put(Table::Stock, keys::id(&product_id), &item)
    }
}

/// Committed purchase
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    /// Credit after the debit
    pub credit: SpendingCredit,
    /// One record per line item
    pub records: Vec<ConsumptionRecord>,
    /// Sum of line amounts
    pub total: Amount,
}

/// Committed reversal
#[derive(Debug, Clone, PartialEq)]
pub struct Reversal {
    /// Compensating entry
    pub reversal: ConsumptionReversal,
    /// Credit after the refund
    pub credit: SpendingCredit,
}

/// Credit consumption service
#[derive(Clone)]
pub struct CreditConsumption {
    inventory: Arc<dyn Inventory>,
}

impl std::fmt::Debug for CreditConsumption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditConsumption").finish_non_exhaustive()
    }
}

impl CreditConsumption {
    /// Create service
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// Debit `credit_id` for `items`
    pub fn consume(
        &self,
        tx: &mut Transaction<'_>,
        credit_id: Uuid,
        items: &[LineItem],
    ) -> Result<Purchase> {
        let mut credit = credit(tx, credit_id)?;
        let now = tx.now();
        if !credit.is_spendable(now) {
            return Err(Error::InactiveCredit(credit_id));
        }

        if items.is_empty() {
            return Err(Error::Validation("Purchase has no line items".to_string()));
        }
        let mut line_amounts = Vec::with_capacity(items.len());
        let mut per_product: BTreeMap<Uuid, u64> = BTreeMap::new();
        for item in items {
            if item.quantity == 0 {
                return Err(Error::Validation(format!(
                    "Quantity must be positive for product {}",
                    item.product_id
                )));
            }
            if item.unit_price.is_negative() {
                return Err(Error::Validation(format!(
                    "Unit price must not be negative for product {}",
                    item.product_id
                )));
            }
            line_amounts.push(item.line_amount()?);
            *per_product.entry(item.product_id).or_default() += u64::from(item.quantity);
        }

        for item in items {
            let requested = per_product[&item.product_id];
            let available = self
                .inventory
                .available(tx, item.product_id)?
                .ok_or_else(|| Error::not_found("product", item.product_id))?;
            if available < requested {
                return Err(Error::InsufficientStock {
                    product_id: item.product_id,
                    requested,
                    available,
                });
            }
        }

        let total = line_amounts
            .iter()
            .try_fold(Amount::ZERO, |sum, line| sum.checked_add(*line))
            .ok_or_else(|| Error::Validation("Purchase total overflow".to_string()))?;
        if total > credit.remaining {
            return Err(Error::InsufficientBalance {
                requested: total,
                remaining: credit.remaining,
            });
        }

        let mut records = Vec::with_capacity(items.len());
        for (item, line_amount) in items.iter().zip(line_amounts) {
            let record = ConsumptionRecord {
                consumption_id: Uuid::now_v7(),
                credit_id,
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_amount,
                consumed_at: now,
            };
            tx.put(Table::Consumptions, keys::id(&record.consumption_id), &record)?;
            tx.put(
                Table::Indices,
                keys::consumption_by_credit(&credit_id, &record.consumption_id),
                &(),
            )?;
            records.push(record);
        }
        for (product_id, quantity) in &per_product {
            self.inventory.decrement(tx, *product_id, *quantity)?;
        }

        credit.apply_debit(total)?;
        credit.check_balance()?;
        tx.put(Table::Credits, keys::id(&credit_id), &credit)?;

        if credit.status == CreditStatus::Exhausted {
            issuance::deactivate(tx, &credit);
            tx.emit(EngineEvent::CreditExhausted {
                credit_id,
                beneficiary: credit.beneficiary,
                at: now,
            });
            tracing::info!(%credit_id, beneficiary = %credit.beneficiary, "Credit exhausted");
        }

        tracing::info!(
            %credit_id,
            lines = records.len(),
            total = %total,
            remaining = %credit.remaining,
            "Credit consumed"
        );

        Ok(Purchase {
            credit,
            records,
            total,
        })
    }

    /// Undo one consumption record: refund the credit and restock the product
    pub fn reverse_consumption(
        &self,
        tx: &mut Transaction<'_>,
        consumption_id: Uuid,
    ) -> Result<Reversal> {
        let record = consumption(tx, consumption_id)?;
        if let Some(previous) = reversal(tx, consumption_id)? {
            return Err(Error::Conflict(format!(
                "Consumption {} was already reversed at {}",
                consumption_id, previous.reversed_at
            )));
        }

        let mut credit = credit(tx, record.credit_id)?;
        let was_exhausted = credit.status == CreditStatus::Exhausted;
        credit.apply_refund(record.line_amount)?;
        credit.check_balance()?;
        if was_exhausted && credit.status == CreditStatus::Active {
            issuance::reactivate(tx, &credit)?;
        }

        self.inventory
            .increment(tx, record.product_id, u64::from(record.quantity))?;

        let now = tx.now();
        let reversal = ConsumptionReversal {
            consumption_id,
            credit_id: credit.credit_id,
            amount: record.line_amount,
            reversed_at: now,
        };
        tx.put(Table::Reversals, keys::id(&consumption_id), &reversal)?;
        tx.put(Table::Credits, keys::id(&credit.credit_id), &credit)?;
        tx.emit(EngineEvent::ConsumptionReversed {
            consumption_id,
            credit_id: credit.credit_id,
            amount: record.line_amount,
            at: now,
        });

        tracing::info!(
            %consumption_id,
            credit_id = %credit.credit_id,
            amount = %record.line_amount,
            status = %credit.status,
            "Consumption reversed"
        );

        Ok(Reversal { reversal, credit })
    }
}

/// Load a consumption record
pub fn consumption(view: &impl ReadView, consumption_id: Uuid) -> Result<ConsumptionRecord> {
    view.get(Table::Consumptions, &keys::id(&consumption_id))?
        .ok_or_else(|| Error::not_found("consumption", consumption_id))
}

/// Reversal of a record, if any
pub fn reversal(view: &impl ReadView, consumption_id: Uuid) -> Result<Option<ConsumptionReversal>> {
    view.get(Table::Reversals, &keys::id(&consumption_id))
}

/// Records debited against a credit
pub fn consumptions_of(view: &impl ReadView, credit_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
    view.scan::<()>(Table::Indices, &keys::consumptions_of(&credit_id))?
        .iter()
        .map(|(key, _)| consumption(view, keys::trailing_id(key)?))
        .collect()
}

/// Stock row of a product
pub fn stock(view: &impl ReadView, product_id: Uuid) -> Result<StockItem> {
    view.get(Table::Stock, &keys::id(&product_id))?
        .ok_or_else(|| Error::not_found("product", product_id))
}
