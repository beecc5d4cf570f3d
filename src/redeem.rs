//! Spending points in the shop.
//!
//! A purchase debits the ledger, takes one unit of stock and records a
//! [`Purchase`] in a single unit of work scoped to the student and the
//! item. Two attempts for the same student, or for the same item, are
//! therefore serialized, and a rejected attempt writes nothing.

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger;
use crate::model::{Purchase, PurchaseStatus, SourceKind, TransactionInput};
use crate::store::{run, LockScope, Store};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    InsufficientBalance,
    OutOfStock,
}

impl RejectReason {
    fn of(e: &LedgerError) -> Option<Self> {
        match e {
            LedgerError::NotFound { .. } => Some(Self::NotFound),
            LedgerError::InsufficientBalance { .. } => Some(Self::InsufficientBalance),
            LedgerError::OutOfStock { .. } => Some(Self::OutOfStock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionState {
    Initiated,
    ValidatingFunds,
    ValidatingStock,
    Committing,
    Completed,
    Rejected(RejectReason),
}

impl RedemptionState {
    pub fn can_advance_to(self, next: RedemptionState) -> bool {
        use RedemptionState::*;
        match (self, next) {
            (Initiated, ValidatingFunds)
            | (ValidatingFunds, ValidatingStock)
            | (ValidatingStock, Committing)
            | (Committing, Completed) => true,
            (ValidatingFunds | ValidatingStock | Committing, Rejected(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RedemptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedemptionState::Rejected(r) => write!(f, "Rejected({:?})", r),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Tracks one purchase attempt through the redemption state machine.
struct Attempt<'a> {
    student_id: &'a str,
    item_id: &'a str,
    state: RedemptionState,
}

impl<'a> Attempt<'a> {
    fn new(student_id: &'a str, item_id: &'a str) -> Self {
        Self {
            student_id,
            item_id,
            state: RedemptionState::Initiated,
        }
    }

    fn advance(&mut self, next: RedemptionState) -> LedgerResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(
            student_id = self.student_id,
            item_id = self.item_id,
            from = %self.state,
            to = %next,
            "redemption state"
        );
        self.state = next;
        Ok(())
    }

    /// Moves to `Rejected` for validation failures and hands the error back.
    fn reject(&mut self, e: LedgerError) -> LedgerError {
        if let Some(reason) = RejectReason::of(&e) {
            if self.advance(RedemptionState::Rejected(reason)).is_ok() {
                tracing::info!(
                    student_id = self.student_id,
                    item_id = self.item_id,
                    reason = ?reason,
                    "purchase rejected"
                );
            }
        }
        e
    }
}

/// A committed purchase and the balance left after its debit.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub purchase: Purchase,
    pub balance: i64,
}

pub struct RedemptionEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RedemptionEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn purchase(&self, student_id: &str, item_id: &str) -> LedgerResult<Receipt> {
        let scope = LockScope::default().student(student_id).item(item_id);
        let now = self.clock.now();
        run(&*self.store, &scope, |tx| {
            let mut attempt = Attempt::new(student_id, item_id);

            attempt.advance(RedemptionState::ValidatingFunds)?;
            ledger::require_student(tx, student_id).map_err(|e| attempt.reject(e))?;
            let item = tx
                .item(item_id)?
                .ok_or_else(|| attempt.reject(LedgerError::not_found("item", item_id)))?;
            let balance = tx.account(student_id)?.total_points;
            if balance < item.cost {
                return Err(attempt.reject(LedgerError::InsufficientBalance {
                    balance,
                    required: item.cost,
                }));
            }

            attempt.advance(RedemptionState::ValidatingStock)?;
            let reservation =
                Catalog::reserve_stock(tx, item_id).map_err(|e| attempt.reject(e))?;

            attempt.advance(RedemptionState::Committing)?;
            let purchase_id = Uuid::new_v4().to_string();
            let debit = TransactionInput::new(
                student_id,
                SourceKind::Redemption,
                purchase_id.clone(),
                -item.cost,
                format!("Purchased {}", item.name),
            );
            let debit = match ledger::append(tx, &debit, now) {
                Ok(t) => t,
                Err(e) => {
                    Catalog::release_reservation(tx, reservation)?;
                    return Err(attempt.reject(e));
                }
            };
            let purchase = Purchase {
                id: purchase_id,
                student_id: student_id.to_string(),
                item_id: item.id.clone(),
                item_name: item.name.clone(),
                cost: item.cost,
                transaction_id: debit.id,
                status: PurchaseStatus::Completed,
                created_at: now,
                updated_at: now,
            };
            tx.insert_purchase(&purchase)?;
            Catalog::commit_reservation(reservation);

            attempt.advance(RedemptionState::Completed)?;
            tracing::info!(
                student_id,
                item_id,
                purchase_id = %purchase.id,
                cost = purchase.cost,
                "purchase completed"
            );
            Ok(Receipt {
                purchase,
                balance: balance - item.cost,
            })
        })
    }

    pub fn purchases_for(&self, student_id: &str) -> LedgerResult<Vec<Purchase>> {
        run(&*self.store, &LockScope::read_only(), |tx| {
            ledger::require_student(tx, student_id)?;
            tx.purchases_for(student_id)
        })
    }

    /// Moves a purchase along its fulfilment lifecycle.
    pub fn advance_status(&self, purchase_id: &str, next: PurchaseStatus) -> LedgerResult<Purchase> {
        let scope = LockScope::default().purchase(purchase_id);
        let now = self.clock.now();
        run(&*self.store, &scope, |tx| {
            let mut purchase = tx
                .purchase(purchase_id)?
                .ok_or_else(|| LedgerError::not_found("purchase", purchase_id))?;
            if !purchase.status.can_advance_to(next) {
                return Err(LedgerError::InvalidTransition {
                    from: purchase.status.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            tx.set_purchase_status(purchase_id, next, now)?;
            purchase.status = next;
            purchase.updated_at = now;
            Ok(purchase)
        })
    }
}
