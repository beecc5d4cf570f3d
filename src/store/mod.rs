//! Storage seam for the ledger and shop.
//!
//! All reads and writes go through [`Store::unit_of_work`]. The closure
//! receives a [`StoreTx`]; whatever it writes becomes visible all at once
//! when it returns `Ok`, and not at all when it returns `Err`. The
//! [`LockScope`] lists the keys the unit may write, so implementations can
//! serialize conflicting work per student or per item rather than globally.

#[cfg(test)]
mod memory;
mod sqlite;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    Page, PointsTransaction, Purchase, PurchaseStatus, ShopItem, SourceKey, Student,
    StudentPointsAccount,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Student(String),
    Item(String),
    Purchase(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScope {
    keys: BTreeSet<LockKey>,
}

impl LockScope {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn student(mut self, id: &str) -> Self {
        self.keys.insert(LockKey::Student(id.to_string()));
        self
    }

    pub fn item(mut self, id: &str) -> Self {
        self.keys.insert(LockKey::Item(id.to_string()));
        self
    }

    pub fn purchase(mut self, id: &str) -> Self {
        self.keys.insert(LockKey::Purchase(id.to_string()));
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn covers(&self, key: &LockKey) -> bool {
        self.keys.contains(key)
    }

    pub(crate) fn require(&self, key: LockKey) -> LedgerResult<()> {
        if self.covers(&key) {
            Ok(())
        } else {
            Err(LedgerError::Storage(format!(
                "write to {:?} outside of lock scope",
                key
            )))
        }
    }
}

pub type Work<'a> = dyn FnMut(&mut dyn StoreTx) -> LedgerResult<()> + 'a;

pub trait Store: Send + Sync {
    /// Runs `work` atomically within `scope`. Fails with
    /// [`LedgerError::Busy`] if the scope cannot be locked in time; in that
    /// case `work` never runs.
    fn unit_of_work(&self, scope: &LockScope, work: &mut Work<'_>) -> LedgerResult<()>;
}

pub trait StoreTx {
    fn student(&mut self, id: &str) -> LedgerResult<Option<Student>>;
    fn list_students(&mut self, group_id: Option<&str>) -> LedgerResult<Vec<Student>>;
    fn insert_student(&mut self, student: &Student) -> LedgerResult<()>;

    fn account(&mut self, student_id: &str) -> LedgerResult<StudentPointsAccount>;
    fn put_account(&mut self, account: &StudentPointsAccount) -> LedgerResult<()>;

    /// Appends and returns the store-assigned sequence number.
    fn insert_transaction(&mut self, tx: &PointsTransaction) -> LedgerResult<i64>;
    /// Most recent positive, non-compensating transaction for `key`.
    fn latest_earning(&mut self, key: &SourceKey) -> LedgerResult<Option<PointsTransaction>>;
    fn reversal_of(&mut self, transaction_id: &str) -> LedgerResult<Option<PointsTransaction>>;
    fn history(&mut self, student_id: &str, page: Page) -> LedgerResult<Vec<PointsTransaction>>;

    fn item(&mut self, id: &str) -> LedgerResult<Option<ShopItem>>;
    fn list_items(&mut self) -> LedgerResult<Vec<ShopItem>>;
    fn put_item(&mut self, item: &ShopItem) -> LedgerResult<()>;

    fn insert_purchase(&mut self, purchase: &Purchase) -> LedgerResult<()>;
    fn purchase(&mut self, id: &str) -> LedgerResult<Option<Purchase>>;
    fn purchases_for(&mut self, student_id: &str) -> LedgerResult<Vec<Purchase>>;
    fn set_purchase_status(
        &mut self,
        id: &str,
        status: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;
}

pub fn run<T, F>(store: &dyn Store, scope: &LockScope, work: F) -> LedgerResult<T>
where
    F: FnOnce(&mut dyn StoreTx) -> LedgerResult<T>,
{
    let mut work = Some(work);
    let mut out = None;
    store.unit_of_work(scope, &mut |tx| {
        let f = work
            .take()
            .ok_or_else(|| LedgerError::Storage("unit of work re-entered".into()))?;
        out = Some(f(tx)?);
        Ok(())
    })?;
    out.ok_or_else(|| LedgerError::Storage("unit of work produced no result".into()))
}
