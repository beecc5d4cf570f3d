use super::{LockKey, LockScope, Store, StoreTx, Work};
use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    Page, PointsTransaction, Purchase, PurchaseStatus, ShopItem, SourceKey, Student,
    StudentPointsAccount,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn poisoned() -> LedgerError {
    LedgerError::Storage("memory store lock poisoned".into())
}

/// Process-local store backed by plain collections.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    locks: KeyedLocks,
    next_seq: AtomicI64,
    lock_timeout: Duration,
}

#[derive(Default)]
struct MemoryState {
    students: BTreeMap<String, Student>,
    accounts: HashMap<String, StudentPointsAccount>,
    transactions: Vec<PointsTransaction>,
    items: Vec<ShopItem>,
    purchases: Vec<Purchase>,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            locks: KeyedLocks::default(),
            next_seq: AtomicI64::new(0),
            lock_timeout,
        }
    }
}

impl Store for MemoryStore {
    fn unit_of_work(&self, scope: &LockScope, work: &mut Work<'_>) -> LedgerResult<()> {
        if scope.is_read_only() {
            let guard = self.state.lock().map_err(|_| poisoned())?;
            let mut tx = MemoryTx {
                store: self,
                scope,
                held: Some(guard),
                pending: Pending::default(),
            };
            return work(&mut tx);
        }

        let _keys = self.locks.acquire(&scope.keys, self.lock_timeout)?;
        let mut tx = MemoryTx {
            store: self,
            scope,
            held: None,
            pending: Pending::default(),
        };
        work(&mut tx)?;
        let pending = tx.pending;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        pending.apply(&mut state);
        Ok(())
    }
}

/// Named locks taken all-or-nothing, so two units with overlapping scopes
/// can never deadlock on each other.
#[derive(Default)]
struct KeyedLocks {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    keys: Vec<LockKey>,
}

impl KeyedLocks {
    fn acquire(&self, keys: &BTreeSet<LockKey>, timeout: Duration) -> LedgerResult<KeyGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        while keys.iter().any(|k| held.contains(k)) {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(?keys, "lock wait timed out");
                return Err(LedgerError::Busy);
            }
            let (next, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| poisoned())?;
            held = next;
        }
        held.extend(keys.iter().cloned());
        Ok(KeyGuard {
            locks: self,
            keys: keys.iter().cloned().collect(),
        })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            for k in &self.keys {
                held.remove(k);
            }
        }
        self.locks.released.notify_all();
    }
}

#[derive(Default)]
struct Pending {
    students: Vec<Student>,
    accounts: HashMap<String, StudentPointsAccount>,
    transactions: Vec<PointsTransaction>,
    items: Vec<ShopItem>,
    purchases: Vec<Purchase>,
    statuses: HashMap<String, (PurchaseStatus, DateTime<Utc>)>,
}

impl Pending {
    fn apply(self, state: &mut MemoryState) {
        for s in self.students {
            state.students.insert(s.id.clone(), s);
        }
        state.accounts.extend(self.accounts);
        state.transactions.extend(self.transactions);
        for item in self.items {
            match state.items.iter_mut().find(|i| i.id == item.id) {
                Some(slot) => *slot = item,
                None => state.items.push(item),
            }
        }
        state.purchases.extend(self.purchases);
        for p in state.purchases.iter_mut() {
            if let Some((status, at)) = self.statuses.get(&p.id) {
                p.status = *status;
                p.updated_at = *at;
            }
        }
    }

    fn restate(&self, mut p: Purchase) -> Purchase {
        if let Some((status, at)) = self.statuses.get(&p.id) {
            p.status = *status;
            p.updated_at = *at;
        }
        p
    }
}

struct MemoryTx<'a> {
    store: &'a MemoryStore,
    scope: &'a LockScope,
    held: Option<MutexGuard<'a, MemoryState>>,
    pending: Pending,
}

impl MemoryTx<'_> {
    fn with_state<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> LedgerResult<R> {
        if let Some(state) = &self.held {
            return Ok(f(state));
        }
        let state = self.store.state.lock().map_err(|_| poisoned())?;
        Ok(f(&state))
    }

    fn all_transactions_for(&self, student_id: &str) -> LedgerResult<Vec<PointsTransaction>> {
        let mut out = self.with_state(|s| {
            s.transactions
                .iter()
                .filter(|t| t.student_id == student_id)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        out.extend(
            self.pending
                .transactions
                .iter()
                .filter(|t| t.student_id == student_id)
                .cloned(),
        );
        Ok(out)
    }

    fn all_purchases(&self) -> LedgerResult<Vec<Purchase>> {
        let mut out = self.with_state(|s| s.purchases.clone())?;
        out.extend(self.pending.purchases.iter().cloned());
        Ok(out
            .into_iter()
            .map(|p| self.pending.restate(p))
            .collect())
    }
}

impl StoreTx for MemoryTx<'_> {
    fn student(&mut self, id: &str) -> LedgerResult<Option<Student>> {
        if let Some(s) = self.pending.students.iter().find(|s| s.id == id) {
            return Ok(Some(s.clone()));
        }
        self.with_state(|s| s.students.get(id).cloned())
    }

    fn list_students(&mut self, group_id: Option<&str>) -> LedgerResult<Vec<Student>> {
        let mut out = self.with_state(|s| s.students.values().cloned().collect::<Vec<_>>())?;
        out.extend(self.pending.students.iter().cloned());
        out.retain(|s| group_id.is_none() || s.group_id.as_deref() == group_id);
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn insert_student(&mut self, student: &Student) -> LedgerResult<()> {
        self.scope.require(LockKey::Student(student.id.clone()))?;
        if self.student(&student.id)?.is_some() {
            return Err(LedgerError::InvalidInput(format!(
                "student {} already exists",
                student.id
            )));
        }
        self.pending.students.push(student.clone());
        Ok(())
    }

    fn account(&mut self, student_id: &str) -> LedgerResult<StudentPointsAccount> {
        if let Some(a) = self.pending.accounts.get(student_id) {
            return Ok(a.clone());
        }
        Ok(self
            .with_state(|s| s.accounts.get(student_id).cloned())?
            .unwrap_or_else(|| StudentPointsAccount::empty(student_id)))
    }

    fn put_account(&mut self, account: &StudentPointsAccount) -> LedgerResult<()> {
        self.scope
            .require(LockKey::Student(account.student_id.clone()))?;
        self.pending
            .accounts
            .insert(account.student_id.clone(), account.clone());
        Ok(())
    }

    fn insert_transaction(&mut self, tx: &PointsTransaction) -> LedgerResult<i64> {
        self.scope.require(LockKey::Student(tx.student_id.clone()))?;
        let seq = self.store.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = tx.clone();
        stored.seq = seq;
        self.pending.transactions.push(stored);
        Ok(seq)
    }

    fn latest_earning(&mut self, key: &SourceKey) -> LedgerResult<Option<PointsTransaction>> {
        let all = self.all_transactions_for(&key.student_id)?;
        Ok(all
            .into_iter()
            .filter(|t| {
                t.source_kind == key.kind
                    && t.source_event_id == key.event_id
                    && t.amount > 0
                    && t.reverses.is_none()
            })
            .max_by_key(|t| t.seq))
    }

    fn reversal_of(&mut self, transaction_id: &str) -> LedgerResult<Option<PointsTransaction>> {
        let is_reversal = |t: &&PointsTransaction| t.reverses.as_deref() == Some(transaction_id);
        if let Some(t) = self.pending.transactions.iter().find(is_reversal) {
            return Ok(Some(t.clone()));
        }
        self.with_state(|s| s.transactions.iter().find(is_reversal).cloned())
    }

    fn history(&mut self, student_id: &str, page: Page) -> LedgerResult<Vec<PointsTransaction>> {
        let mut all = self.all_transactions_for(student_id)?;
        all.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(all.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn item(&mut self, id: &str) -> LedgerResult<Option<ShopItem>> {
        if let Some(i) = self.pending.items.iter().find(|i| i.id == id) {
            return Ok(Some(i.clone()));
        }
        self.with_state(|s| s.items.iter().find(|i| i.id == id).cloned())
    }

    fn list_items(&mut self) -> LedgerResult<Vec<ShopItem>> {
        let mut out = self.with_state(|s| s.items.clone())?;
        for staged in &self.pending.items {
            match out.iter_mut().find(|i| i.id == staged.id) {
                Some(slot) => *slot = staged.clone(),
                None => out.push(staged.clone()),
            }
        }
        out.sort_by(|a, b| {
            a.category
                .as_str()
                .cmp(b.category.as_str())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    fn put_item(&mut self, item: &ShopItem) -> LedgerResult<()> {
        self.scope.require(LockKey::Item(item.id.clone()))?;
        match self.pending.items.iter_mut().find(|i| i.id == item.id) {
            Some(slot) => *slot = item.clone(),
            None => self.pending.items.push(item.clone()),
        }
        Ok(())
    }

    fn insert_purchase(&mut self, purchase: &Purchase) -> LedgerResult<()> {
        self.scope
            .require(LockKey::Student(purchase.student_id.clone()))?;
        self.pending.purchases.push(purchase.clone());
        Ok(())
    }

    fn purchase(&mut self, id: &str) -> LedgerResult<Option<Purchase>> {
        Ok(self.all_purchases()?.into_iter().find(|p| p.id == id))
    }

    fn purchases_for(&mut self, student_id: &str) -> LedgerResult<Vec<Purchase>> {
        let mut out: Vec<Purchase> = self
            .all_purchases()?
            .into_iter()
            .filter(|p| p.student_id == student_id)
            .collect();
        out.reverse();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    fn set_purchase_status(
        &mut self,
        id: &str,
        status: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.scope.require(LockKey::Purchase(id.to_string()))?;
        if self.purchase(id)?.is_none() {
            return Err(LedgerError::not_found("purchase", id));
        }
        self.pending.statuses.insert(id.to_string(), (status, at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            name: id.to_uppercase(),
            email: None,
            phone: None,
            group_id: Some("g1".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn failed_unit_of_work_leaves_nothing_behind() {
        let store = MemoryStore::new(Duration::from_millis(100));
        let scope = LockScope::default().student("s1");
        let res: LedgerResult<()> = run(&store, &scope, |tx| {
            tx.insert_student(&student("s1"))?;
            Err(LedgerError::InvalidInput("abort".into()))
        });
        assert!(res.is_err());

        let found = run(&store, &LockScope::read_only(), |tx| tx.student("s1")).expect("read");
        assert!(found.is_none());
    }

    #[test]
    fn read_only_scope_rejects_writes() {
        let store = MemoryStore::new(Duration::from_millis(100));
        let res = run(&store, &LockScope::read_only(), |tx| {
            tx.insert_student(&student("s1"))
        });
        assert!(matches!(res, Err(LedgerError::Storage(_))));
    }

    #[test]
    fn held_student_key_times_out_as_busy() {
        let store = Arc::new(MemoryStore::new(Duration::from_millis(50)));
        let (held_tx, held_rx) = mpsc::channel();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let scope = LockScope::default().student("s1");
                run(&*store, &scope, |_tx| {
                    held_tx.send(()).expect("signal");
                    thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
            })
        };

        held_rx.recv().expect("holder started");
        let scope = LockScope::default().student("s1");
        let res = run(&*store, &scope, |_tx| Ok(()));
        assert!(matches!(res, Err(LedgerError::Busy)));

        // A different student is not blocked by s1's lock.
        let other = LockScope::default().student("s2");
        assert!(run(&*store, &other, |_tx| Ok(())).is_ok());

        holder.join().expect("join").expect("holder ok");
        assert!(run(&*store, &scope, |_tx| Ok(())).is_ok());
    }
}
