//! Append-only points ledger with a materialized balance per student.

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    Page, PointsTransaction, SourceKey, SourceKind, StudentPointsAccount, TransactionInput,
};
use crate::store::{run, LockScope, Store, StoreTx};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    Created(PointsTransaction),
    /// The earning was already recorded; nothing was written.
    Existing(PointsTransaction),
}

impl Appended {
    pub fn transaction(&self) -> &PointsTransaction {
        match self {
            Appended::Created(t) | Appended::Existing(t) => t,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Appended::Created(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub student_id: String,
    pub name: String,
    pub total_points: i64,
    pub earned_today: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsSummary {
    pub student_count: usize,
    pub total_points: i64,
    pub earned_today: i64,
    pub average_points: i64,
    pub active_today: usize,
    pub top: Vec<LeaderboardRow>,
}

pub struct Ledger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn append_transaction(&self, input: TransactionInput) -> LedgerResult<Appended> {
        let scope = LockScope::default().student(&input.student_id);
        let now = self.clock.now();
        match run(&*self.store, &scope, |tx| append(tx, &input, now)) {
            Ok(t) => Ok(Appended::Created(t)),
            Err(LedgerError::DuplicateSourceEvent { existing }) => Ok(Appended::Existing(*existing)),
            Err(e) => Err(e),
        }
    }

    pub fn balance(&self, student_id: &str) -> LedgerResult<i64> {
        Ok(self.account(student_id)?.total_points)
    }

    pub fn account(&self, student_id: &str) -> LedgerResult<StudentPointsAccount> {
        let today = self.clock.today();
        run(&*self.store, &LockScope::read_only(), |tx| {
            require_student(tx, student_id)?;
            Ok(tx.account(student_id)?.as_of(today))
        })
    }

    pub fn history(&self, student_id: &str, page: Page) -> LedgerResult<Vec<PointsTransaction>> {
        run(&*self.store, &LockScope::read_only(), |tx| {
            require_student(tx, student_id)?;
            tx.history(student_id, page)
        })
    }

    /// Compensates the active earning recorded for a source event so that
    /// the same event may be awarded again.
    pub fn reverse(
        &self,
        student_id: &str,
        kind: SourceKind,
        event_id: &str,
        reason: &str,
    ) -> LedgerResult<PointsTransaction> {
        let scope = LockScope::default().student(student_id);
        let now = self.clock.now();
        let key = SourceKey {
            student_id: student_id.to_string(),
            kind,
            event_id: event_id.to_string(),
        };
        run(&*self.store, &scope, |tx| {
            require_student(tx, student_id)?;
            let original = active_earning(tx, &key)?
                .ok_or_else(|| LedgerError::not_found("earning", event_id))?;
            let description = if reason.trim().is_empty() {
                format!("Reversal of {}", original.description)
            } else {
                format!("Reversal of {}: {}", original.description, reason.trim())
            };
            let input = TransactionInput {
                student_id: student_id.to_string(),
                source_kind: kind,
                source_event_id: event_id.to_string(),
                amount: -original.amount,
                description,
                reverses: Some(original.id.clone()),
            };
            let reversal = append(tx, &input, now)?;
            tracing::info!(
                student_id,
                source_kind = kind.as_str(),
                event_id,
                amount = reversal.amount,
                "earning reversed"
            );
            Ok(reversal)
        })
    }

    pub fn summary(&self, group_id: Option<&str>, top: usize) -> LedgerResult<PointsSummary> {
        let today = self.clock.today();
        run(&*self.store, &LockScope::read_only(), |tx| {
            let students = tx.list_students(group_id)?;
            let mut rows = Vec::with_capacity(students.len());
            for s in students {
                let acct = tx.account(&s.id)?.as_of(today);
                rows.push(LeaderboardRow {
                    student_id: s.id,
                    name: s.name,
                    total_points: acct.total_points,
                    earned_today: acct.earned_today,
                });
            }

            let student_count = rows.len();
            let total_points: i64 = rows.iter().map(|r| r.total_points).sum();
            let earned_today: i64 = rows.iter().map(|r| r.earned_today).sum();
            let active_today = rows.iter().filter(|r| r.earned_today > 0).count();
            let average_points = if student_count == 0 {
                0
            } else {
                (total_points as f64 / student_count as f64).round() as i64
            };

            rows.sort_by(|a, b| {
                b.total_points
                    .cmp(&a.total_points)
                    .then_with(|| a.name.cmp(&b.name))
            });
            rows.truncate(top);

            Ok(PointsSummary {
                student_count,
                total_points,
                earned_today,
                average_points,
                active_today,
                top: rows,
            })
        })
    }
}

pub(crate) fn require_student(tx: &mut dyn StoreTx, student_id: &str) -> LedgerResult<()> {
    match tx.student(student_id)? {
        Some(_) => Ok(()),
        None => Err(LedgerError::not_found("student", student_id)),
    }
}

/// The earning for `key` that has not been compensated, if any.
pub(crate) fn active_earning(
    tx: &mut dyn StoreTx,
    key: &SourceKey,
) -> LedgerResult<Option<PointsTransaction>> {
    let Some(latest) = tx.latest_earning(key)? else {
        return Ok(None);
    };
    if tx.reversal_of(&latest.id)?.is_some() {
        return Ok(None);
    }
    Ok(Some(latest))
}

/// Appends one transaction inside the caller's unit of work, keeping the
/// materialized account in step with the history.
pub(crate) fn append(
    tx: &mut dyn StoreTx,
    input: &TransactionInput,
    now: DateTime<Utc>,
) -> LedgerResult<PointsTransaction> {
    if input.amount == 0 {
        return Err(LedgerError::InvalidInput("amount must not be zero".into()));
    }
    if input.source_event_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput(
            "sourceEventId must not be empty".into(),
        ));
    }
    if input.source_kind == SourceKind::Redemption && input.amount > 0 {
        return Err(LedgerError::InvalidInput(
            "redemptions must debit points".into(),
        ));
    }
    require_student(tx, &input.student_id)?;

    if input.is_earning() {
        if let Some(existing) = active_earning(tx, &input.source_key())? {
            return Err(LedgerError::DuplicateSourceEvent {
                existing: Box::new(existing),
            });
        }
    }

    let mut account = tx.account(&input.student_id)?;
    let next_total = account
        .total_points
        .checked_add(input.amount)
        .ok_or_else(|| LedgerError::InvalidInput("amount overflows balance".into()))?;
    if next_total < 0 {
        return Err(LedgerError::InsufficientBalance {
            balance: account.total_points,
            required: -input.amount,
        });
    }

    let mut record = PointsTransaction {
        id: Uuid::new_v4().to_string(),
        seq: 0,
        student_id: input.student_id.clone(),
        source_kind: input.source_kind,
        source_event_id: input.source_event_id.clone(),
        amount: input.amount,
        description: input.description.clone(),
        created_at: now,
        reverses: input.reverses.clone(),
    };
    record.seq = tx.insert_transaction(&record)?;
    account.apply(input.amount, now.date_naive());
    tx.put_account(&account)?;
    Ok(record)
}
