//! Turns academic events into earning transactions.
//!
//! Every award carries the source event's id as its idempotency key, so
//! redelivering an event is harmless: the ledger reports the earlier
//! transaction and the engine returns [`AwardOutcome::AlreadyAwarded`].

use crate::clock::Clock;
use crate::config::{AttendanceRules, GradeRules, HomeworkRules};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger;
use crate::model::{PointsTransaction, SourceKind, TransactionInput};
use crate::store::{run, LockScope, Store, StoreTx};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "transaction", rename_all = "snake_case")]
pub enum AwardOutcome {
    Awarded(PointsTransaction),
    AlreadyAwarded(PointsTransaction),
    NotEligible,
}

impl AwardOutcome {
    /// The transaction created by this call, if any.
    pub fn awarded(&self) -> Option<&PointsTransaction> {
        match self {
            AwardOutcome::Awarded(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Submission {
    pub fn on_time(&self) -> bool {
        self.submitted_at <= self.deadline
    }
}

pub fn streak_event_id(student_id: &str, days: u32) -> String {
    format!("{}:streak:{}", student_id, days)
}

pub struct AwardEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    grades: GradeRules,
    homework: HomeworkRules,
    attendance: AttendanceRules,
}

impl AwardEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        grades: GradeRules,
        homework: HomeworkRules,
        attendance: AttendanceRules,
    ) -> Self {
        Self {
            store,
            clock,
            grades,
            homework,
            attendance,
        }
    }

    pub fn with_rules(
        self,
        grades: GradeRules,
        homework: HomeworkRules,
        attendance: AttendanceRules,
    ) -> Self {
        Self {
            grades,
            homework,
            attendance,
            ..self
        }
    }

    pub fn on_grade_posted(
        &self,
        student_id: &str,
        grade_id: &str,
        value: i64,
    ) -> LedgerResult<AwardOutcome> {
        let Some(points) = self.grades.points_for(value) else {
            tracing::debug!(student_id, grade_id, value, "grade below award threshold");
            return Ok(AwardOutcome::NotEligible);
        };
        let input = TransactionInput::new(
            student_id,
            SourceKind::Grade,
            grade_id,
            points,
            format!("Grade {} posted", value),
        );
        self.award(input)
    }

    pub fn on_homework_submitted(
        &self,
        student_id: &str,
        homework_id: &str,
        submission: Submission,
    ) -> LedgerResult<AwardOutcome> {
        let (points, description) = if submission.on_time() {
            (self.homework.on_time_points, "Homework submitted on time")
        } else {
            (self.homework.late_points, "Homework submitted late")
        };
        if points <= 0 {
            tracing::debug!(student_id, homework_id, "late homework earns nothing");
            return Ok(AwardOutcome::NotEligible);
        }
        let input = TransactionInput::new(
            student_id,
            SourceKind::Homework,
            homework_id,
            points,
            description,
        );
        self.award(input)
    }

    /// Awards every milestone the streak has reached, each at most once.
    /// Milestones skipped by missed events are caught up here.
    pub fn on_attendance_streak(
        &self,
        student_id: &str,
        streak_length: u32,
    ) -> LedgerResult<Vec<AwardOutcome>> {
        let inputs: Vec<TransactionInput> = self
            .attendance
            .reached(streak_length)
            .map(|m| {
                TransactionInput::new(
                    student_id,
                    SourceKind::Attendance,
                    streak_event_id(student_id, m.days),
                    m.points,
                    format!("Attendance streak of {} days", m.days),
                )
            })
            .collect();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let scope = LockScope::default().student(student_id);
        let now = self.clock.now();
        run(&*self.store, &scope, |tx| {
            inputs
                .iter()
                .map(|input| award_in(tx, input, now))
                .collect::<LedgerResult<Vec<_>>>()
        })
    }

    fn award(&self, input: TransactionInput) -> LedgerResult<AwardOutcome> {
        let scope = LockScope::default().student(&input.student_id);
        let now = self.clock.now();
        run(&*self.store, &scope, |tx| award_in(tx, &input, now))
    }
}

fn award_in(
    tx: &mut dyn StoreTx,
    input: &TransactionInput,
    now: DateTime<Utc>,
) -> LedgerResult<AwardOutcome> {
    match ledger::append(tx, input, now) {
        Ok(t) => {
            tracing::info!(
                student_id = %t.student_id,
                source_kind = t.source_kind.as_str(),
                event_id = %t.source_event_id,
                amount = t.amount,
                "points awarded"
            );
            Ok(AwardOutcome::Awarded(t))
        }
        Err(LedgerError::DuplicateSourceEvent { existing }) => {
            tracing::debug!(
                student_id = %existing.student_id,
                event_id = %existing.source_event_id,
                "award already recorded"
            );
            Ok(AwardOutcome::AlreadyAwarded(*existing))
        }
        Err(e) => Err(e),
    }
}
