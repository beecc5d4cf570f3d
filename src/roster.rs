use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::model::Student;
use crate::store::{run, LockScope, Store};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    pub id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub group_id: Option<String>,
}

/// Students known to the ledger. Accounts start at zero and are created
/// lazily by the first transaction.
pub struct Roster {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Roster {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create(&self, new: NewStudent) -> LedgerResult<Student> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(LedgerError::InvalidInput("name must not be empty".into()));
        }
        let id = match new.id.as_deref().map(str::trim) {
            Some("") => return Err(LedgerError::InvalidInput("id must not be empty".into())),
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let student = Student {
            id,
            name: name.to_string(),
            email: non_blank(new.email),
            phone: non_blank(new.phone),
            group_id: non_blank(new.group_id),
            created_at: self.clock.now(),
        };
        let scope = LockScope::default().student(&student.id);
        run(&*self.store, &scope, |tx| tx.insert_student(&student))?;
        tracing::info!(student_id = %student.id, "student created");
        Ok(student)
    }

    pub fn get(&self, id: &str) -> LedgerResult<Student> {
        run(&*self.store, &LockScope::read_only(), |tx| tx.student(id))?
            .ok_or_else(|| LedgerError::not_found("student", id))
    }

    /// Sorted by name.
    pub fn list(&self, group_id: Option<&str>) -> LedgerResult<Vec<Student>> {
        run(&*self.store, &LockScope::read_only(), |tx| {
            tx.list_students(group_id)
        })
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
