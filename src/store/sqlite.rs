use super::{LockKey, LockScope, Store, StoreTx, Work};
use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    Page, PointsTransaction, Purchase, PurchaseStatus, ShopCategory, ShopItem, SourceKey,
    SourceKind, Stock, Student, StudentPointsAccount,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const TX_COLS: &str =
    "seq, id, student_id, source_kind, source_event_id, amount, description, created_at, reverses";
const ITEM_COLS: &str = "id, name, description, cost, category, stock, popularity";
const PURCHASE_COLS: &str =
    "id, student_id, item_id, item_name, cost, transaction_id, status, created_at, updated_at";

/// Store over a workspace SQLite file. Writers serialize through
/// `BEGIN IMMEDIATE`; waiting longer than the busy timeout yields `Busy`.
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> LedgerResult<Self> {
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout,
            idle: Mutex::new(Vec::new()),
        };
        let conn = store.connect()?;
        store.checkin(conn);
        Ok(store)
    }

    fn connect(&self) -> LedgerResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(conn)
    }

    fn checkout(&self) -> LedgerResult<Connection> {
        let pooled = self
            .idle
            .lock()
            .map_err(|_| LedgerError::Storage("connection pool poisoned".into()))?
            .pop();
        match pooled {
            Some(c) => Ok(c),
            None => self.connect(),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    fn run_in(conn: &mut Connection, scope: &LockScope, work: &mut Work<'_>) -> LedgerResult<()> {
        let behavior = if scope.is_read_only() {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        let tx = conn.transaction_with_behavior(behavior)?;
        {
            let mut stx = SqliteTx { conn: &tx, scope };
            work(&mut stx)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn unit_of_work(&self, scope: &LockScope, work: &mut Work<'_>) -> LedgerResult<()> {
        let mut conn = self.checkout()?;
        let result = Self::run_in(&mut conn, scope, work);
        self.checkin(conn);
        result
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
    scope: &'a LockScope,
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        group_id: r.get(4)?,
        created_at: r.get(5)?,
    })
}

fn tx_from_row(r: &Row<'_>) -> rusqlite::Result<PointsTransaction> {
    let kind: String = r.get(3)?;
    Ok(PointsTransaction {
        seq: r.get(0)?,
        id: r.get(1)?,
        student_id: r.get(2)?,
        source_kind: SourceKind::parse(&kind)
            .ok_or_else(|| bad_column(3, format!("unknown source kind {}", kind)))?,
        source_event_id: r.get(4)?,
        amount: r.get(5)?,
        description: r.get(6)?,
        created_at: r.get(7)?,
        reverses: r.get(8)?,
    })
}

fn item_from_row(r: &Row<'_>) -> rusqlite::Result<ShopItem> {
    let category: String = r.get(4)?;
    let stock: Option<i64> = r.get(5)?;
    let stock = match stock {
        None => Stock::Unlimited,
        Some(n) => Stock::Limited(
            u32::try_from(n).map_err(|_| bad_column(5, format!("stock out of range: {}", n)))?,
        ),
    };
    let popularity: i64 = r.get(6)?;
    Ok(ShopItem {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        cost: r.get(3)?,
        category: ShopCategory::parse(&category)
            .ok_or_else(|| bad_column(4, format!("unknown category {}", category)))?,
        stock,
        popularity: u8::try_from(popularity)
            .map_err(|_| bad_column(6, format!("popularity out of range: {}", popularity)))?,
    })
}

fn purchase_from_row(r: &Row<'_>) -> rusqlite::Result<Purchase> {
    let status: String = r.get(6)?;
    Ok(Purchase {
        id: r.get(0)?,
        student_id: r.get(1)?,
        item_id: r.get(2)?,
        item_name: r.get(3)?,
        cost: r.get(4)?,
        transaction_id: r.get(5)?,
        status: PurchaseStatus::parse(&status)
            .ok_or_else(|| bad_column(6, format!("unknown purchase status {}", status)))?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

impl StoreTx for SqliteTx<'_> {
    fn student(&mut self, id: &str) -> LedgerResult<Option<Student>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, email, phone, group_id, created_at FROM students WHERE id = ?",
                [id],
                student_from_row,
            )
            .optional()?)
    }

    fn list_students(&mut self, group_id: Option<&str>) -> LedgerResult<Vec<Student>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, email, phone, group_id, created_at
             FROM students
             WHERE ?1 IS NULL OR group_id = ?1
             ORDER BY name, id",
        )?;
        let rows = stmt
            .query_map([group_id], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_student(&mut self, student: &Student) -> LedgerResult<()> {
        self.scope.require(LockKey::Student(student.id.clone()))?;
        if self.student(&student.id)?.is_some() {
            return Err(LedgerError::InvalidInput(format!(
                "student {} already exists",
                student.id
            )));
        }
        self.conn.execute(
            "INSERT INTO students(id, name, email, phone, group_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &student.id,
                &student.name,
                &student.email,
                &student.phone,
                &student.group_id,
                &student.created_at,
            ),
        )?;
        Ok(())
    }

    fn account(&mut self, student_id: &str) -> LedgerResult<StudentPointsAccount> {
        let row = self
            .conn
            .query_row(
                "SELECT total_points, earned_today, earned_day FROM student_points WHERE student_id = ?",
                [student_id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, Option<NaiveDate>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(match row {
            Some((total_points, earned_today, earned_day)) => StudentPointsAccount {
                student_id: student_id.to_string(),
                total_points,
                earned_today,
                earned_day,
            },
            None => StudentPointsAccount::empty(student_id),
        })
    }

    fn put_account(&mut self, account: &StudentPointsAccount) -> LedgerResult<()> {
        self.scope
            .require(LockKey::Student(account.student_id.clone()))?;
        self.conn.execute(
            "INSERT INTO student_points(student_id, total_points, earned_today, earned_day)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(student_id) DO UPDATE SET
               total_points = excluded.total_points,
               earned_today = excluded.earned_today,
               earned_day = excluded.earned_day",
            (
                &account.student_id,
                account.total_points,
                account.earned_today,
                account.earned_day,
            ),
        )?;
        Ok(())
    }

    fn insert_transaction(&mut self, tx: &PointsTransaction) -> LedgerResult<i64> {
        self.scope.require(LockKey::Student(tx.student_id.clone()))?;
        self.conn.execute(
            "INSERT INTO points_transactions(
               id, student_id, source_kind, source_event_id, amount, description, created_at, reverses
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &tx.id,
                &tx.student_id,
                tx.source_kind.as_str(),
                &tx.source_event_id,
                tx.amount,
                &tx.description,
                &tx.created_at,
                &tx.reverses,
            ),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn latest_earning(&mut self, key: &SourceKey) -> LedgerResult<Option<PointsTransaction>> {
        let sql = format!(
            "SELECT {} FROM points_transactions
             WHERE student_id = ? AND source_kind = ? AND source_event_id = ?
               AND amount > 0 AND reverses IS NULL
             ORDER BY seq DESC
             LIMIT 1",
            TX_COLS
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                (&key.student_id, key.kind.as_str(), &key.event_id),
                tx_from_row,
            )
            .optional()?)
    }

    fn reversal_of(&mut self, transaction_id: &str) -> LedgerResult<Option<PointsTransaction>> {
        let sql = format!(
            "SELECT {} FROM points_transactions WHERE reverses = ? LIMIT 1",
            TX_COLS
        );
        Ok(self
            .conn
            .query_row(&sql, [transaction_id], tx_from_row)
            .optional()?)
    }

    fn history(&mut self, student_id: &str, page: Page) -> LedgerResult<Vec<PointsTransaction>> {
        let sql = format!(
            "SELECT {} FROM points_transactions
             WHERE student_id = ?
             ORDER BY seq DESC
             LIMIT ? OFFSET ?",
            TX_COLS
        );
        // SQLite reads a negative OFFSET as 0.
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
        let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                (student_id, limit, offset),
                tx_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn item(&mut self, id: &str) -> LedgerResult<Option<ShopItem>> {
        let sql = format!("SELECT {} FROM shop_items WHERE id = ?", ITEM_COLS);
        Ok(self.conn.query_row(&sql, [id], item_from_row).optional()?)
    }

    fn list_items(&mut self) -> LedgerResult<Vec<ShopItem>> {
        let sql = format!("SELECT {} FROM shop_items ORDER BY category, name", ITEM_COLS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn put_item(&mut self, item: &ShopItem) -> LedgerResult<()> {
        self.scope.require(LockKey::Item(item.id.clone()))?;
        self.conn.execute(
            "INSERT INTO shop_items(id, name, description, cost, category, stock, popularity)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               description = excluded.description,
               cost = excluded.cost,
               category = excluded.category,
               stock = excluded.stock,
               popularity = excluded.popularity",
            (
                &item.id,
                &item.name,
                &item.description,
                item.cost,
                item.category.as_str(),
                item.stock.to_column(),
                i64::from(item.popularity),
            ),
        )?;
        Ok(())
    }

    fn insert_purchase(&mut self, purchase: &Purchase) -> LedgerResult<()> {
        self.scope
            .require(LockKey::Student(purchase.student_id.clone()))?;
        self.conn.execute(
            "INSERT INTO purchases(
               id, student_id, item_id, item_name, cost, transaction_id, status, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &purchase.id,
                &purchase.student_id,
                &purchase.item_id,
                &purchase.item_name,
                purchase.cost,
                &purchase.transaction_id,
                purchase.status.as_str(),
                &purchase.created_at,
                &purchase.updated_at,
            ),
        )?;
        Ok(())
    }

    fn purchase(&mut self, id: &str) -> LedgerResult<Option<Purchase>> {
        let sql = format!("SELECT {} FROM purchases WHERE id = ?", PURCHASE_COLS);
        Ok(self
            .conn
            .query_row(&sql, [id], purchase_from_row)
            .optional()?)
    }

    fn purchases_for(&mut self, student_id: &str) -> LedgerResult<Vec<Purchase>> {
        let sql = format!(
            "SELECT {} FROM purchases WHERE student_id = ? ORDER BY created_at DESC, rowid DESC",
            PURCHASE_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([student_id], purchase_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn set_purchase_status(
        &mut self,
        id: &str,
        status: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.scope.require(LockKey::Purchase(id.to_string()))?;
        let changed = self.conn.execute(
            "UPDATE purchases SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), &at, id),
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("purchase", id));
        }
        Ok(())
    }
}
