use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join("points.sqlite3")
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // WAL lets readers keep a snapshot while a purchase holds the write lock.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            group_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS points_transactions(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            student_id TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            source_event_id TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK(amount <> 0),
            description TEXT NOT NULL,
            created_at TEXT NOT NULL,
            reverses TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(reverses) REFERENCES points_transactions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_points_tx_student_seq ON points_transactions(student_id, seq)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_points_tx_source
         ON points_transactions(student_id, source_kind, source_event_id)",
        [],
    )?;
    // A transaction can be compensated at most once.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_points_tx_reverses
         ON points_transactions(reverses) WHERE reverses IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_points(
            student_id TEXT PRIMARY KEY,
            total_points INTEGER NOT NULL CHECK(total_points >= 0),
            earned_today INTEGER NOT NULL DEFAULT 0,
            earned_day TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS shop_items(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            cost INTEGER NOT NULL CHECK(cost > 0),
            category TEXT NOT NULL,
            stock INTEGER CHECK(stock IS NULL OR stock >= 0),
            popularity INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_shop_items_category ON shop_items(category)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchases(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_name TEXT NOT NULL,
            cost INTEGER NOT NULL,
            transaction_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(item_id) REFERENCES shop_items(id),
            FOREIGN KEY(transaction_id) REFERENCES points_transactions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_purchases_student ON purchases(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    ensure_shop_items_popularity(&conn)?;

    Ok(conn)
}

fn ensure_shop_items_popularity(conn: &Connection) -> anyhow::Result<()> {
    // Early catalogs were created before popularity was tracked.
    if table_has_column(conn, "shop_items", "popularity")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE shop_items ADD COLUMN popularity INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
