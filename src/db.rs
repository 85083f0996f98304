// 🗄️ Local Registry Store - authoritative SQLite table of registrants
// Every mutating call is one transaction; the full_name UNIQUE constraint backs the duplicate check

use crate::error::{RegistryError, RegistryResult};
use crate::model::{format_timestamp, parse_timestamp, Registrant, Status};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a status mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Updated,
    /// Row already had the requested status; nothing written
    Unchanged,
}

const SELECT_COLUMNS: &str =
    "SELECT full_name, church, area, group_id, status, last_updated FROM registrations";

pub fn setup_database(conn: &Connection) -> RegistryResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT UNIQUE NOT NULL,
            church TEXT NOT NULL,
            area INTEGER NOT NULL,
            group_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Pending',
            last_updated TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_group ON registrations(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_updated ON registrations(last_updated)",
        [],
    )?;

    Ok(())
}

fn row_to_registrant(row: &Row<'_>) -> rusqlite::Result<Registrant> {
    let last_updated: String = row.get(5)?;
    let last_updated = parse_timestamp(&last_updated).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("bad timestamp '{}'", last_updated).into(),
        )
    })?;

    Ok(Registrant {
        full_name: row.get(0)?,
        church: row.get(1)?,
        area: row.get(2)?,
        group_id: row.get(3)?,
        status: row.get(4)?,
        last_updated,
    })
}

/// Stamp for a write committed at `now`. Never at or behind the newest stored row,
/// so the sync cursor moves forward on every write whatever the caller's clock says.
fn next_stamp(conn: &Connection, now: DateTime<Utc>) -> RegistryResult<DateTime<Utc>> {
    let now = now.trunc_subsecs(6);
    Ok(match max_last_updated(conn)? {
        Some(newest) if newest >= now => newest + chrono::Duration::microseconds(1),
        _ => now,
    })
}

fn insert_row(conn: &Connection, row: &Registrant, stamp: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO registrations (full_name, church, area, group_id, status, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.full_name,
            row.church,
            row.area,
            row.group_id,
            row.status,
            format_timestamp(stamp),
        ],
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Exact, case-sensitive membership check
pub fn exists(conn: &Connection, full_name: &str) -> RegistryResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM registrations WHERE full_name = ?1",
            [full_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Insert every row or none, all stamped with one `last_updated` taken from `now`.
///
/// Uniqueness is re-checked inside the same write transaction as the inserts, so two
/// batches racing for one name cannot both pass. The first offending name (already
/// stored, or repeated earlier in `rows`) is reported and the transaction rolls back.
pub fn insert_batch(
    conn: &mut Connection,
    rows: &[Registrant],
    now: DateTime<Utc>,
) -> RegistryResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut seen = HashSet::new();
    for row in rows {
        if !seen.insert(row.full_name.as_str()) || exists(&tx, &row.full_name)? {
            return Err(RegistryError::Duplicate(row.full_name.clone()));
        }
    }

    let stamp = next_stamp(&tx, now)?;
    for row in rows {
        match insert_row(&tx, row, stamp) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(RegistryError::Duplicate(row.full_name.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit()?;
    Ok(())
}

/// Insert rows whose name is not yet stored; existing rows are never touched.
/// Returns how many rows were added.
pub fn insert_if_absent(conn: &mut Connection, rows: &[Registrant]) -> RegistryResult<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut inserted = 0;

    for row in rows {
        inserted += tx.execute(
            "INSERT OR IGNORE INTO registrations (full_name, church, area, group_id, status, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.full_name,
                row.church,
                row.area,
                row.group_id,
                row.status,
                format_timestamp(row.last_updated),
            ],
        )?;
    }

    tx.commit()?;
    Ok(inserted)
}

/// Move a registrant to `status`, advancing `last_updated` only when the row changes.
pub fn set_status(
    conn: &mut Connection,
    full_name: &str,
    status: Status,
    now: DateTime<Utc>,
) -> RegistryResult<StatusChange> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<Status> = tx
        .query_row(
            "SELECT status FROM registrations WHERE full_name = ?1",
            [full_name],
            |row| row.get(0),
        )
        .optional()?;

    let change = match (current, status) {
        (None, _) => return Err(RegistryError::NotFound(full_name.to_string())),
        (Some(current), wanted) if current == wanted => StatusChange::Unchanged,
        (Some(Status::Approved), Status::Pending) => {
            return Err(RegistryError::InvalidTransition(full_name.to_string()));
        }
        (Some(_), wanted) => {
            let stamp = next_stamp(&tx, now)?;
            tx.execute(
                "UPDATE registrations SET status = ?1, last_updated = ?2 WHERE full_name = ?3",
                params![wanted, format_timestamp(stamp), full_name],
            )?;
            StatusChange::Updated
        }
    };

    tx.commit()?;
    Ok(change)
}

pub fn list_by_group(conn: &Connection, group_id: &str) -> RegistryResult<Vec<Registrant>> {
    let mut stmt = conn.prepare(&format!("{} WHERE group_id = ?1 ORDER BY id", SELECT_COLUMNS))?;
    let rows = stmt
        .query_map([group_id], row_to_registrant)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_all(conn: &Connection) -> RegistryResult<Vec<Registrant>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_COLUMNS))?;
    let rows = stmt
        .query_map([], row_to_registrant)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn distinct_churches(conn: &Connection) -> RegistryResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT church FROM registrations ORDER BY church")?;
    let churches = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(churches)
}

pub fn distinct_areas(conn: &Connection) -> RegistryResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT DISTINCT area FROM registrations ORDER BY area")?;
    let areas = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(areas)
}

/// Sync cursor: newest `last_updated` in the table, `None` when empty
pub fn max_last_updated(conn: &Connection) -> RegistryResult<Option<DateTime<Utc>>> {
    let max: Option<String> =
        conn.query_row("SELECT MAX(last_updated) FROM registrations", [], |row| row.get(0))?;
    Ok(max.as_deref().and_then(parse_timestamp))
}

pub fn count(conn: &Connection) -> RegistryResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM registrations", [], |row| row.get(0))?;
    Ok(count)
}

/// Administrative wipe of every row. Idempotent.
pub fn clear_all(conn: &Connection) -> RegistryResult<usize> {
    let removed = conn.execute("DELETE FROM registrations", [])?;
    Ok(removed)
}

/// Entire contents plus the matching cursor, read in one transaction so a
/// concurrent batch is either fully visible or not at all.
pub fn snapshot(conn: &mut Connection) -> RegistryResult<(Vec<Registrant>, Option<DateTime<Utc>>)> {
    let tx = conn.transaction()?;
    let rows = list_all(&tx)?;
    let cursor = max_last_updated(&tx)?;
    tx.commit()?;
    Ok((rows, cursor))
}

// ============================================================================
// REGISTRY STORE (shared handle)
// ============================================================================

/// Shared handle over one SQLite connection.
pub struct RegistryStore {
    conn: Mutex<Connection>,
}

impl RegistryStore {
    /// Open (or create) the database file in WAL mode.
    pub fn open(path: &Path, busy_timeout: Duration) -> RegistryResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        setup_database(&conn)?;
        info!(path = %path.display(), "registry store opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        RegistryStore {
            conn: Mutex::new(conn),
        }
    }

    // A panic while holding the lock cannot leave a half-applied transaction behind.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn exists(&self, full_name: &str) -> RegistryResult<bool> {
        exists(&self.conn(), full_name)
    }

    /// Rows are stamped once the connection is held, not when the caller built them.
    pub fn insert_batch(&self, rows: &[Registrant]) -> RegistryResult<()> {
        let mut conn = self.conn();
        insert_batch(&mut conn, rows, Utc::now())
    }

    pub fn insert_if_absent(&self, rows: &[Registrant]) -> RegistryResult<usize> {
        insert_if_absent(&mut self.conn(), rows)
    }

    pub fn set_status(&self, full_name: &str, status: Status) -> RegistryResult<StatusChange> {
        let mut conn = self.conn();
        set_status(&mut conn, full_name, status, Utc::now())
    }

    pub fn list_by_group(&self, group_id: &str) -> RegistryResult<Vec<Registrant>> {
        list_by_group(&self.conn(), group_id)
    }

    pub fn list_all(&self) -> RegistryResult<Vec<Registrant>> {
        list_all(&self.conn())
    }

    pub fn distinct_churches(&self) -> RegistryResult<Vec<String>> {
        distinct_churches(&self.conn())
    }

    pub fn distinct_areas(&self) -> RegistryResult<Vec<i64>> {
        distinct_areas(&self.conn())
    }

    pub fn max_last_updated(&self) -> RegistryResult<Option<DateTime<Utc>>> {
        max_last_updated(&self.conn())
    }

    pub fn count(&self) -> RegistryResult<i64> {
        count(&self.conn())
    }

    pub fn is_empty(&self) -> RegistryResult<bool> {
        Ok(self.count()? == 0)
    }

    pub fn clear_all(&self) -> RegistryResult<usize> {
        let removed = clear_all(&self.conn())?;
        debug!(removed, "registry cleared");
        Ok(removed)
    }

    pub fn snapshot(&self) -> RegistryResult<(Vec<Registrant>, Option<DateTime<Utc>>)> {
        snapshot(&mut self.conn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn person(name: &str, group: &str) -> Registrant {
        Registrant::new_pending(name, "Grace Chapel", 3, group, Utc::now())
    }

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_batch_and_list() {
        let mut conn = memory_conn();
        let rows = [person("Ann Lee", "g1"), person("Ben Cruz", "g1")];
        insert_batch(&mut conn, &rows, Utc::now()).unwrap();

        let group = list_by_group(&conn, "g1").unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].full_name, "Ann Lee");
        assert!(group.iter().all(|r| r.status == Status::Pending));
        assert!(exists(&conn, "Ben Cruz").unwrap());
        assert!(!exists(&conn, "ben cruz").unwrap());
    }

    #[test]
    fn test_duplicate_rejects_whole_batch() {
        let mut conn = memory_conn();
        insert_batch(&mut conn, &[person("Ann Lee", "g1")], Utc::now()).unwrap();

        let err = insert_batch(
            &mut conn,
            &[person("Cara Diaz", "g2"), person("Ann Lee", "g2"), person("Dan Roe", "g2")],
            Utc::now(),
        )
        .unwrap_err();

        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "Ann Lee"));
        assert!(!exists(&conn, "Cara Diaz").unwrap());
        assert!(!exists(&conn, "Dan Roe").unwrap());
        assert_eq!(count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_repeated_name_inside_batch_is_duplicate() {
        let mut conn = memory_conn();
        let rows = [person("Eve Tan", "g1"), person("Eve Tan", "g1")];
        let err = insert_batch(&mut conn, &rows, Utc::now()).unwrap_err();

        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "Eve Tan"));
        assert_eq!(count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_set_status_transitions() {
        let mut conn = memory_conn();
        insert_batch(&mut conn, &[person("Ann Lee", "g1")], Utc::now()).unwrap();

        let first = set_status(&mut conn, "Ann Lee", Status::Approved, Utc::now()).unwrap();
        let second = set_status(&mut conn, "Ann Lee", Status::Approved, Utc::now()).unwrap();
        assert_eq!(first, StatusChange::Updated);
        assert_eq!(second, StatusChange::Unchanged);

        let back = set_status(&mut conn, "Ann Lee", Status::Pending, Utc::now());
        assert!(matches!(back, Err(RegistryError::InvalidTransition(_))));

        let missing = set_status(&mut conn, "Nobody", Status::Approved, Utc::now());
        assert!(matches!(missing, Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_cursor_advances_on_status_change() {
        let mut conn = memory_conn();
        assert_eq!(max_last_updated(&conn).unwrap(), None);

        insert_batch(&mut conn, &[person("Ann Lee", "g1")], Utc::now()).unwrap();
        let before = max_last_updated(&conn).unwrap().unwrap();

        let later = before + chrono::Duration::seconds(5);
        set_status(&mut conn, "Ann Lee", Status::Approved, later).unwrap();
        assert_eq!(max_last_updated(&conn).unwrap(), Some(later));
    }

    #[test]
    fn test_late_batch_with_older_clock_still_advances_cursor() {
        let mut conn = memory_conn();
        let t = Utc::now().trunc_subsecs(6);

        insert_batch(&mut conn, &[person("Ben Cruz", "g2")], t + chrono::Duration::milliseconds(5))
            .unwrap();
        let pushed = max_last_updated(&conn).unwrap().unwrap();

        // Built before the first batch, committed after it
        insert_batch(&mut conn, &[person("Ann Lee", "g1")], t).unwrap();
        let cursor = max_last_updated(&conn).unwrap().unwrap();
        assert!(cursor > pushed);

        let ann = list_by_group(&conn, "g1").unwrap();
        assert_eq!(ann[0].last_updated, cursor);
    }

    #[test]
    fn test_status_change_after_future_row_advances_cursor() {
        let mut conn = memory_conn();
        let future = parse_timestamp("2099-01-01T00:00:00.000000Z").unwrap();
        let mut imported = person("Ann Lee", "g1");
        imported.last_updated = future;
        insert_if_absent(&mut conn, &[imported]).unwrap();
        insert_batch(&mut conn, &[person("Ben Cruz", "g2")], Utc::now()).unwrap();
        let before = max_last_updated(&conn).unwrap().unwrap();
        assert!(before > future);

        set_status(&mut conn, "Ben Cruz", Status::Approved, Utc::now()).unwrap();
        assert!(max_last_updated(&conn).unwrap().unwrap() > before);
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let mut conn = memory_conn();
        insert_batch(&mut conn, &[person("Ann Lee", "g1")], Utc::now()).unwrap();
        set_status(&mut conn, "Ann Lee", Status::Approved, Utc::now()).unwrap();

        let inserted =
            insert_if_absent(&mut conn, &[person("Ann Lee", "old"), person("Ben Cruz", "old")])
                .unwrap();

        assert_eq!(inserted, 1);
        let ann = list_all(&conn).unwrap().into_iter().find(|r| r.full_name == "Ann Lee").unwrap();
        assert_eq!(ann.status, Status::Approved);
        assert_eq!(ann.group_id, "g1");
    }

    #[test]
    fn test_distinct_values() {
        let mut conn = memory_conn();
        let mut other = person("Ben Cruz", "g2");
        other.church = "Hope Church".to_string();
        other.area = 5;
        let rows = [person("Ann Lee", "g1"), person("Cara Diaz", "g1")];
        insert_batch(&mut conn, &rows, Utc::now()).unwrap();
        insert_batch(&mut conn, &[other], Utc::now()).unwrap();

        assert_eq!(distinct_churches(&conn).unwrap(), vec!["Grace Chapel", "Hope Church"]);
        assert_eq!(distinct_areas(&conn).unwrap(), vec![3, 5]);
    }

    #[test]
    fn test_clear_all_is_idempotent() {
        let mut conn = memory_conn();
        insert_batch(&mut conn, &[person("Ann Lee", "g1")], Utc::now()).unwrap();

        assert_eq!(clear_all(&conn).unwrap(), 1);
        assert_eq!(clear_all(&conn).unwrap(), 0);
        assert_eq!(count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_snapshot_matches_cursor() {
        let store = RegistryStore::open_in_memory().unwrap();
        store.insert_batch(&[person("Ann Lee", "g1"), person("Ben Cruz", "g1")]).unwrap();

        let (rows, cursor) = store.snapshot().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(cursor, store.max_last_updated().unwrap());
    }

    #[test]
    fn test_racing_batches_on_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        // Create the schema before the race starts
        RegistryStore::open(&path, Duration::from_secs(5)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["g1", "g2"]
            .into_iter()
            .map(|group| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let store = RegistryStore::open(&path, Duration::from_secs(5)).unwrap();
                    barrier.wait();
                    store.insert_batch(&[person(&format!("Solo {}", group), group), person("Shared Name", group)])
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::Duplicate(n)) if n == "Shared Name"))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(duplicates, 1);

        let store = RegistryStore::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }
}
