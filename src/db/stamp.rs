//! Identifiers, clocks and the touch-on-write update builder

use std::sync::Mutex;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{Connection, ToSql};
use uuid::Uuid;

use crate::error::Result;

/// Source of wall-clock timestamps for every row the store writes.
///
/// Timestamps are truncated to microseconds so values survive a round trip
/// through SQLite unchanged.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// A clock that only moves when told to. Used to exercise ordering and
/// duration logic, including clocks that jump backwards.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start.trunc_subsecs(6)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at.trunc_subsecs(6);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = (*now + by).trunc_subsecs(6);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fresh durable identifier for a primary entity
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Timestamp for an append-only log row: never earlier than the previous row
/// of the same log.
pub(crate) fn monotonic(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(last) if last > now => last,
        _ => now,
    }
}

/// Column assignments for a single-row UPDATE.
///
/// `apply` appends `updated_at` exactly once, however many columns change.
/// An empty set never reaches the database, so the row is not touched.
pub(crate) struct UpdateSet {
    table: &'static str,
    assignments: Vec<(&'static str, Box<dyn ToSql>)>,
}

impl UpdateSet {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
        }
    }

    pub fn set<T: ToSql + 'static>(&mut self, column: &'static str, value: T) -> &mut Self {
        self.assignments.push((column, Box::new(value)));
        self
    }

    /// Assign only when a value is given
    pub fn set_opt<T: ToSql + 'static>(&mut self, column: &'static str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.set(column, value);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn columns(&self) -> Vec<&'static str> {
        self.assignments.iter().map(|(c, _)| *c).collect()
    }

    /// Run the update against row `id`. Returns the number of rows changed.
    pub fn apply(self, conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<usize> {
        if self.assignments.is_empty() {
            return Ok(0);
        }

        let mut sql = format!("UPDATE {} SET ", self.table);
        let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(self.assignments.len() + 2);
        for (i, (column, value)) in self.assignments.into_iter().enumerate() {
            sql.push_str(&format!("{} = ?{}, ", column, i + 1));
            params.push(value);
        }
        params.push(Box::new(now));
        sql.push_str(&format!("updated_at = ?{}", params.len()));
        params.push(Box::new(id.to_string()));
        sql.push_str(&format!(" WHERE id = ?{}", params.len()));

        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_refs.as_slice())?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn monotonic_never_goes_backwards() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let t0 = t1 - Duration::seconds(5);
        assert_eq!(monotonic(t0, Some(t1)), t1);
        assert_eq!(monotonic(t1, Some(t0)), t1);
        assert_eq!(monotonic(t0, None), t0);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        clock.set(start - Duration::hours(1));
        assert_eq!(clock.now(), start - Duration::hours(1));
    }

    #[test]
    fn update_set_stamps_once() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY, a TEXT, b INTEGER, updated_at TEXT);
             INSERT INTO t VALUES ('x', 'old', 1, 'never');",
        )
        .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let mut set = UpdateSet::new("t");
        set.set("a", "new".to_string()).set("b", 2_i64);
        assert_eq!(set.columns(), vec!["a", "b"]);
        assert_eq!(set.apply(&conn, "x", now).unwrap(), 1);

        let (a, b, stamped): (String, i64, DateTime<Utc>) = conn
            .query_row("SELECT a, b, updated_at FROM t WHERE id = 'x'", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(a, "new");
        assert_eq!(b, 2);
        assert_eq!(stamped, now);
    }

    #[test]
    fn empty_update_set_does_not_touch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY, updated_at TEXT);
             INSERT INTO t VALUES ('x', 'never');",
        )
        .unwrap();

        let set = UpdateSet::new("t");
        assert!(set.is_empty());
        assert_eq!(set.apply(&conn, "x", Utc::now()).unwrap(), 0);

        let stamped: String = conn
            .query_row("SELECT updated_at FROM t WHERE id = 'x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stamped, "never");
    }
}
