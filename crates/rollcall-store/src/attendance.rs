use crate::{Result, Store, StoreError, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;

/// Status written for a recognised capture.
pub const STATUS_PRESENT: &str = "Present";

#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub faculty_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    AlreadyMarked,
}

/// Attendance row joined with the faculty profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: String,
    pub status: String,
}

/// Report filter. Every `None` field matches all rows; date bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub faculty_id: Option<String>,
    pub department: Option<String>,
    pub status: Option<String>,
}

/// Present/absent counts for one day, over every registered faculty member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_faculty: u32,
    pub present: u32,
    pub absent: u32,
    /// Present share in percent, one decimal; 0 when nobody is registered.
    pub percentage: f64,
}

impl DailySummary {
    fn new(date: NaiveDate, total_faculty: u32, present: u32) -> Self {
        Self {
            date,
            total_faculty,
            present,
            absent: total_faculty.saturating_sub(present),
            percentage: percentage(present, total_faculty),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentSummary {
    pub department: String,
    pub total: u32,
    pub present: u32,
    pub absent: u32,
    pub percentage: f64,
}

type RawRecord = (i64, String, String, String, String, String, String, String);

const SELECT_RECORDS: &str = "
    SELECT a.id, a.faculty_id, f.name, f.department, a.date, a.time, a.location, a.status
    FROM attendance a JOIN faculty f ON f.faculty_id = a.faculty_id";

impl<C: Borrow<Connection>> Store<C> {
    pub fn attendance_exists(&self, faculty_id: &str, date: NaiveDate) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM attendance WHERE faculty_id = ?1 AND date = ?2",
                params![faculty_id, date.format(DATE_FORMAT).to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert one attendance row.
    ///
    /// A second row for the same `(faculty_id, date)` is refused by the
    /// unique constraint and reported as [`InsertOutcome::AlreadyMarked`],
    /// also when two connections race for it.
    pub fn insert_attendance(&self, entry: &NewAttendance) -> Result<InsertOutcome> {
        let inserted = self.conn().execute(
            "INSERT INTO attendance (faculty_id, date, time, location, status, recorded_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(faculty_id, date) DO NOTHING",
            params![
                entry.faculty_id,
                entry.date.format(DATE_FORMAT).to_string(),
                entry.time.format(TIME_FORMAT).to_string(),
                entry.location,
                entry.status,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(faculty_id = %entry.faculty_id, date = %entry.date, "attendance already recorded");
            return Ok(InsertOutcome::AlreadyMarked);
        }
        Ok(InsertOutcome::Inserted)
    }

    /// Filtered attendance, newest first.
    pub fn attendance_query(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
        let sql = format!(
            "{SELECT_RECORDS}
             WHERE (?1 IS NULL OR a.date >= ?1)
               AND (?2 IS NULL OR a.date <= ?2)
               AND (?3 IS NULL OR a.faculty_id = ?3)
               AND (?4 IS NULL OR f.department = ?4)
               AND (?5 IS NULL OR a.status = ?5)
             ORDER BY a.date DESC, a.time DESC, a.id DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.from.map(|d| d.format(DATE_FORMAT).to_string()),
                filter.to.map(|d| d.format(DATE_FORMAT).to_string()),
                filter.faculty_id,
                filter.department,
                filter.status,
            ],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )?;

        let raw = rows.collect::<rusqlite::Result<Vec<RawRecord>>>()?;
        raw.into_iter().map(decode_attendance_row).collect()
    }

    pub fn daily_summary(&self, date: NaiveDate) -> Result<DailySummary> {
        let (total, present): (u32, u32) = self.conn().query_row(
            "SELECT
                (SELECT COUNT(*) FROM faculty),
                (SELECT COUNT(*) FROM attendance WHERE date = ?1)",
            params![date.format(DATE_FORMAT).to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DailySummary::new(date, total, present))
    }

    /// Per-department counts for `date`, ordered by department name.
    ///
    /// Faculty without a department are grouped under the empty string.
    pub fn department_summary(&self, date: NaiveDate) -> Result<Vec<DepartmentSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT f.department, COUNT(*), COUNT(a.id)
             FROM faculty f
             LEFT JOIN attendance a ON a.faculty_id = f.faculty_id AND a.date = ?1
             GROUP BY f.department
             ORDER BY f.department",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, u32>(2)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (department, total, present) = row?;
            out.push(DepartmentSummary {
                department,
                total,
                present,
                absent: total.saturating_sub(present),
                percentage: percentage(present, total),
            });
        }
        Ok(out)
    }

    /// One [`DailySummary`] per day in `from..=to`, oldest first.
    ///
    /// Days without any record are included with zero present. An inverted
    /// range yields no days. Totals use the current faculty count.
    pub fn range_summary(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailySummary>> {
        if from > to {
            return Ok(Vec::new());
        }
        let total: u32 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM faculty", [], |row| row.get(0))?;

        let mut stmt = self.conn().prepare(
            "SELECT date, COUNT(*) FROM attendance
             WHERE date >= ?1 AND date <= ?2
             GROUP BY date",
        )?;
        let rows = stmt.query_map(
            params![from.format(DATE_FORMAT).to_string(), to.format(DATE_FORMAT).to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
        )?;
        let mut counts = HashMap::new();
        for row in rows {
            let (date, present) = row?;
            let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
                .map_err(|e| StoreError::InvalidDbValue(format!("attendance date {date:?}: {e}")))?;
            counts.insert(date, present);
        }

        Ok(from
            .iter_days()
            .take_while(|d| *d <= to)
            .map(|d| DailySummary::new(d, total, counts.get(&d).copied().unwrap_or(0)))
            .collect())
    }
}

fn percentage(present: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(present) * 1000.0 / f64::from(total)).round() / 10.0
}

fn decode_attendance_row(raw: RawRecord) -> Result<AttendanceRecord> {
    let (id, faculty_id, name, department, date, time, location, status) = raw;
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidDbValue(format!("attendance {id} date {date:?}: {e}")))?;
    let time = NaiveTime::parse_from_str(&time, TIME_FORMAT)
        .map_err(|e| StoreError::InvalidDbValue(format!("attendance {id} time {time:?}: {e}")))?;
    Ok(AttendanceRecord {
        id,
        faculty_id,
        name,
        department,
        date,
        time,
        location,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn on(store: &Store, date: NaiveDate) -> Vec<AttendanceRecord> {
        store
            .attendance_query(&AttendanceFilter {
                from: Some(date),
                to: Some(date),
                ..Default::default()
            })
            .unwrap()
    }

    fn present(id: &str, date: NaiveDate, hour: u32) -> NewAttendance {
        NewAttendance {
            faculty_id: id.into(),
            date,
            time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            location: "Main Gate".into(),
            status: STATUS_PRESENT.into(),
        }
    }

    #[test]
    fn test_insert_then_already_marked() {
        let store = store_with(&["A"]);
        assert!(!store.attendance_exists("A", day(1)).unwrap());
        assert_eq!(store.insert_attendance(&present("A", day(1), 9)).unwrap(), InsertOutcome::Inserted);
        assert!(store.attendance_exists("A", day(1)).unwrap());
        assert_eq!(
            store.insert_attendance(&present("A", day(1), 14)).unwrap(),
            InsertOutcome::AlreadyMarked
        );

        let rows = on(&store, day(1));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(rows[0].name, "Prof A");
    }

    #[test]
    fn test_next_day_is_separate() {
        let store = store_with(&["A"]);
        store.insert_attendance(&present("A", day(1), 9)).unwrap();
        assert_eq!(store.insert_attendance(&present("A", day(2), 9)).unwrap(), InsertOutcome::Inserted);
    }

    #[test]
    fn test_two_connections_cannot_double_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let first = Store::open(&path).unwrap();
        first.upsert_identity(&identity("A", "Ada", vec![1.0, 0.0])).unwrap();
        let second = Store::open(&path).unwrap();

        let a = first.insert_attendance(&present("A", day(5), 9)).unwrap();
        let b = second.insert_attendance(&present("A", day(5), 9)).unwrap();
        assert_eq!(a, InsertOutcome::Inserted);
        assert_eq!(b, InsertOutcome::AlreadyMarked);
        assert_eq!(on(&second, day(5)).len(), 1);
    }

    #[test]
    fn test_unknown_identity_is_rejected() {
        let store = store_with(&[]);
        let err = store.insert_attendance(&present("ghost", day(1), 9)).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn test_query_filters_and_order() {
        let store = store_with(&["A", "B", "C"]);
        store.update_profile("C", &crate::ProfileUpdate {
            department: Some("Maths".into()),
            ..Default::default()
        })
        .unwrap();
        store.insert_attendance(&present("A", day(1), 9)).unwrap();
        store.insert_attendance(&present("B", day(2), 8)).unwrap();
        store.insert_attendance(&present("C", day(2), 10)).unwrap();
        store.insert_attendance(&present("A", day(3), 9)).unwrap();

        let all = store.attendance_query(&AttendanceFilter::default()).unwrap();
        let order: Vec<_> = all.iter().map(|r| (r.faculty_id.as_str(), r.date)).collect();
        assert_eq!(order, vec![("A", day(3)), ("C", day(2)), ("B", day(2)), ("A", day(1))]);

        let ranged = store
            .attendance_query(&AttendanceFilter {
                from: Some(day(2)),
                to: Some(day(2)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ranged.len(), 2);

        let maths = store
            .attendance_query(&AttendanceFilter {
                department: Some("Maths".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(maths.len(), 1);
        assert_eq!(maths[0].faculty_id, "C");

        let only_a = store
            .attendance_query(&AttendanceFilter {
                faculty_id: Some("A".into()),
                status: Some(STATUS_PRESENT.into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(only_a.len(), 2);
    }

    #[test]
    fn test_daily_summary() {
        let store = store_with(&["A", "B", "C"]);
        store.insert_attendance(&present("B", day(4), 9)).unwrap();
        let summary = store.daily_summary(day(4)).unwrap();
        assert_eq!(summary.total_faculty, 3);
        assert_eq!(summary.present, 1);
        assert_eq!(summary.absent, 2);
        assert_eq!(summary.percentage, 33.3);
    }

    #[test]
    fn test_summaries_with_no_faculty() {
        let store = store_with(&[]);
        let summary = store.daily_summary(day(4)).unwrap();
        assert_eq!((summary.total_faculty, summary.present, summary.absent), (0, 0, 0));
        assert_eq!(summary.percentage, 0.0);

        assert!(store.department_summary(day(4)).unwrap().is_empty());

        let range = store.range_summary(day(1), day(3)).unwrap();
        assert_eq!(range.len(), 3);
        assert!(range.iter().all(|d| d.total_faculty == 0 && d.percentage == 0.0));
    }

    #[test]
    fn test_department_summary() {
        let store = store_with(&["A", "B", "C", "D"]);
        for id in ["C", "D"] {
            store
                .update_profile(id, &crate::ProfileUpdate {
                    department: Some("Maths".into()),
                    ..Default::default()
                })
                .unwrap();
        }
        store.insert_attendance(&present("A", day(4), 9)).unwrap();
        store.insert_attendance(&present("C", day(4), 9)).unwrap();
        store.insert_attendance(&present("D", day(4), 9)).unwrap();
        // Another day must not leak into the counts.
        store.insert_attendance(&present("B", day(5), 9)).unwrap();

        let depts = store.department_summary(day(4)).unwrap();
        assert_eq!(
            depts,
            vec![
                DepartmentSummary {
                    department: "Maths".into(),
                    total: 2,
                    present: 2,
                    absent: 0,
                    percentage: 100.0,
                },
                DepartmentSummary {
                    department: "Physics".into(),
                    total: 2,
                    present: 1,
                    absent: 1,
                    percentage: 50.0,
                },
            ]
        );
    }

    #[test]
    fn test_range_summary_fills_empty_days() {
        let store = store_with(&["A", "B", "C"]);
        store.insert_attendance(&present("A", day(1), 9)).unwrap();
        store.insert_attendance(&present("B", day(1), 9)).unwrap();
        store.insert_attendance(&present("C", day(3), 9)).unwrap();
        store.insert_attendance(&present("A", day(9), 9)).unwrap();

        let range = store.range_summary(day(1), day(3)).unwrap();
        let days: Vec<_> = range.iter().map(|d| (d.date, d.present, d.absent, d.percentage)).collect();
        assert_eq!(
            days,
            vec![(day(1), 2, 1, 66.7), (day(2), 0, 3, 0.0), (day(3), 1, 2, 33.3)]
        );

        assert_eq!(store.range_summary(day(2), day(2)).unwrap().len(), 1);
        assert!(store.range_summary(day(3), day(1)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_cascades_to_attendance() {
        let store = store_with(&["A"]);
        store.insert_attendance(&present("A", day(1), 9)).unwrap();
        store.delete_identity("A").unwrap();
        assert!(store.attendance_query(&AttendanceFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_date_surfaces_invalid_value() {
        let store = store_with(&["A"]);
        store
            .conn()
            .execute(
                "INSERT INTO attendance (faculty_id, date, time, status, recorded_on)
                 VALUES ('A', 'yesterday', '09:00:00', 'Present', '')",
                [],
            )
            .unwrap();
        let err = store.attendance_query(&AttendanceFilter::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDbValue(_)));
    }
}
