use crate::{Result, Store, StoreError, DATE_FORMAT};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::borrow::Borrow;

/// Faculty member with no attendance on a given date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Absentee {
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_id: String,
    pub faculty_id: String,
    pub date: NaiveDate,
    pub message: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub alert_id: String,
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub phone: String,
    pub date: NaiveDate,
    pub message: String,
    pub status: String,
    pub sent_time: String,
}

type RawAlert = (String, String, String, String, String, String, String, String, String);

impl<C: Borrow<Connection>> Store<C> {
    pub fn absentees(&self, date: NaiveDate) -> Result<Vec<Absentee>> {
        let mut stmt = self.conn().prepare(
            "SELECT f.faculty_id, f.name, f.department, f.phone
             FROM faculty f
             WHERE NOT EXISTS (
                SELECT 1 FROM attendance a WHERE a.faculty_id = f.faculty_id AND a.date = ?1
             )
             ORDER BY f.faculty_id",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok(Absentee {
                faculty_id: row.get(0)?,
                name: row.get(1)?,
                department: row.get(2)?,
                phone: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn record_alert(&self, alert: &NewAlert) -> Result<()> {
        self.conn().execute(
            "INSERT INTO absentee_alerts (alert_id, faculty_id, date, message, status, sent_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alert.alert_id,
                alert.faculty_id,
                alert.date.format(DATE_FORMAT).to_string(),
                alert.message,
                alert.status,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Whether an alert with `status` was already recorded for this absence.
    pub fn alert_recorded(&self, faculty_id: &str, date: NaiveDate, status: &str) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM absentee_alerts WHERE faculty_id = ?1 AND date = ?2 AND status = ?3",
                params![faculty_id, date.format(DATE_FORMAT).to_string(), status],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Alerts, newest date first, optionally for a single date.
    pub fn list_alerts(&self, date: Option<NaiveDate>) -> Result<Vec<AlertRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT al.alert_id, al.faculty_id, f.name, f.department, f.phone,
                    al.date, al.message, al.status, al.sent_time
             FROM absentee_alerts al JOIN faculty f ON f.faculty_id = al.faculty_id
             WHERE (?1 IS NULL OR al.date = ?1)
             ORDER BY al.date DESC, al.sent_time DESC, al.alert_id",
        )?;
        let rows = stmt.query_map(params![date.map(|d| d.format(DATE_FORMAT).to_string())], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?;
        let raw = rows.collect::<rusqlite::Result<Vec<RawAlert>>>()?;
        raw.into_iter().map(decode_alert_row).collect()
    }
}

fn decode_alert_row(raw: RawAlert) -> Result<AlertRecord> {
    let (alert_id, faculty_id, name, department, phone, date, message, status, sent_time) = raw;
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidDbValue(format!("alert {alert_id} date {date:?}: {e}")))?;
    Ok(AlertRecord {
        alert_id,
        faculty_id,
        name,
        department,
        phone,
        date,
        message,
        status,
        sent_time,
    })
}
