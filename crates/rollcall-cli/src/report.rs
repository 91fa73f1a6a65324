use chrono::{NaiveDate, NaiveTime};
use clap::ValueEnum;
use rollcall_store::AttendanceRecord;
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Csv,
    Json,
}

const CSV_HEADER: [&str; 7] = ["faculty_id", "name", "department", "date", "time", "location", "status"];

/// One CSV line; the column order follows `CSV_HEADER`.
#[derive(Serialize)]
struct CsvRow<'a> {
    faculty_id: &'a str,
    name: &'a str,
    department: &'a str,
    date: NaiveDate,
    time: NaiveTime,
    location: &'a str,
    status: &'a str,
}

impl<'a> From<&'a AttendanceRecord> for CsvRow<'a> {
    fn from(r: &'a AttendanceRecord) -> Self {
        Self {
            faculty_id: &r.faculty_id,
            name: &r.name,
            department: &r.department,
            date: r.date,
            time: r.time,
            location: &r.location,
            status: &r.status,
        }
    }
}

/// Write attendance `records` to `out` in `format`.
pub fn write_attendance<W: Write>(
    mut out: W,
    records: &[AttendanceRecord],
    format: ReportFormat,
) -> Result<(), ReportError> {
    match format {
        ReportFormat::Json => write_json(&mut out, records)?,
        ReportFormat::Csv => {
            // The header is written by hand so an empty report still has one.
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .terminator(csv::Terminator::CRLF)
                .from_writer(&mut out);
            writer.write_record(CSV_HEADER)?;
            for record in records {
                writer.serialize(CsvRow::from(record))?;
            }
            writer.flush()?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Pretty JSON followed by a newline.
pub fn write_json<W: Write, T: Serialize + ?Sized>(mut out: W, value: &T) -> Result<(), ReportError> {
    serde_json::to_writer_pretty(&mut out, value)?;
    out.write_all(b"\n")?;
    Ok(())
}
