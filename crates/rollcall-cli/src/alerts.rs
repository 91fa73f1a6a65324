use chrono::NaiveDate;
use rollcall_store::{NewAlert, StoreError, StoreRef};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Alert status recorded for a delivered message.
pub const STATUS_SENT: &str = "Sent";

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("no phone number")]
    NoPhone,
    #[error("gateway rejected message: {0}")]
    Rejected(String),
}

/// Outbound message gateway. Returns the gateway's message id.
pub trait AlertSender: Send + Sync {
    fn send(&self, to: &str, body: &str) -> Result<String, AlertError>;
}

/// Delivers alerts as structured log events. Used when no gateway is configured.
pub struct LogSender;

impl AlertSender for LogSender {
    fn send(&self, to: &str, body: &str) -> Result<String, AlertError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(to, %message_id, body, "absentee alert");
        Ok(message_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSummary {
    pub date: Option<NaiveDate>,
    pub absentees: usize,
    pub sent: usize,
    pub failed: usize,
    /// Absentees already alerted successfully for this date.
    pub skipped: usize,
}

pub fn absentee_message(name: &str, date: NaiveDate) -> String {
    format!(
        "Dear {name}, you were marked absent on {}. Please contact administration.",
        date.format(rollcall_store::DATE_FORMAT)
    )
}

/// Alert every faculty member with no attendance on `date`.
///
/// Each attempt is recorded with status `Sent` or `Failed: <reason>`. Members
/// who already have a `Sent` alert for the date are not messaged again.
pub fn send_absentee_alerts(
    store: &StoreRef<'_>,
    sender: &dyn AlertSender,
    date: NaiveDate,
) -> Result<AlertSummary, StoreError> {
    let absentees = store.absentees(date)?;
    let mut summary = AlertSummary {
        date: Some(date),
        absentees: absentees.len(),
        ..Default::default()
    };

    for absentee in absentees {
        if store.alert_recorded(&absentee.faculty_id, date, STATUS_SENT)? {
            summary.skipped += 1;
            continue;
        }

        let message = absentee_message(&absentee.name, date);
        let phone = absentee.phone.trim();
        let delivery = if phone.is_empty() {
            Err(AlertError::NoPhone)
        } else {
            sender.send(phone, &message)
        };

        let status = match delivery {
            Ok(message_id) => {
                tracing::debug!(faculty_id = %absentee.faculty_id, %message_id, "alert sent");
                summary.sent += 1;
                STATUS_SENT.to_string()
            }
            Err(e) => {
                tracing::warn!(faculty_id = %absentee.faculty_id, error = %e, "alert failed");
                summary.failed += 1;
                format!("Failed: {e}")
            }
        };

        store.record_alert(&NewAlert {
            alert_id: Uuid::new_v4().to_string(),
            faculty_id: absentee.faculty_id,
            date,
            message,
            status,
        })?;
    }

    tracing::info!(%date, sent = summary.sent, failed = summary.failed, skipped = summary.skipped, "absentee alerts done");
    Ok(summary)
}
