use crate::{Result, Store, StoreError};
use chrono::Utc;
use rollcall_core::{Descriptor, IdentityRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::borrow::Borrow;

/// Registration payload. Upserting replaces any previous descriptor wholesale.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub email: String,
    pub phone: String,
    pub descriptor: Descriptor,
}

/// Profile fields to change; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub department: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Faculty listing row, without the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacultyRow {
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub email: String,
    pub phone: String,
    pub enrolled_at: String,
    pub enrolled: bool,
}

impl<C: Borrow<Connection>> Store<C> {
    /// Insert or replace an identity. Returns true when a row was replaced.
    pub fn upsert_identity(&self, identity: &NewIdentity) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM faculty WHERE faculty_id = ?1",
                params![identity.faculty_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO faculty (faculty_id, name, department, email, phone, descriptor, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(faculty_id) DO UPDATE SET
                name = excluded.name,
                department = excluded.department,
                email = excluded.email,
                phone = excluded.phone,
                descriptor = excluded.descriptor,
                enrolled_at = excluded.enrolled_at",
            params![
                identity.faculty_id,
                identity.name,
                identity.department,
                identity.email,
                identity.phone,
                identity.descriptor.to_le_bytes(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::info!(faculty_id = %identity.faculty_id, replaced = existed, "identity stored");
        Ok(existed)
    }

    /// Replace only the stored descriptor of an existing identity.
    pub fn set_descriptor(&self, faculty_id: &str, descriptor: &Descriptor) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE faculty SET descriptor = ?2, enrolled_at = ?3 WHERE faculty_id = ?1",
            params![faculty_id, descriptor.to_le_bytes(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(faculty_id.to_string()));
        }
        Ok(())
    }

    pub fn update_profile(&self, faculty_id: &str, update: &ProfileUpdate) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE faculty SET
                name = COALESCE(?2, name),
                department = COALESCE(?3, department),
                email = COALESCE(?4, email),
                phone = COALESCE(?5, phone)
             WHERE faculty_id = ?1",
            params![faculty_id, update.name, update.department, update.email, update.phone],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(faculty_id.to_string()));
        }
        Ok(())
    }

    pub fn get_identity(&self, faculty_id: &str) -> Result<Option<FacultyRow>> {
        self.conn()
            .query_row(
                "SELECT faculty_id, name, department, email, phone, enrolled_at, descriptor IS NOT NULL
                 FROM faculty WHERE faculty_id = ?1",
                params![faculty_id],
                decode_faculty_row,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_identities(&self) -> Result<Vec<FacultyRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT faculty_id, name, department, email, phone, enrolled_at, descriptor IS NOT NULL
             FROM faculty ORDER BY faculty_id",
        )?;
        let rows = stmt.query_map([], decode_faculty_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// Whether another identity already uses `email`.
    pub fn email_taken(&self, email: &str, except_id: &str) -> Result<bool> {
        if email.is_empty() {
            return Ok(false);
        }
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM faculty WHERE email = ?1 AND faculty_id != ?2",
                params![email, except_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete an identity and, by cascade, its attendance and alerts.
    pub fn delete_identity(&self, faculty_id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM faculty WHERE faculty_id = ?1", params![faculty_id])?;
        if deleted > 0 {
            tracing::info!(faculty_id, "identity deleted");
        }
        Ok(deleted > 0)
    }

    /// Consistent snapshot of every enrolled descriptor at `dimension`.
    ///
    /// Rows without a descriptor are left out. Rows whose descriptor does not
    /// decode at `dimension` are skipped with a warning.
    pub fn gallery(&self, dimension: usize) -> Result<Vec<IdentityRecord>> {
        let tx = self.conn().unchecked_transaction()?;
        let raw: Vec<(String, String, Vec<u8>, String)> = {
            let mut stmt = tx.prepare(
                "SELECT faculty_id, name, descriptor, enrolled_at
                 FROM faculty WHERE descriptor IS NOT NULL ORDER BY faculty_id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        tx.commit()?;

        let mut gallery = Vec::with_capacity(raw.len());
        for (identity_id, display_name, bytes, enrolled_at) in raw {
            match Descriptor::from_le_bytes(&bytes, dimension) {
                Ok(descriptor) => gallery.push(IdentityRecord {
                    identity_id,
                    display_name,
                    descriptor,
                    enrolled_at,
                }),
                Err(source) => {
                    let err = StoreError::InvalidDescriptor {
                        identity: identity_id,
                        source,
                    };
                    tracing::warn!(error = %err, bytes = bytes.len(), "skipping gallery entry");
                }
            }
        }
        Ok(gallery)
    }
}

fn decode_faculty_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FacultyRow> {
    Ok(FacultyRow {
        faculty_id: row.get(0)?,
        name: row.get(1)?,
        department: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        enrolled_at: row.get(5)?,
        enrolled: row.get(6)?,
    })
}
