//! Attendance service: registration, capture marking and queries over one
//! engine and one store.
//!
//! The store is one `tokio_rusqlite` connection whose thread runs closures
//! one at a time. A capture's attendance check and insert share a closure,
//! and the `(faculty_id, date)` constraint catches writers on other
//! connections.

use crate::alerts::{self, AlertSender, AlertSummary};
use crate::engine::{EngineError, EngineHandle};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use image::RgbImage;
use rollcall_core::{CaptureEvent, CosineMatcher, DecisionError, DecisionPolicy, Outcome};
use rollcall_store::{
    AlertRecord, AttendanceFilter, AttendanceRecord, DailySummary, DepartmentSummary, FacultyRow, InsertOutcome,
    NewAttendance, NewIdentity, ProfileUpdate, Store, StoreError, StoreRef, STATUS_PRESENT,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("faculty {0} is already registered (use --replace to re-enroll)")]
    AlreadyRegistered(String),
    #[error("email {0} is already used by another faculty member")]
    EmailTaken(String),
    #[error("faculty {0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("face models are not loaded")]
    EngineUnavailable,
    #[error("database connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
}

/// Registration details for one faculty member.
#[derive(Debug, Clone)]
pub struct Profile {
    pub faculty_id: String,
    pub name: String,
    pub department: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterReport {
    pub faculty_id: String,
    pub images_used: usize,
    pub images_skipped: Vec<usize>,
    pub replaced: bool,
}

/// Result of one `mark` call.
#[derive(Debug, Clone, Serialize)]
pub struct MarkReport {
    pub event_id: Uuid,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub identity: Option<String>,
    pub name: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: String,
}

/// Counts for one day, overall and per department.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    #[serde(flatten)]
    pub day: DailySummary,
    pub departments: Vec<DepartmentSummary>,
}

pub struct Service {
    db: tokio_rusqlite::Connection,
    engine: Option<EngineHandle>,
    matcher: CosineMatcher,
    policy: DecisionPolicy,
}

impl Service {
    /// Open or create the database at `path`.
    pub async fn open(
        path: &Path,
        engine: Option<EngineHandle>,
        matcher: CosineMatcher,
        policy: DecisionPolicy,
    ) -> Result<Self, ServiceError> {
        rollcall_store::create_parent_dir(path)?;
        let db = tokio_rusqlite::Connection::open(path).await?;
        tracing::debug!(path = %path.display(), "opened attendance database");
        Self::with_connection(db, engine, matcher, policy).await
    }

    pub async fn open_in_memory(
        engine: Option<EngineHandle>,
        matcher: CosineMatcher,
        policy: DecisionPolicy,
    ) -> Result<Self, ServiceError> {
        let db = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::with_connection(db, engine, matcher, policy).await
    }

    async fn with_connection(
        db: tokio_rusqlite::Connection,
        engine: Option<EngineHandle>,
        matcher: CosineMatcher,
        policy: DecisionPolicy,
    ) -> Result<Self, ServiceError> {
        db.call(|conn| Ok(rollcall_store::initialize(conn))).await??;
        Ok(Self {
            db,
            engine,
            matcher,
            policy,
        })
    }

    fn engine(&self) -> Result<&EngineHandle, ServiceError> {
        self.engine.as_ref().ok_or(ServiceError::EngineUnavailable)
    }

    /// Run `f` against the store on the connection thread.
    ///
    /// Closures run one after another, so the reads and writes inside one
    /// call see no interleaved writes from this service.
    async fn with_store<T, F, Er>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreRef<'_>) -> Result<T, Er> + Send + 'static,
        Er: Into<ServiceError>,
    {
        self.db
            .call(move |conn| Ok(f(&Store::attach(conn)).map_err(Into::<ServiceError>::into)))
            .await?
    }

    /// Enroll `images` and store them as `profile`.
    ///
    /// An existing id is refused unless `replace` is set, in which case its
    /// descriptor and profile are overwritten.
    pub async fn register(
        &self,
        profile: Profile,
        images: Vec<RgbImage>,
        replace: bool,
    ) -> Result<RegisterReport, ServiceError> {
        if profile.faculty_id.trim().is_empty() || profile.name.trim().is_empty() {
            return Err(ServiceError::InvalidInput("faculty id and name are required".into()));
        }
        if images.is_empty() {
            return Err(ServiceError::InvalidInput("at least one image is required".into()));
        }
        let engine = self.engine()?;

        // Fail before running inference when the answer is already known.
        let (id, email) = (profile.faculty_id.clone(), profile.email.clone());
        self.with_store(move |store| check_registration(store, &id, &email, replace))
            .await?;

        let enrollment = engine.enroll(images).await?;

        let faculty_id = profile.faculty_id.clone();
        let replaced = self
            .with_store(move |store| -> Result<bool, ServiceError> {
                check_registration(store, &profile.faculty_id, &profile.email, replace)?;
                let replaced = store.upsert_identity(&NewIdentity {
                    faculty_id: profile.faculty_id,
                    name: profile.name,
                    department: profile.department,
                    email: profile.email,
                    phone: profile.phone,
                    descriptor: enrollment.descriptor,
                })?;
                Ok(replaced)
            })
            .await?;

        Ok(RegisterReport {
            faculty_id,
            images_used: enrollment.used,
            images_skipped: enrollment.skipped,
            replaced,
        })
    }

    /// Change profile fields and, when `images` is non-empty, re-enroll.
    pub async fn update(
        &self,
        faculty_id: &str,
        update: ProfileUpdate,
        images: Vec<RgbImage>,
    ) -> Result<FacultyRow, ServiceError> {
        let id = faculty_id.to_string();
        let email = update.email.clone();
        self.with_store(move |store| -> Result<(), ServiceError> {
            if store.get_identity(&id)?.is_none() {
                return Err(ServiceError::NotFound(id));
            }
            if let Some(email) = email {
                if store.email_taken(&email, &id)? {
                    return Err(ServiceError::EmailTaken(email));
                }
            }
            Ok(())
        })
        .await?;

        let descriptor = if images.is_empty() {
            None
        } else {
            let enrollment = self.engine()?.enroll(images).await?;
            Some(enrollment.descriptor)
        };

        let id = faculty_id.to_string();
        self.with_store(move |store| -> Result<FacultyRow, ServiceError> {
            store.update_profile(&id, &update)?;
            if let Some(descriptor) = &descriptor {
                store.set_descriptor(&id, descriptor)?;
            }
            store.get_identity(&id)?.ok_or(ServiceError::NotFound(id))
        })
        .await
    }

    pub async fn remove(&self, faculty_id: &str) -> Result<(), ServiceError> {
        let id = faculty_id.to_string();
        self.with_store(move |store| -> Result<(), ServiceError> {
            if store.delete_identity(&id)? {
                Ok(())
            } else {
                Err(ServiceError::NotFound(id))
            }
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<FacultyRow>, ServiceError> {
        self.with_store(|store| store.list_identities()).await
    }

    /// Recognize the face in `image` and record attendance for now.
    pub async fn mark(
        &self,
        image: RgbImage,
        claimed: Option<String>,
        location: String,
    ) -> Result<MarkReport, ServiceError> {
        self.mark_at(image, claimed, location, Local::now().naive_local()).await
    }

    pub async fn mark_at(
        &self,
        image: RgbImage,
        claimed: Option<String>,
        location: String,
        at: NaiveDateTime,
    ) -> Result<MarkReport, ServiceError> {
        let engine = self.engine()?;
        let event = CaptureEvent::new(claimed);
        let dimension = engine.dimension();

        let gallery = self.with_store(move |store| store.gallery(dimension)).await?;

        let extracted = match engine.extract(image).await {
            Ok(descriptor) => Ok(descriptor),
            Err(EngineError::Extract(e)) => Err(e),
            Err(e) => return Err(e.into()),
        };

        let (matcher, policy) = (self.matcher, self.policy);
        let (date, time) = (at.date(), at.time().with_nanosecond(0).unwrap_or(at.time()));
        self.with_store(move |store| -> Result<MarkReport, ServiceError> {
            let mut decision = policy.conclude(&matcher, &event, extracted, &gallery, |id| {
                store.attendance_exists(id, date)
            })?;

            if let Outcome::Accepted {
                identity_id,
                already_marked,
                ..
            } = &mut decision.outcome
            {
                if !*already_marked {
                    let inserted = store.insert_attendance(&NewAttendance {
                        faculty_id: identity_id.clone(),
                        date,
                        time,
                        location: location.clone(),
                        status: STATUS_PRESENT.to_string(),
                    })?;
                    if inserted == InsertOutcome::AlreadyMarked {
                        tracing::info!(event_id = %decision.event_id, identity = %identity_id, "attendance recorded concurrently");
                        *already_marked = true;
                    }
                }
            }

            let identity = decision.accepted_identity().map(str::to_string);
            let name = identity.as_deref().and_then(|id| {
                gallery
                    .iter()
                    .find(|r| r.identity_id == id)
                    .map(|r| r.display_name.clone())
            });
            Ok(MarkReport {
                event_id: decision.event_id,
                outcome: decision.outcome,
                identity,
                name,
                date,
                time,
                location,
            })
        })
        .await
    }

    pub async fn summary(&self, date: NaiveDate) -> Result<SummaryReport, ServiceError> {
        self.with_store(move |store| -> Result<SummaryReport, ServiceError> {
            Ok(SummaryReport {
                day: store.daily_summary(date)?,
                departments: store.department_summary(date)?,
            })
        })
        .await
    }

    /// Per-day counts for every day in `from..=to`.
    pub async fn summary_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailySummary>, ServiceError> {
        if from > to {
            return Err(ServiceError::InvalidInput(format!("range start {from} is after its end {to}")));
        }
        self.with_store(move |store| store.range_summary(from, to)).await
    }

    pub async fn report(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, ServiceError> {
        self.with_store(move |store| store.attendance_query(&filter)).await
    }

    pub async fn send_alerts(
        &self,
        sender: Arc<dyn AlertSender>,
        date: NaiveDate,
    ) -> Result<AlertSummary, ServiceError> {
        self.with_store(move |store| alerts::send_absentee_alerts(store, sender.as_ref(), date))
            .await
    }

    pub async fn alerts(&self, date: Option<NaiveDate>) -> Result<Vec<AlertRecord>, ServiceError> {
        self.with_store(move |store| store.list_alerts(date)).await
    }
}

fn check_registration(store: &StoreRef<'_>, faculty_id: &str, email: &str, replace: bool) -> Result<(), ServiceError> {
    if !replace && store.get_identity(faculty_id)?.is_some() {
        return Err(ServiceError::AlreadyRegistered(faculty_id.to_string()));
    }
    if store.email_taken(email, faculty_id)? {
        return Err(ServiceError::EmailTaken(email.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use rollcall_core::{EnrollmentError, RejectReason};

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];
    const GREEN: [u8; 3] = [0, 255, 0];
    const BLACK: [u8; 3] = [0, 0, 0];

    fn profile(id: &str) -> Profile {
        Profile {
            faculty_id: id.into(),
            name: format!("Prof {id}"),
            department: "Physics".into(),
            email: format!("{}@example.edu", id.to_lowercase()),
            phone: "+15550100".into(),
        }
    }

    async fn service() -> Service {
        Service::open_in_memory(Some(engine()), CosineMatcher::default(), DecisionPolicy::default())
            .await
            .unwrap()
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 15, 30)
            .unwrap()
    }

    async fn registered(colors: &[(&str, [u8; 3])]) -> Service {
        let svc = service().await;
        for (id, color) in colors {
            svc.register(profile(id), vec![solid(*color)], false).await.unwrap();
        }
        svc
    }

    async fn mark(svc: &Service, color: [u8; 3], claim: Option<&str>) -> MarkReport {
        svc.mark_at(solid(color), claim.map(String::from), "Main Gate".into(), at(6, 9))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_mark_accepts_and_records_once() {
        let svc = registered(&[("A", RED), ("B", BLUE)]).await;

        let first = mark(&svc, RED, None).await;
        assert_eq!(first.identity.as_deref(), Some("A"));
        assert_eq!(first.name.as_deref(), Some("Prof A"));
        assert!(matches!(first.outcome, Outcome::Accepted { already_marked: false, contested: false, .. }));

        let second = mark(&svc, RED, None).await;
        assert!(matches!(second.outcome, Outcome::Accepted { already_marked: true, .. }));
        assert_ne!(first.event_id, second.event_id);

        let rows = svc.report(AttendanceFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, NaiveTime::from_hms_opt(9, 15, 30).unwrap());
        assert_eq!(rows[0].location, "Main Gate");
    }

    #[tokio::test]
    async fn test_concurrent_marks_record_once() {
        let svc = registered(&[("A", RED)]).await;
        let (a, b) = tokio::join!(mark(&svc, RED, None), mark(&svc, RED, None));
        let already: Vec<bool> = [a, b]
            .iter()
            .map(|r| matches!(r.outcome, Outcome::Accepted { already_marked: true, .. }))
            .collect();
        assert_eq!(already.iter().filter(|x| **x).count(), 1);
        assert_eq!(svc.report(AttendanceFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_rejections() {
        let svc = registered(&[("A", RED), ("B", BLUE)]).await;

        let no_face = mark(&svc, BLACK, None).await;
        assert_eq!(no_face.outcome, Outcome::Rejected { reason: RejectReason::NoFace });
        assert!(no_face.identity.is_none());

        let stranger = mark(&svc, GREEN, None).await;
        assert_eq!(stranger.outcome, Outcome::Rejected { reason: RejectReason::NoMatch });

        let wrong_claim = mark(&svc, RED, Some("B")).await;
        assert_eq!(
            wrong_claim.outcome,
            Outcome::Rejected { reason: RejectReason::ClaimNotMatched }
        );

        assert!(svc.report(AttendanceFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_near_twins_need_a_claim() {
        let svc = registered(&[("A", RED), ("T", [250, 5, 0])]).await;

        let open = mark(&svc, RED, None).await;
        assert!(matches!(open.outcome, Outcome::Ambiguous { ref candidates } if candidates.len() == 2));
        assert!(svc.report(AttendanceFilter::default()).await.unwrap().is_empty());

        let claimed = mark(&svc, RED, Some("T")).await;
        assert_eq!(claimed.identity.as_deref(), Some("T"));
        assert!(matches!(claimed.outcome, Outcome::Accepted { contested: true, .. }));
    }

    #[tokio::test]
    async fn test_empty_gallery_is_no_match() {
        let svc = service().await;
        let report = mark(&svc, RED, None).await;
        assert_eq!(report.outcome, Outcome::Rejected { reason: RejectReason::NoMatch });
    }

    #[tokio::test]
    async fn test_register_refuses_duplicate_unless_replace() {
        let svc = registered(&[("A", RED)]).await;

        let err = svc.register(profile("A"), vec![solid(BLUE)], false).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRegistered(ref id) if id == "A"));

        let report = svc.register(profile("A"), vec![solid(BLUE)], true).await.unwrap();
        assert!(report.replaced);
        let now_blue = mark(&svc, BLUE, None).await;
        assert_eq!(now_blue.identity.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_register_rejects_taken_email() {
        let svc = registered(&[("A", RED)]).await;
        let mut other = profile("B");
        other.email = "a@example.edu".into();
        let err = svc.register(other, vec![solid(BLUE)], false).await.unwrap_err();
        assert!(matches!(err, ServiceError::EmailTaken(_)));
    }

    #[tokio::test]
    async fn test_register_without_faces_fails() {
        let svc = service().await;
        let err = svc
            .register(profile("A"), vec![solid(BLACK), solid(BLACK)], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::Enrollment(EnrollmentError::EnrollmentFailed(2)))
        ));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_reports_skipped_images() {
        let svc = service().await;
        let report = svc
            .register(profile("A"), vec![solid(BLACK), solid(RED)], false)
            .await
            .unwrap();
        assert_eq!(report.images_used, 1);
        assert_eq!(report.images_skipped, vec![0]);
    }

    #[tokio::test]
    async fn test_update_profile_and_reenroll() {
        let svc = registered(&[("A", RED)]).await;
        let row = svc
            .update(
                "A",
                ProfileUpdate {
                    name: Some("Ada".into()),
                    ..Default::default()
                },
                vec![solid(GREEN)],
            )
            .await
            .unwrap();
        assert_eq!(row.name, "Ada");

        let report = mark(&svc, GREEN, None).await;
        assert_eq!(report.identity.as_deref(), Some("A"));
        assert_eq!(report.name.as_deref(), Some("Ada"));

        let err = svc.update("Z", ProfileUpdate::default(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let svc = registered(&[("A", RED)]).await;
        svc.remove("A").await.unwrap();
        assert!(matches!(svc.remove("A").await, Err(ServiceError::NotFound(_))));
        let report = mark(&svc, RED, None).await;
        assert_eq!(report.outcome, Outcome::Rejected { reason: RejectReason::NoMatch });
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let svc = registered(&[("A", RED), ("B", BLUE), ("C", GREEN)]).await;
        svc.update(
            "C",
            ProfileUpdate {
                department: Some("Maths".into()),
                ..Default::default()
            },
            Vec::new(),
        )
        .await
        .unwrap();
        mark(&svc, BLUE, None).await;

        let summary = svc.summary(at(6, 0).date()).await.unwrap();
        let day = &summary.day;
        assert_eq!((day.total_faculty, day.present, day.absent), (3, 1, 2));
        assert_eq!(day.percentage, 33.3);
        let depts: Vec<_> = summary
            .departments
            .iter()
            .map(|d| (d.department.as_str(), d.present, d.absent))
            .collect();
        assert_eq!(depts, vec![("Maths", 0, 1), ("Physics", 1, 1)]);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["present"], 1);
        assert_eq!(json["departments"][1]["percentage"], 50.0);
    }

    #[tokio::test]
    async fn test_summary_range() {
        let svc = registered(&[("A", RED), ("B", BLUE)]).await;
        mark(&svc, RED, None).await;

        let days = svc.summary_range(at(5, 0).date(), at(7, 0).date()).await.unwrap();
        let present: Vec<u32> = days.iter().map(|d| d.present).collect();
        assert_eq!(present, vec![0, 1, 0]);
        assert_eq!(days[1].percentage, 50.0);

        let err = svc.summary_range(at(7, 0).date(), at(5, 0).date()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_open_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/attendance.db");
        let policy = DecisionPolicy::default();

        let first = Service::open(&path, Some(engine()), CosineMatcher::default(), policy).await.unwrap();
        first.register(profile("A"), vec![solid(RED)], false).await.unwrap();
        drop(first);

        let second = Service::open(&path, Some(engine()), CosineMatcher::default(), policy).await.unwrap();
        assert_eq!(second.list().await.unwrap().len(), 1);
        let report = mark(&second, RED, None).await;
        assert_eq!(report.identity.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_engine_required_for_mark() {
        let svc = Service::open_in_memory(None, CosineMatcher::default(), DecisionPolicy::default())
            .await
            .unwrap();
        let err = svc
            .mark(solid(RED), None, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EngineUnavailable));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_report_json_shape() {
        let svc = registered(&[("A", RED)]).await;
        let report = mark(&svc, RED, None).await;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "accepted");
        assert_eq!(json["identity_id"], "A");
        assert_eq!(json["date"], "2024-05-06");
        assert_eq!(json["time"], "09:15:30");
        assert!(json["event_id"].is_string());
    }
}
