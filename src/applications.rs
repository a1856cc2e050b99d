//! Enrollment applications. Guardians submit and track them without an account,
//! staff review them and turn accepted ones into child records.

use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::academic_years::{find_current_year, Year};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::{insert_child, ChildId, CreateChild};
use crate::class_assignments::{assign_child, AssignChildRequest, ChildAssignmentRecord};
use crate::classes::{list_classes, ClassRecord};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::nursery::load_nursery;
use crate::util::generate_random_string;
use crate::{dates, text_enum};

pub type ApplicationId = i64;

const REFERENCE_CODE_LEN: usize = 10;

text_enum! {
    pub enum ApplicationStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub id: ApplicationId,
    pub nursery_id: NurseryId,
    pub reference_code: String,
    pub child_name: String,
    pub child_date_of_birth: NaiveDate,
    pub child_gender: String,
    pub allergies: String,
    pub guardian_name: String,
    pub guardian_phone: String,
    pub guardian_email: String,
    pub desired_start_date: Option<NaiveDate>,
    pub notes: String,
    pub status: ApplicationStatus,
    pub review_note: String,
    pub reviewed_by: Option<StaffId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_child_id: Option<ChildId>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitApplication {
    pub nursery_id: NurseryId,
    pub child_name: String,
    pub child_date_of_birth: String,
    #[serde(default)]
    pub child_gender: String,
    #[serde(default)]
    pub allergies: String,
    pub guardian_name: String,
    pub guardian_phone: String,
    #[serde(default)]
    pub guardian_email: String,
    pub desired_start_date: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// What a guardian gets to see, looked up by reference code.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatusView {
    pub reference_code: String,
    pub child_name: String,
    pub status: ApplicationStatus,
    pub review_note: String,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl From<ApplicationRecord> for ApplicationStatusView {
    fn from(r: ApplicationRecord) -> Self {
        Self {
            reference_code: r.reference_code,
            child_name: r.child_name,
            status: r.status,
            review_note: r.review_note,
            submitted_at: r.submitted_at,
            reviewed_at: r.reviewed_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublicClass {
    pub class_id: String,
    pub name: String,
    pub age_group_min: i64,
    pub age_group_max: i64,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublicNurseryInfo {
    pub id: NurseryId,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub classes: Vec<PublicClass>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcceptApplication {
    pub class_id: Option<String>,
    /// Defaults to the current academic year.
    pub year: Option<Year>,
    #[serde(default)]
    pub review_note: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RejectApplication {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResult {
    pub application: ApplicationRecord,
    pub child_id: ChildId,
    pub assignment: Option<ChildAssignmentRecord>,
}

async fn find_by_code(code: &str, pool: &SqlitePool) -> ApiResult<ApplicationRecord> {
    sqlx::query_as("SELECT * FROM applications WHERE reference_code=?")
        .bind(code.trim().to_lowercase())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Application {code}")))
}

pub async fn load_application(nursery_id: NurseryId, id: ApplicationId, pool: &SqlitePool) -> ApiResult<ApplicationRecord> {
    sqlx::query_as("SELECT * FROM applications WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Application {id}")))
}

pub async fn list_applications(nursery_id: NurseryId, status: Option<ApplicationStatus>, pool: &SqlitePool) -> ApiResult<Vec<ApplicationRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM applications WHERE nursery_id=");
    builder.push_bind(nursery_id);
    if let Some(status) = status {
        builder.push(" AND status=").push_bind(status);
    }
    builder.push(" ORDER BY submitted_at DESC, id DESC");
    let list = builder.build_query_as::<ApplicationRecord>().fetch_all(pool).await?;
    Ok(list)
}

pub async fn submit_application(req: &SubmitApplication, pool: &SqlitePool) -> ApiResult<ApplicationStatusView> {
    Validator::new()
        .required("childName", &req.child_name)
        .max_len("childName", &req.child_name, 100)
        .required("guardianName", &req.guardian_name)
        .max_len("guardianName", &req.guardian_name, 100)
        .required("guardianPhone", &req.guardian_phone)
        .check(req.guardian_phone.chars().all(|c| c.is_ascii_digit() || "+- ()".contains(c)), "guardianPhone", "must be a phone number")
        .check(req.guardian_email.is_empty() || req.guardian_email.contains('@'), "guardianEmail", "must be an e-mail address")
        .max_len("notes", &req.notes, 2000)
        .finish()?;
    let child_date_of_birth = dates::parse_date("childDateOfBirth", &req.child_date_of_birth)?;
    if child_date_of_birth > dates::today() {
        return Err(ApiError::invalid("childDateOfBirth", "must not be in the future"));
    }
    let desired_start_date = dates::parse_optional_date("desiredStartDate", req.desired_start_date.as_deref())?;
    load_nursery(req.nursery_id, pool).await?;

    let mut reference_code = generate_random_string(REFERENCE_CODE_LEN);
    for _ in 0..5 {
        let taken: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM applications WHERE reference_code=?")
            .bind(&reference_code)
            .fetch_one(pool).await?;
        if taken.0 == 0 {
            break;
        }
        reference_code = generate_random_string(REFERENCE_CODE_LEN);
    }
    sqlx::query("INSERT INTO applications
            (nursery_id, reference_code, child_name, child_date_of_birth, child_gender, allergies,
             guardian_name, guardian_phone, guardian_email, desired_start_date, notes, status, submitted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(req.nursery_id)
        .bind(&reference_code)
        .bind(req.child_name.trim())
        .bind(child_date_of_birth)
        .bind(&req.child_gender)
        .bind(&req.allergies)
        .bind(req.guardian_name.trim())
        .bind(req.guardian_phone.trim())
        .bind(req.guardian_email.trim())
        .bind(desired_start_date)
        .bind(&req.notes)
        .bind(ApplicationStatus::Pending)
        .bind(dates::now())
        .execute(pool).await?;
    info!("Application submitted, nursery: {}, reference: {reference_code}", req.nursery_id);
    Ok(find_by_code(&reference_code, pool).await?.into())
}

pub async fn public_nursery_info(nursery_id: NurseryId, pool: &SqlitePool) -> ApiResult<PublicNurseryInfo> {
    let nursery = load_nursery(nursery_id, pool).await?;
    let classes = list_classes(nursery_id, false, pool).await?;
    Ok(PublicNurseryInfo {
        id: nursery.id,
        name: nursery.name,
        address: nursery.address,
        phone: nursery.phone,
        classes: classes.into_iter()
            .map(|c: ClassRecord| PublicClass {
                class_id: c.class_id,
                name: c.name,
                age_group_min: c.age_group_min,
                age_group_max: c.age_group_max,
            })
            .collect(),
    })
}

fn ensure_pending(app: &ApplicationRecord) -> ApiResult<()> {
    if app.status != ApplicationStatus::Pending {
        return Err(ApiError::conflict(format!("Application {} is already {}", app.id, app.status)));
    }
    Ok(())
}

/// Creates the child, optionally places it, and closes the application, all or nothing.
pub async fn accept_application(ctx: &RequestContext, id: ApplicationId, req: &AcceptApplication, pool: &SqlitePool) -> ApiResult<AcceptResult> {
    let app = load_application(ctx.nursery_id, id, pool).await?;
    ensure_pending(&app)?;
    let child = CreateChild {
        name: app.child_name.clone(),
        date_of_birth: app.child_date_of_birth.to_string(),
        gender: app.child_gender.clone(),
        allergies: app.allergies.clone(),
        guardian_name: app.guardian_name.clone(),
        guardian_phone: app.guardian_phone.clone(),
        enrolled_on: app.desired_start_date.map(|d| d.to_string()),
    };
    let mut tx = pool.begin().await?;
    let child_id = insert_child(ctx.nursery_id, &child, &mut tx).await?;
    let assignment = match &req.class_id {
        Some(class_id) => {
            let year = match req.year {
                Some(year) => year,
                None => find_current_year(ctx.nursery_id, &mut tx).await?
                    .map(|y| y.year)
                    .ok_or_else(|| ApiError::invalid("year", "nursery has no current academic year"))?,
            };
            let req = AssignChildRequest { child_id, class_id: class_id.clone() };
            Some(assign_child(ctx.nursery_id, year, &req, &mut tx).await?)
        }
        None => None,
    };
    let res = sqlx::query("UPDATE applications SET status=?, review_note=?, reviewed_by=?, reviewed_at=?, created_child_id=?
            WHERE nursery_id=? AND id=? AND status=?")
        .bind(ApplicationStatus::Accepted)
        .bind(&req.review_note)
        .bind(ctx.staff_id)
        .bind(dates::now())
        .bind(child_id)
        .bind(ctx.nursery_id)
        .bind(id)
        .bind(ApplicationStatus::Pending)
        .execute(&mut *tx).await?;
    if res.rows_affected() == 0 {
        warn!("Application id: {id} was reviewed concurrently");
        return Err(ApiError::conflict(format!("Application {id} is no longer pending")));
    }
    tx.commit().await?;
    info!("Application accepted, nursery: {}, id: {id}, child: {child_id}", ctx.nursery_id);
    Ok(AcceptResult {
        application: load_application(ctx.nursery_id, id, pool).await?,
        child_id,
        assignment,
    })
}

pub async fn reject_application(ctx: &RequestContext, id: ApplicationId, req: &RejectApplication, pool: &SqlitePool) -> ApiResult<ApplicationRecord> {
    Validator::new()
        .required("reason", &req.reason)
        .max_len("reason", &req.reason, 2000)
        .finish()?;
    load_application(ctx.nursery_id, id, pool).await?;
    // the status guard in the WHERE clause is the pending check, an accept may commit in between
    let res = sqlx::query("UPDATE applications SET status=?, review_note=?, reviewed_by=?, reviewed_at=?
            WHERE nursery_id=? AND id=? AND status=?")
        .bind(ApplicationStatus::Rejected)
        .bind(req.reason.trim())
        .bind(ctx.staff_id)
        .bind(dates::now())
        .bind(ctx.nursery_id)
        .bind(id)
        .bind(ApplicationStatus::Pending)
        .execute(pool).await?;
    if res.rows_affected() == 0 {
        warn!("Application id: {id} was reviewed concurrently");
        return Err(ApiError::conflict(format!("Application {id} is no longer pending")));
    }
    info!("Application rejected, nursery: {}, id: {id}", ctx.nursery_id);
    load_application(ctx.nursery_id, id, pool).await
}

#[post("/api/application/submit", data = "<req>")]
async fn post_application_submit(req: Json<SubmitApplication>, db: &State<DbPool>) -> ApiReply<ApplicationStatusView> {
    reply(submit_application(&req, &db.0).await?)
}

#[get("/api/application/status/<code>")]
async fn get_application_status(code: &str, db: &State<DbPool>) -> ApiReply<ApplicationStatusView> {
    reply(find_by_code(code, &db.0).await?.into())
}

#[get("/api/application/nursery/<nursery_id>")]
async fn get_application_nursery(nursery_id: NurseryId, db: &State<DbPool>) -> ApiReply<PublicNurseryInfo> {
    reply(public_nursery_info(nursery_id, &db.0).await?)
}

#[get("/api/applications?<status>")]
async fn get_applications(status: Option<&str>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ApplicationRecord>> {
    let status = status
        .map(|s| s.parse::<ApplicationStatus>().map_err(|e| ApiError::invalid("status", e)))
        .transpose()?;
    reply(list_applications(ctx.nursery_id, status, &db.0).await?)
}

#[get("/api/applications/<id>")]
async fn get_application(id: ApplicationId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ApplicationRecord> {
    reply(load_application(ctx.nursery_id, id, &db.0).await?)
}

#[post("/api/applications/<id>/accept", data = "<req>")]
async fn post_application_accept(id: ApplicationId, req: Json<AcceptApplication>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AcceptResult> {
    reply(accept_application(&ctx, id, &req, &db.0).await?)
}

#[post("/api/applications/<id>/reject", data = "<req>")]
async fn post_application_reject(id: ApplicationId, req: Json<RejectApplication>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ApplicationRecord> {
    reply(reject_application(&ctx, id, &req, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_application_submit,
            get_application_status,
            get_application_nursery,
            get_applications,
            get_application,
            post_application_accept,
            post_application_reject,
        ])
}
