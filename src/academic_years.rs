use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::{NurseryId, RequestContext};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::dates;

pub type Year = i32;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYearRecord {
    pub nursery_id: NurseryId,
    pub year: Year,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub is_future: bool,
    pub is_archived: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AcademicYearRecord {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
    /// Rejects writes to placements of years that are already history.
    pub fn ensure_writable(&self) -> ApiResult<()> {
        if self.is_archived {
            Err(ApiError::conflict(format!("Academic year {} is archived", self.year)))
        } else {
            Ok(())
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateAcademicYear {
    pub year: Year,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAcademicYear {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub notes: Option<String>,
}

pub async fn find_year(nursery_id: NurseryId, year: Year, conn: &mut SqliteConnection) -> ApiResult<Option<AcademicYearRecord>> {
    let rec = sqlx::query_as("SELECT * FROM academic_years WHERE nursery_id=? AND year=?")
        .bind(nursery_id)
        .bind(year)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(rec)
}

pub async fn find_current_year(nursery_id: NurseryId, conn: &mut SqliteConnection) -> ApiResult<Option<AcademicYearRecord>> {
    let rec = sqlx::query_as("SELECT * FROM academic_years WHERE nursery_id=? AND is_current=1")
        .bind(nursery_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(rec)
}

pub async fn load_year(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<AcademicYearRecord> {
    let mut conn = pool.acquire().await?;
    find_year(nursery_id, year, &mut conn).await?
        .ok_or_else(|| ApiError::not_found(format!("Academic year {year}")))
}

pub async fn load_current_year(nursery_id: NurseryId, pool: &SqlitePool) -> ApiResult<AcademicYearRecord> {
    let mut conn = pool.acquire().await?;
    find_current_year(nursery_id, &mut conn).await?
        .ok_or_else(|| ApiError::not_found("Current academic year"))
}

/// The academic year whose date range contains `date`, if any.
pub async fn year_containing(nursery_id: NurseryId, date: NaiveDate, pool: &SqlitePool) -> ApiResult<Option<AcademicYearRecord>> {
    let rec = sqlx::query_as("SELECT * FROM academic_years WHERE nursery_id=? AND start_date<=? AND end_date>=? ORDER BY year DESC LIMIT 1")
        .bind(nursery_id)
        .bind(date)
        .bind(date)
        .fetch_optional(pool)
        .await?;
    Ok(rec)
}

pub async fn list_years(nursery_id: NurseryId, pool: &SqlitePool) -> ApiResult<Vec<AcademicYearRecord>> {
    let years = sqlx::query_as("SELECT * FROM academic_years WHERE nursery_id=? ORDER BY year")
        .bind(nursery_id)
        .fetch_all(pool)
        .await?;
    Ok(years)
}

pub(crate) async fn insert_year(nursery_id: NurseryId, year: Year, start_date: NaiveDate, end_date: NaiveDate, notes: &str, flags: (bool, bool, bool), conn: &mut SqliteConnection) -> ApiResult<()> {
    let (is_current, is_future, is_archived) = flags;
    let now = dates::now();
    sqlx::query("INSERT INTO academic_years
            (nursery_id, year, start_date, end_date, is_current, is_future, is_archived, notes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(nursery_id)
        .bind(year)
        .bind(start_date)
        .bind(end_date)
        .bind(is_current)
        .bind(is_future)
        .bind(is_archived)
        .bind(notes)
        .bind(now)
        .bind(now)
        .execute(&mut *conn).await?;
    Ok(())
}

/// The first year of a nursery becomes current; later ones are staged as future,
/// earlier ones are recorded as archived history.
pub async fn create_year(nursery_id: NurseryId, req: &CreateAcademicYear, pool: &SqlitePool) -> ApiResult<AcademicYearRecord> {
    Validator::new()
        .check((2000..=2100).contains(&req.year), "year", "must be between 2000 and 2100")
        .max_len("notes", &req.notes, 1000)
        .finish()?;
    let (default_start, default_end) = dates::default_year_bounds(req.year);
    let start_date = dates::parse_optional_date("startDate", req.start_date.as_deref())?.unwrap_or(default_start);
    let end_date = dates::parse_optional_date("endDate", req.end_date.as_deref())?.unwrap_or(default_end);
    if start_date >= end_date {
        return Err(ApiError::invalid("endDate", "must be after startDate"));
    }
    let mut tx = pool.begin().await?;
    if find_year(nursery_id, req.year, &mut tx).await?.is_some() {
        return Err(ApiError::conflict(format!("Academic year {} already exists", req.year)));
    }
    let flags = match find_current_year(nursery_id, &mut tx).await? {
        None => (true, false, false),
        Some(current) if req.year > current.year => (false, true, false),
        Some(_) => (false, false, true),
    };
    insert_year(nursery_id, req.year, start_date, end_date, &req.notes, flags, &mut tx).await?;
    tx.commit().await?;
    info!("Academic year created, nursery: {nursery_id}, year: {}, current: {}", req.year, flags.0);
    load_year(nursery_id, req.year, pool).await
}

pub async fn update_year(nursery_id: NurseryId, year: Year, req: &UpdateAcademicYear, pool: &SqlitePool) -> ApiResult<AcademicYearRecord> {
    let rec = load_year(nursery_id, year, pool).await?;
    rec.ensure_writable()?;
    let start_date = dates::parse_optional_date("startDate", req.start_date.as_deref())?.unwrap_or(rec.start_date);
    let end_date = dates::parse_optional_date("endDate", req.end_date.as_deref())?.unwrap_or(rec.end_date);
    let notes = req.notes.clone().unwrap_or(rec.notes);
    Validator::new()
        .check(start_date < end_date, "endDate", "must be after startDate")
        .max_len("notes", &notes, 1000)
        .finish()?;
    sqlx::query("UPDATE academic_years SET start_date=?, end_date=?, notes=?, updated_at=? WHERE nursery_id=? AND year=?")
        .bind(start_date)
        .bind(end_date)
        .bind(&notes)
        .bind(dates::now())
        .bind(nursery_id)
        .bind(year)
        .execute(pool).await?;
    load_year(nursery_id, year, pool).await
}

/// Only future years nobody has been placed into yet can be dropped.
pub async fn delete_year(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<()> {
    let rec = load_year(nursery_id, year, pool).await?;
    if !rec.is_future {
        return Err(ApiError::conflict(format!("Academic year {year} is not a future year")));
    }
    let placements: (i64,) = sqlx::query_as("SELECT
            (SELECT COUNT(*) FROM child_class_assignments WHERE nursery_id=? AND academic_year=?)
          + (SELECT COUNT(*) FROM staff_class_assignments WHERE nursery_id=? AND academic_year=?)")
        .bind(nursery_id)
        .bind(year)
        .bind(nursery_id)
        .bind(year)
        .fetch_one(pool).await?;
    if placements.0 > 0 {
        return Err(ApiError::conflict(format!("Academic year {year} already has {} class assignments", placements.0)));
    }
    sqlx::query("DELETE FROM academic_years WHERE nursery_id=? AND year=?")
        .bind(nursery_id)
        .bind(year)
        .execute(pool).await?;
    info!("Academic year deleted, nursery: {nursery_id}, year: {year}");
    Ok(())
}

#[get("/api/academic-years")]
async fn get_years(ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<AcademicYearRecord>> {
    reply(list_years(ctx.nursery_id, &db.0).await?)
}

#[get("/api/academic-years/current")]
async fn get_current_year(ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AcademicYearRecord> {
    reply(load_current_year(ctx.nursery_id, &db.0).await?)
}

#[get("/api/academic-years/<year>")]
async fn get_year(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AcademicYearRecord> {
    reply(load_year(ctx.nursery_id, year, &db.0).await?)
}

#[post("/api/academic-years", data = "<req>")]
async fn post_year(req: Json<CreateAcademicYear>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AcademicYearRecord> {
    ctx.require_admin()?;
    reply(create_year(ctx.nursery_id, &req, &db.0).await?)
}

#[put("/api/academic-years/<year>", data = "<req>")]
async fn put_year(year: Year, req: Json<UpdateAcademicYear>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AcademicYearRecord> {
    ctx.require_admin()?;
    reply(update_year(ctx.nursery_id, year, &req, &db.0).await?)
}

#[delete("/api/academic-years/<year>")]
async fn delete_year_route(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    ctx.require_admin()?;
    reply(delete_year(ctx.nursery_id, year, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_years,
            get_current_year,
            get_year,
            post_year,
            put_year,
            delete_year_route,
        ])
}
