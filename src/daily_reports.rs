use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use nurseryd_macros::ChangedFields;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::{load_child, ChildId};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::{dates, text_enum};

pub type ReportId = i64;

text_enum! {
    pub enum ReportStatus {
        Draft => "draft",
        Published => "published",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DailyReportRecord {
    pub id: ReportId,
    pub nursery_id: NurseryId,
    pub child_id: ChildId,
    pub report_date: NaiveDate,
    pub staff_id: StaffId,
    pub mood: String,
    pub meal: String,
    pub nap: String,
    pub content: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateDailyReport {
    pub child_id: ChildId,
    pub report_date: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub meal: String,
    #[serde(default)]
    pub nap: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize, ChangedFields, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDailyReport {
    pub mood: Option<String>,
    pub meal: Option<String>,
    pub nap: Option<String>,
    pub content: Option<String>,
}

const MAX_CONTENT_LEN: usize = 4000;

pub async fn load_report(nursery_id: NurseryId, report_id: ReportId, pool: &SqlitePool) -> ApiResult<DailyReportRecord> {
    sqlx::query_as("SELECT * FROM daily_reports WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(report_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Daily report {report_id}")))
}

pub async fn list_reports(nursery_id: NurseryId, date: Option<NaiveDate>, child_id: Option<ChildId>, pool: &SqlitePool) -> ApiResult<Vec<DailyReportRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM daily_reports WHERE nursery_id=");
    builder.push_bind(nursery_id);
    if let Some(date) = date {
        builder.push(" AND report_date=").push_bind(date);
    }
    if let Some(child_id) = child_id {
        builder.push(" AND child_id=").push_bind(child_id);
    }
    builder.push(" ORDER BY report_date DESC, id");
    let reports = builder.build_query_as::<DailyReportRecord>().fetch_all(pool).await?;
    Ok(reports)
}

pub async fn create_report(ctx: &RequestContext, req: &CreateDailyReport, pool: &SqlitePool) -> ApiResult<DailyReportRecord> {
    Validator::new()
        .max_len("mood", &req.mood, 100)
        .max_len("meal", &req.meal, 500)
        .max_len("nap", &req.nap, 500)
        .max_len("content", &req.content, MAX_CONTENT_LEN)
        .finish()?;
    let report_date = dates::parse_date("reportDate", &req.report_date)?;
    load_child(ctx.nursery_id, req.child_id, pool).await?;
    let now = dates::now();
    let id: (i64,) = sqlx::query_as("INSERT INTO daily_reports
            (nursery_id, child_id, report_date, staff_id, mood, meal, nap, content, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(ctx.nursery_id)
        .bind(req.child_id)
        .bind(report_date)
        .bind(ctx.staff_id)
        .bind(&req.mood)
        .bind(&req.meal)
        .bind(&req.nap)
        .bind(&req.content)
        .bind(ReportStatus::Draft)
        .bind(now)
        .bind(now)
        .fetch_one(pool).await?;
    info!("Daily report created, nursery: {}, id: {}, child: {}", ctx.nursery_id, id.0, req.child_id);
    load_report(ctx.nursery_id, id.0, pool).await
}

pub async fn update_report(nursery_id: NurseryId, report_id: ReportId, req: &UpdateDailyReport, pool: &SqlitePool) -> ApiResult<DailyReportRecord> {
    let mut v = Validator::new();
    v.check(!req.changed_fields().is_empty(), "body", "nothing to update");
    if let Some(content) = &req.content {
        v.max_len("content", content, MAX_CONTENT_LEN);
    }
    v.finish()?;
    load_report(nursery_id, report_id, pool).await?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE daily_reports SET ");
    req.push_assignments(&mut builder);
    builder.push(", updated_at=").push_bind(dates::now());
    builder.push(" WHERE nursery_id=").push_bind(nursery_id);
    builder.push(" AND id=").push_bind(report_id);
    builder.build().execute(pool).await?;
    load_report(nursery_id, report_id, pool).await
}

/// Parents may already have read a published report, only drafts can be dropped.
pub async fn delete_report(nursery_id: NurseryId, report_id: ReportId, pool: &SqlitePool) -> ApiResult<()> {
    let rec = load_report(nursery_id, report_id, pool).await?;
    if rec.status == ReportStatus::Published {
        return Err(ApiError::conflict(format!("Daily report {report_id} is already published")));
    }
    sqlx::query("DELETE FROM daily_reports WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(report_id)
        .execute(pool).await?;
    Ok(())
}

pub async fn publish_report(nursery_id: NurseryId, report_id: ReportId, pool: &SqlitePool) -> ApiResult<DailyReportRecord> {
    let rec = load_report(nursery_id, report_id, pool).await?;
    if rec.status == ReportStatus::Published {
        return Err(ApiError::conflict(format!("Daily report {report_id} is already published")));
    }
    sqlx::query("UPDATE daily_reports SET status=?, updated_at=? WHERE nursery_id=? AND id=?")
        .bind(ReportStatus::Published)
        .bind(dates::now())
        .bind(nursery_id)
        .bind(report_id)
        .execute(pool).await?;
    info!("Daily report published, nursery: {nursery_id}, id: {report_id}");
    load_report(nursery_id, report_id, pool).await
}

#[get("/api/daily-reports?<date>&<child_id>")]
async fn get_reports(date: Option<&str>, child_id: Option<ChildId>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<DailyReportRecord>> {
    let date = dates::parse_optional_date("date", date)?;
    reply(list_reports(ctx.nursery_id, date, child_id, &db.0).await?)
}

#[get("/api/daily-reports/<report_id>")]
async fn get_report(report_id: ReportId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<DailyReportRecord> {
    reply(load_report(ctx.nursery_id, report_id, &db.0).await?)
}

#[post("/api/daily-reports", data = "<req>")]
async fn post_report(req: Json<CreateDailyReport>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<DailyReportRecord> {
    reply(create_report(&ctx, &req, &db.0).await?)
}

#[put("/api/daily-reports/<report_id>", data = "<req>")]
async fn put_report(report_id: ReportId, req: Json<UpdateDailyReport>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<DailyReportRecord> {
    reply(update_report(ctx.nursery_id, report_id, &req, &db.0).await?)
}

#[delete("/api/daily-reports/<report_id>")]
async fn delete_report_route(report_id: ReportId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    reply(delete_report(ctx.nursery_id, report_id, &db.0).await?)
}

#[post("/api/daily-reports/<report_id>/publish")]
async fn post_report_publish(report_id: ReportId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<DailyReportRecord> {
    reply(publish_report(ctx.nursery_id, report_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_reports,
            get_report,
            post_report,
            put_report,
            delete_report_route,
            post_report_publish,
        ])
}
