use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::attendance::{find_attendance, AttendanceRecord, AttendanceStatus};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::{load_child, ChildId};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::{dates, text_enum};

text_enum! {
    pub enum Movement {
        Entry => "entry",
        Exit => "exit",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EntryExitRecord {
    pub id: i64,
    pub nursery_id: NurseryId,
    pub child_id: ChildId,
    pub kind: Movement,
    pub logged_at: DateTime<Utc>,
    pub log_date: NaiveDate,
    pub logged_by: StaffId,
    pub guardian_name: String,
    pub notes: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RecordMovement {
    pub child_id: ChildId,
    pub kind: Movement,
    /// Wall-clock `HH:MM`, defaults to the local time now.
    pub time: Option<String>,
    #[serde(default)]
    pub guardian_name: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MovementResult {
    pub log: EntryExitRecord,
    pub attendance: AttendanceRecord,
}

/// Logs the gate event and folds it into today's attendance in one transaction.
/// An entry marks the child present unless they are already recorded tardy, the first arrival time wins.
pub async fn record_movement(ctx: &RequestContext, req: &RecordMovement, pool: &SqlitePool) -> ApiResult<MovementResult> {
    Validator::new()
        .max_len("guardianName", &req.guardian_name, 100)
        .max_len("notes", &req.notes, 500)
        .finish()?;
    let time = match &req.time {
        Some(t) => dates::parse_time("time", t)?,
        None => chrono::Local::now().format("%H:%M").to_string(),
    };
    let child = load_child(ctx.nursery_id, req.child_id, pool).await?;
    if !child.is_active {
        return Err(ApiError::conflict(format!("Child {} is withdrawn", child.id)));
    }
    let today = dates::today();
    let now = dates::now();
    let mut tx = pool.begin().await?;
    let log_id: (i64,) = sqlx::query_as("INSERT INTO entry_exit_logs
            (nursery_id, child_id, kind, logged_at, log_date, logged_by, guardian_name, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(ctx.nursery_id)
        .bind(req.child_id)
        .bind(req.kind)
        .bind(now)
        .bind(today)
        .bind(ctx.staff_id)
        .bind(req.guardian_name.trim())
        .bind(&req.notes)
        .fetch_one(&mut *tx).await?;
    let upsert = match req.kind {
        Movement::Entry => "INSERT INTO daily_attendance
                (nursery_id, child_id, attendance_date, status, arrival_time, recorded_by, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (nursery_id, child_id, attendance_date) DO UPDATE SET
                status=CASE WHEN daily_attendance.status='tardy' THEN 'tardy' ELSE excluded.status END,
                arrival_time=COALESCE(daily_attendance.arrival_time, excluded.arrival_time),
                recorded_by=excluded.recorded_by, updated_at=excluded.updated_at",
        Movement::Exit => "INSERT INTO daily_attendance
                (nursery_id, child_id, attendance_date, status, departure_time, recorded_by, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (nursery_id, child_id, attendance_date) DO UPDATE SET
                departure_time=excluded.departure_time,
                recorded_by=excluded.recorded_by, updated_at=excluded.updated_at",
    };
    sqlx::query(upsert)
        .bind(ctx.nursery_id)
        .bind(req.child_id)
        .bind(today)
        .bind(AttendanceStatus::Present)
        .bind(&time)
        .bind(ctx.staff_id)
        .bind(now)
        .execute(&mut *tx).await?;
    let log: EntryExitRecord = sqlx::query_as("SELECT * FROM entry_exit_logs WHERE id=?")
        .bind(log_id.0)
        .fetch_one(&mut *tx).await?;
    let attendance = find_attendance(ctx.nursery_id, req.child_id, today, &mut tx).await?
        .ok_or_else(|| ApiError::not_found("Attendance record"))?;
    tx.commit().await?;
    info!("Child {}: {}, nursery: {}, at {time}", req.child_id, req.kind, ctx.nursery_id);
    Ok(MovementResult { log, attendance })
}

pub async fn list_movements(nursery_id: NurseryId, date: Option<NaiveDate>, child_id: Option<ChildId>, pool: &SqlitePool) -> ApiResult<Vec<EntryExitRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM entry_exit_logs WHERE nursery_id=");
    builder.push_bind(nursery_id);
    if let Some(date) = date {
        builder.push(" AND log_date=").push_bind(date);
    }
    if let Some(child_id) = child_id {
        builder.push(" AND child_id=").push_bind(child_id);
    }
    builder.push(" ORDER BY logged_at, id");
    let logs = builder.build_query_as::<EntryExitRecord>().fetch_all(pool).await?;
    Ok(logs)
}

#[post("/api/entry-exit", data = "<req>")]
async fn post_entry_exit(req: Json<RecordMovement>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<MovementResult> {
    reply(record_movement(&ctx, &req, &db.0).await?)
}

#[get("/api/entry-exit?<date>&<child_id>")]
async fn get_entry_exit(date: Option<&str>, child_id: Option<ChildId>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<EntryExitRecord>> {
    let date = dates::parse_optional_date("date", date)?;
    reply(list_movements(ctx.nursery_id, date, child_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_entry_exit,
            get_entry_exit,
        ])
}
