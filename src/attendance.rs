use std::collections::HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use log::info;
use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use crate::academic_years::{load_year, year_containing, Year};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::ChildId;
use crate::dates::{self, DateRange};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::text_enum;
use crate::util::percentage;

text_enum! {
    pub enum AttendanceStatus {
        Present => "present",
        Absent => "absent",
        Tardy => "tardy",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub nursery_id: NurseryId,
    pub child_id: ChildId,
    pub child_name: String,
    pub attendance_date: NaiveDate,
    pub status: AttendanceStatus,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    pub notes: String,
    pub recorded_by: StaffId,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpsertAttendance {
    pub status: AttendanceStatus,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BulkAttendanceItem {
    pub child_id: ChildId,
    #[serde(flatten)]
    pub record: UpsertAttendance,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BulkAttendance {
    pub date: String,
    pub records: Vec<BulkAttendanceItem>,
}

/// Day counts and the attendance rate derived from them. Tardy days count as attended.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub total_days: i64,
    pub present_days: i64,
    pub present: i64,
    pub absent: i64,
    pub tardy: i64,
    pub rate: Option<f64>,
}

impl AttendanceCounts {
    pub fn new(present: i64, absent: i64, tardy: i64) -> Self {
        let total_days = present + absent + tardy;
        let present_days = present + tardy;
        Self {
            total_days,
            present_days,
            present,
            absent,
            tardy,
            rate: percentage(present_days, total_days),
        }
    }
    fn add(&self, other: &AttendanceCounts) -> Self {
        Self::new(self.present + other.present, self.absent + other.absent, self.tardy + other.tardy)
    }
}

#[derive(FromRow, Debug)]
struct CountsRow {
    key: String,
    present: i64,
    absent: i64,
    tardy: i64,
}

impl From<&CountsRow> for AttendanceCounts {
    fn from(r: &CountsRow) -> Self {
        AttendanceCounts::new(r.present, r.absent, r.tardy)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChildAttendanceStats {
    pub child_id: ChildId,
    pub child_name: String,
    #[serde(flatten)]
    pub counts: AttendanceCounts,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChildStatsReport {
    pub child_id: ChildId,
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(flatten)]
    pub counts: AttendanceCounts,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatsReport {
    pub class_id: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub totals: AttendanceCounts,
    pub children: Vec<ChildAttendanceStats>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MonthSummary {
    pub month: String,
    #[serde(flatten)]
    pub counts: AttendanceCounts,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct YearlyStatsReport {
    pub year: Year,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub totals: AttendanceCounts,
    pub months: Vec<MonthSummary>,
}

const SELECT_ATTENDANCE: &str = "SELECT a.nursery_id, a.child_id, c.name AS child_name, a.attendance_date, a.status,
        a.arrival_time, a.departure_time, a.notes, a.recorded_by, a.updated_at
        FROM daily_attendance a JOIN children c ON c.id = a.child_id";

const COUNT_COLUMNS: &str = "COALESCE(SUM(status='present'), 0) AS present,
        COALESCE(SUM(status='absent'), 0) AS absent,
        COALESCE(SUM(status='tardy'), 0) AS tardy";

/// Restricts `c.id` to the children placed in `class_id` for the academic year containing `date`,
/// or to current placements when no year covers the date.
async fn push_class_filter(builder: &mut QueryBuilder<'_, Sqlite>, nursery_id: NurseryId, class_id: &str, date: NaiveDate, pool: &SqlitePool) -> ApiResult<()> {
    let year = year_containing(nursery_id, date, pool).await?;
    builder.push(" AND c.id IN (SELECT child_id FROM child_class_assignments WHERE is_active=1 AND nursery_id=");
    builder.push_bind(nursery_id);
    builder.push(" AND class_id=");
    builder.push_bind(class_id.to_string());
    match year {
        Some(year) => {
            builder.push(" AND academic_year=");
            builder.push_bind(year.year);
        }
        None => {
            builder.push(" AND is_current=1");
        }
    }
    builder.push(")");
    Ok(())
}

pub(crate) async fn find_attendance(nursery_id: NurseryId, child_id: ChildId, date: NaiveDate, conn: &mut SqliteConnection) -> ApiResult<Option<AttendanceRecord>> {
    let rec = sqlx::query_as(&format!("{SELECT_ATTENDANCE} WHERE a.nursery_id=? AND a.child_id=? AND a.attendance_date=?"))
        .bind(nursery_id)
        .bind(child_id)
        .bind(date)
        .fetch_optional(&mut *conn).await?;
    Ok(rec)
}

pub async fn list_attendance(nursery_id: NurseryId, date: NaiveDate, class_id: Option<&str>, pool: &SqlitePool) -> ApiResult<Vec<AttendanceRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_ATTENDANCE);
    builder.push(" WHERE a.nursery_id=").push_bind(nursery_id);
    builder.push(" AND a.attendance_date=").push_bind(date);
    if let Some(class_id) = class_id {
        push_class_filter(&mut builder, nursery_id, class_id, date, pool).await?;
    }
    builder.push(" ORDER BY c.name");
    let records = builder.build_query_as::<AttendanceRecord>().fetch_all(pool).await?;
    Ok(records)
}

fn validate_upsert(req: &UpsertAttendance) -> ApiResult<(Option<String>, Option<String>)> {
    Validator::new()
        .max_len("notes", &req.notes, 500)
        .check(req.status != AttendanceStatus::Absent || req.arrival_time.is_none(), "arrivalTime", "must be empty for an absent child")
        .finish()?;
    let arrival = req.arrival_time.as_deref().map(|t| dates::parse_time("arrivalTime", t)).transpose()?;
    let departure = req.departure_time.as_deref().map(|t| dates::parse_time("departureTime", t)).transpose()?;
    if let (Some(a), Some(d)) = (&arrival, &departure) {
        if d < a {
            return Err(ApiError::invalid("departureTime", "must not be before arrivalTime"));
        }
    }
    Ok((arrival, departure))
}

pub(crate) async fn upsert_attendance_in(nursery_id: NurseryId, child_id: ChildId, date: NaiveDate, req: &UpsertAttendance, recorded_by: StaffId, conn: &mut SqliteConnection) -> ApiResult<AttendanceRecord> {
    let (arrival, departure) = validate_upsert(req)?;
    if date > dates::today() {
        return Err(ApiError::invalid("date", "must not be in the future"));
    }
    let known: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM children WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(child_id)
        .fetch_one(&mut *conn).await?;
    if known.0 == 0 {
        return Err(ApiError::not_found(format!("Child {child_id}")));
    }
    sqlx::query("INSERT INTO daily_attendance
            (nursery_id, child_id, attendance_date, status, arrival_time, departure_time, notes, recorded_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (nursery_id, child_id, attendance_date) DO UPDATE SET
            status=excluded.status, arrival_time=excluded.arrival_time, departure_time=excluded.departure_time,
            notes=excluded.notes, recorded_by=excluded.recorded_by, updated_at=excluded.updated_at")
        .bind(nursery_id)
        .bind(child_id)
        .bind(date)
        .bind(req.status)
        .bind(arrival)
        .bind(departure)
        .bind(&req.notes)
        .bind(recorded_by)
        .bind(dates::now())
        .execute(&mut *conn).await?;
    find_attendance(nursery_id, child_id, date, conn).await?
        .ok_or_else(|| ApiError::not_found("Attendance record"))
}

pub async fn upsert_attendance(ctx: &RequestContext, child_id: ChildId, date: NaiveDate, req: &UpsertAttendance, pool: &SqlitePool) -> ApiResult<AttendanceRecord> {
    let mut conn = pool.acquire().await?;
    upsert_attendance_in(ctx.nursery_id, child_id, date, req, ctx.staff_id, &mut conn).await
}

pub async fn bulk_upsert_attendance(ctx: &RequestContext, req: &BulkAttendance, pool: &SqlitePool) -> ApiResult<Vec<AttendanceRecord>> {
    let date = dates::parse_date("date", &req.date)?;
    if let Some(dup) = req.records.iter().map(|r| r.child_id).duplicates().next() {
        return Err(ApiError::invalid("records", format!("child {dup} is listed more than once")));
    }
    let mut tx = pool.begin().await?;
    let mut ret = Vec::with_capacity(req.records.len());
    for item in &req.records {
        ret.push(upsert_attendance_in(ctx.nursery_id, item.child_id, date, &item.record, ctx.staff_id, &mut tx).await?);
    }
    tx.commit().await?;
    info!("Attendance recorded, nursery: {}, date: {date}, records: {}", ctx.nursery_id, ret.len());
    Ok(ret)
}

async fn counts_by_child(nursery_id: NurseryId, range: &DateRange, pool: &SqlitePool) -> ApiResult<HashMap<ChildId, AttendanceCounts>> {
    let rows: Vec<CountsRow> = sqlx::query_as(&format!("SELECT CAST(child_id AS TEXT) AS key, {COUNT_COLUMNS}
            FROM daily_attendance WHERE nursery_id=? AND attendance_date BETWEEN ? AND ?
            GROUP BY child_id"))
        .bind(nursery_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(pool).await?;
    Ok(rows.iter()
        .filter_map(|r| r.key.parse::<ChildId>().ok().map(|id| (id, AttendanceCounts::from(r))))
        .collect())
}

/// Children a group report covers: the class roster for the year containing `date`, or every active child.
async fn roster(nursery_id: NurseryId, class_id: Option<&str>, date: NaiveDate, pool: &SqlitePool) -> ApiResult<Vec<(ChildId, String)>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT c.id, c.name FROM children c WHERE c.nursery_id=");
    builder.push_bind(nursery_id);
    match class_id {
        Some(class_id) => push_class_filter(&mut builder, nursery_id, class_id, date, pool).await?,
        None => {
            builder.push(" AND c.is_active=1");
        }
    }
    builder.push(" ORDER BY c.name");
    let children = builder.build_query_as::<(ChildId, String)>().fetch_all(pool).await?;
    Ok(children)
}

pub async fn child_stats(nursery_id: NurseryId, child_id: ChildId, range: DateRange, pool: &SqlitePool) -> ApiResult<ChildStatsReport> {
    crate::children::load_child(nursery_id, child_id, pool).await?;
    let row: CountsRow = sqlx::query_as(&format!("SELECT '' AS key, {COUNT_COLUMNS}
            FROM daily_attendance WHERE nursery_id=? AND child_id=? AND attendance_date BETWEEN ? AND ?"))
        .bind(nursery_id)
        .bind(child_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_one(pool).await?;
    Ok(ChildStatsReport {
        child_id,
        from: range.from,
        to: range.to,
        counts: AttendanceCounts::from(&row),
    })
}

pub async fn group_stats(nursery_id: NurseryId, class_id: Option<&str>, range: DateRange, pool: &SqlitePool) -> ApiResult<GroupStatsReport> {
    if let Some(class_id) = class_id {
        crate::classes::load_class(nursery_id, class_id, pool).await?;
    }
    let children = roster(nursery_id, class_id, range.from, pool).await?;
    let mut counts = counts_by_child(nursery_id, &range, pool).await?;
    let children = children.into_iter()
        .map(|(child_id, child_name)| ChildAttendanceStats {
            counts: counts.remove(&child_id).unwrap_or_default(),
            child_id,
            child_name,
        })
        .collect::<Vec<_>>();
    let totals = children.iter().fold(AttendanceCounts::default(), |acc, c| acc.add(&c.counts));
    Ok(GroupStatsReport {
        class_id: class_id.map(str::to_string),
        from: range.from,
        to: range.to,
        totals,
        children,
    })
}

pub async fn yearly_stats(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<YearlyStatsReport> {
    let rec = load_year(nursery_id, year, pool).await?;
    let range = DateRange { from: rec.start_date, to: rec.end_date };
    let rows: Vec<CountsRow> = sqlx::query_as(&format!("SELECT substr(attendance_date, 1, 7) AS key, {COUNT_COLUMNS}
            FROM daily_attendance WHERE nursery_id=? AND attendance_date BETWEEN ? AND ?
            GROUP BY key"))
        .bind(nursery_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(pool).await?;
    let by_month = rows.iter().map(|r| (r.key.as_str(), AttendanceCounts::from(r))).collect::<HashMap<_, _>>();
    let months = range.months().iter()
        .map(|m| {
            let month = m.from.format("%Y-%m").to_string();
            MonthSummary {
                counts: by_month.get(month.as_str()).cloned().unwrap_or_else(|| AttendanceCounts::new(0, 0, 0)),
                month,
            }
        })
        .collect::<Vec<_>>();
    let totals = months.iter().fold(AttendanceCounts::default(), |acc, m| acc.add(&m.counts));
    Ok(YearlyStatsReport { year, from: range.from, to: range.to, totals, months })
}

#[derive(Serialize)]
struct CsvRow<'a> {
    date: NaiveDate,
    child_id: ChildId,
    child_name: &'a str,
    status: &'static str,
    arrival_time: &'a str,
    departure_time: &'a str,
    notes: &'a str,
}

pub async fn export_csv(nursery_id: NurseryId, range: DateRange, pool: &SqlitePool) -> ApiResult<Vec<u8>> {
    let records: Vec<AttendanceRecord> = sqlx::query_as(&format!("{SELECT_ATTENDANCE}
            WHERE a.nursery_id=? AND a.attendance_date BETWEEN ? AND ?
            ORDER BY a.attendance_date, c.name"))
        .bind(nursery_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(pool).await?;
    let mut wr = csv::Writer::from_writer(vec![]);
    for r in &records {
        wr.serialize(CsvRow {
            date: r.attendance_date,
            child_id: r.child_id,
            child_name: &r.child_name,
            status: r.status.as_str(),
            arrival_time: r.arrival_time.as_deref().unwrap_or_default(),
            departure_time: r.departure_time.as_deref().unwrap_or_default(),
            notes: &r.notes,
        }).map_err(|e| anyhow::anyhow!("CSV export failed: {e}"))?;
    }
    let data = wr.into_inner().map_err(|e| anyhow::anyhow!("CSV export failed: {e}"))?;
    info!("Attendance exported, nursery: {nursery_id}, {} - {}, rows: {}", range.from, range.to, records.len());
    Ok(data)
}

#[get("/api/attendance?<date>&<class_id>")]
async fn get_attendance(date: &str, class_id: Option<&str>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<AttendanceRecord>> {
    let date = dates::parse_date("date", date)?;
    reply(list_attendance(ctx.nursery_id, date, class_id, &db.0).await?)
}

#[put("/api/attendance/<child_id>/<date>", data = "<req>")]
async fn put_attendance(child_id: ChildId, date: &str, req: Json<UpsertAttendance>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AttendanceRecord> {
    let date = dates::parse_date("date", date)?;
    reply(upsert_attendance(&ctx, child_id, date, &req, &db.0).await?)
}

#[post("/api/attendance/bulk", data = "<req>")]
async fn post_attendance_bulk(req: Json<BulkAttendance>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<AttendanceRecord>> {
    reply(bulk_upsert_attendance(&ctx, &req, &db.0).await?)
}

#[get("/api/attendance/stats/child/<child_id>?<from>&<to>")]
async fn get_child_stats(child_id: ChildId, from: &str, to: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ChildStatsReport> {
    reply(child_stats(ctx.nursery_id, child_id, DateRange::parse(from, to)?, &db.0).await?)
}

#[get("/api/attendance/stats/class/<class_id>?<from>&<to>")]
async fn get_class_stats(class_id: &str, from: &str, to: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<GroupStatsReport> {
    reply(group_stats(ctx.nursery_id, Some(class_id), DateRange::parse(from, to)?, &db.0).await?)
}

#[get("/api/attendance/stats/monthly?<month>&<class_id>")]
async fn get_monthly_stats(month: &str, class_id: Option<&str>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<GroupStatsReport> {
    let range = dates::parse_month("month", month)?;
    reply(group_stats(ctx.nursery_id, class_id, range, &db.0).await?)
}

#[get("/api/attendance/stats/yearly?<year>")]
async fn get_yearly_stats(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<YearlyStatsReport> {
    reply(yearly_stats(ctx.nursery_id, year, &db.0).await?)
}

#[get("/api/attendance/export?<from>&<to>")]
async fn get_attendance_export(from: &str, to: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiResult<(ContentType, Vec<u8>)> {
    let data = export_csv(ctx.nursery_id, DateRange::parse(from, to)?, &db.0).await?;
    Ok((ContentType::CSV, data))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_attendance,
            put_attendance,
            post_attendance_bulk,
            get_child_stats,
            get_class_stats,
            get_monthly_stats,
            get_yearly_stats,
            get_attendance_export,
        ])
}

#[test]
fn test_attendance_rate() {
    let c = AttendanceCounts::new(17, 2, 1);
    assert_eq!(c.total_days, 20);
    assert_eq!(c.present_days, 18);
    assert_eq!(c.rate, Some(90.0));
    let c = AttendanceCounts::new(1, 2, 0);
    assert_eq!(c.rate, Some(33.3));
    let c = AttendanceCounts::new(0, 0, 0);
    assert_eq!(c.total_days, 0);
    assert_eq!(c.rate, None);
    assert_eq!(AttendanceCounts::default().add(&AttendanceCounts::new(1, 1, 0)).rate, Some(50.0));
}
