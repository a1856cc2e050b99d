use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::academic_years::{find_year, AcademicYearRecord, Year};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::{ChildId, ChildRecord};
use crate::classes::{find_class, ClassRecord};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult};
use crate::staff::StaffRecord;
use crate::{dates, text_enum};

text_enum! {
    pub enum AssignmentRole {
        Main => "main",
        Assistant => "assistant",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildAssignmentRecord {
    pub academic_year: Year,
    pub nursery_id: NurseryId,
    pub child_id: ChildId,
    pub class_id: String,
    pub is_current: bool,
    pub is_future: bool,
    pub is_active: bool,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaffAssignmentRecord {
    pub academic_year: Year,
    pub nursery_id: NurseryId,
    pub staff_id: StaffId,
    pub class_id: String,
    pub role: AssignmentRole,
    pub is_current: bool,
    pub is_future: bool,
    pub is_active: bool,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignChildRequest {
    pub child_id: ChildId,
    pub class_id: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignChildren {
    pub assignments: Vec<AssignChildRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignStaffRequest {
    pub staff_id: StaffId,
    pub class_id: String,
    pub role: AssignmentRole,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignStaff {
    pub assignments: Vec<AssignStaffRequest>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassMember {
    #[serde(skip)]
    pub class_id: String,
    pub child_id: ChildId,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassWithChildren {
    pub class_id: String,
    pub name: String,
    pub max_capacity: i64,
    pub is_active: bool,
    pub child_count: usize,
    pub available: i64,
    pub children: Vec<ClassMember>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassTeacher {
    #[serde(skip)]
    pub class_id: String,
    pub staff_id: StaffId,
    pub name: String,
    pub role: AssignmentRole,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassWithStaff {
    pub class_id: String,
    pub name: String,
    pub is_active: bool,
    pub main: Option<ClassTeacher>,
    pub staff: Vec<ClassTeacher>,
}

async fn writable_year(nursery_id: NurseryId, year: Year, conn: &mut SqliteConnection) -> ApiResult<AcademicYearRecord> {
    let rec = find_year(nursery_id, year, conn).await?
        .ok_or_else(|| ApiError::not_found(format!("Academic year {year}")))?;
    rec.ensure_writable()?;
    Ok(rec)
}

async fn active_class(nursery_id: NurseryId, class_id: &str, conn: &mut SqliteConnection) -> ApiResult<ClassRecord> {
    let class = find_class(nursery_id, class_id, conn).await?;
    if !class.is_active {
        return Err(ApiError::NotFound(format!("Class {class_id} is inactive")));
    }
    Ok(class)
}

async fn year_classes(nursery_id: NurseryId, year: Year, table: &str, pool: &SqlitePool) -> ApiResult<Vec<ClassRecord>> {
    // inactive classes still show up while somebody sits in them
    let classes = sqlx::query_as(&format!("SELECT * FROM classes c WHERE c.nursery_id=? AND (c.is_active=1 OR EXISTS
            (SELECT 1 FROM {table} a WHERE a.nursery_id=c.nursery_id AND a.class_id=c.class_id AND a.academic_year=? AND a.is_active=1))
            ORDER BY c.age_group_min, c.class_id"))
        .bind(nursery_id)
        .bind(year)
        .fetch_all(pool).await?;
    Ok(classes)
}

async fn find_child_assignment(nursery_id: NurseryId, year: Year, child_id: ChildId, conn: &mut SqliteConnection) -> ApiResult<Option<ChildAssignmentRecord>> {
    let rec = sqlx::query_as("SELECT * FROM child_class_assignments WHERE nursery_id=? AND academic_year=? AND child_id=?")
        .bind(nursery_id)
        .bind(year)
        .bind(child_id)
        .fetch_optional(&mut *conn).await?;
    Ok(rec)
}

pub async fn list_classes_with_children(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<Vec<ClassWithChildren>> {
    let classes = year_classes(nursery_id, year, "child_class_assignments", pool).await?;
    let members: Vec<ClassMember> = sqlx::query_as("SELECT a.class_id, a.child_id, c.name, c.date_of_birth, a.assigned_at
            FROM child_class_assignments a JOIN children c ON c.id = a.child_id
            WHERE a.nursery_id=? AND a.academic_year=? AND a.is_active=1
            ORDER BY c.date_of_birth, c.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(pool).await?;
    let mut by_class = members.into_iter().into_group_map_by(|m| m.class_id.clone());
    Ok(classes.into_iter().map(|class| {
        let children = by_class.remove(&class.class_id).unwrap_or_default();
        ClassWithChildren {
            child_count: children.len(),
            available: class.max_capacity - children.len() as i64,
            class_id: class.class_id,
            name: class.name,
            max_capacity: class.max_capacity,
            is_active: class.is_active,
            children,
        }
    }).collect())
}

pub async fn list_unassigned_children(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<Vec<ChildRecord>> {
    let children = sqlx::query_as("SELECT c.* FROM children c
            WHERE c.nursery_id=? AND c.is_active=1 AND NOT EXISTS
            (SELECT 1 FROM child_class_assignments a
             WHERE a.nursery_id=c.nursery_id AND a.child_id=c.id AND a.academic_year=? AND a.is_active=1)
            ORDER BY c.date_of_birth, c.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(pool).await?;
    Ok(children)
}

/// Upsert keyed by year and child. Re-sending the current placement changes nothing,
/// re-activating a released placement in the same class keeps its original `assigned_at`.
async fn assign_child_in(nursery_id: NurseryId, year: &AcademicYearRecord, req: &AssignChildRequest, conn: &mut SqliteConnection) -> ApiResult<ChildAssignmentRecord> {
    let child_active: Option<(bool,)> = sqlx::query_as("SELECT is_active FROM children WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(req.child_id)
        .fetch_optional(&mut *conn).await?;
    if !child_active.is_some_and(|c| c.0) {
        return Err(ApiError::not_found(format!("Child {}", req.child_id)));
    }
    let class = active_class(nursery_id, &req.class_id, conn).await?;
    let existing = find_child_assignment(nursery_id, year.year, req.child_id, conn).await?;
    if let Some(rec) = existing.as_ref().filter(|r| r.is_active && r.class_id == req.class_id) {
        return Ok(rec.clone());
    }
    let occupied: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM child_class_assignments
            WHERE nursery_id=? AND academic_year=? AND class_id=? AND is_active=1 AND child_id<>?")
        .bind(nursery_id)
        .bind(year.year)
        .bind(&req.class_id)
        .bind(req.child_id)
        .fetch_one(&mut *conn).await?;
    if occupied.0 >= class.max_capacity {
        return Err(ApiError::conflict(format!("Class {} is full ({} of {})", class.class_id, occupied.0, class.max_capacity)));
    }
    let assigned_at = existing.as_ref()
        .filter(|r| r.class_id == req.class_id)
        .map(|r| r.assigned_at)
        .unwrap_or_else(dates::now);
    sqlx::query("INSERT INTO child_class_assignments
            (academic_year, nursery_id, child_id, class_id, is_current, is_future, is_active, assigned_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT (academic_year, nursery_id, child_id) DO UPDATE SET
            class_id=excluded.class_id, is_current=excluded.is_current, is_future=excluded.is_future,
            is_active=1, assigned_at=excluded.assigned_at")
        .bind(year.year)
        .bind(nursery_id)
        .bind(req.child_id)
        .bind(&req.class_id)
        .bind(year.is_current)
        .bind(year.is_future)
        .bind(assigned_at)
        .execute(&mut *conn).await?;
    info!("Child assigned, nursery: {nursery_id}, year: {}, child: {}, class: {}", year.year, req.child_id, req.class_id);
    find_child_assignment(nursery_id, year.year, req.child_id, conn).await?
        .ok_or_else(|| ApiError::not_found("Class assignment"))
}

pub async fn assign_child(nursery_id: NurseryId, year: Year, req: &AssignChildRequest, conn: &mut SqliteConnection) -> ApiResult<ChildAssignmentRecord> {
    let year = writable_year(nursery_id, year, conn).await?;
    assign_child_in(nursery_id, &year, req, conn).await
}

pub async fn bulk_assign_children(nursery_id: NurseryId, year: Year, req: &BulkAssignChildren, pool: &SqlitePool) -> ApiResult<Vec<ChildAssignmentRecord>> {
    if req.assignments.is_empty() {
        return Err(ApiError::invalid("assignments", "must not be empty"));
    }
    if let Some(dup) = req.assignments.iter().map(|a| a.child_id).duplicates().next() {
        return Err(ApiError::invalid("assignments", format!("child {dup} is listed more than once")));
    }
    let mut tx = pool.begin().await?;
    let year = writable_year(nursery_id, year, &mut tx).await?;
    let mut ret = Vec::with_capacity(req.assignments.len());
    for a in &req.assignments {
        ret.push(assign_child_in(nursery_id, &year, a, &mut tx).await?);
    }
    tx.commit().await?;
    Ok(ret)
}

/// Soft delete, the row stays so a later re-assignment can revive it.
pub async fn unassign_child(nursery_id: NurseryId, year: Year, child_id: ChildId, pool: &SqlitePool) -> ApiResult<()> {
    let mut conn = pool.acquire().await?;
    writable_year(nursery_id, year, &mut conn).await?;
    let res = sqlx::query("UPDATE child_class_assignments SET is_active=0
            WHERE nursery_id=? AND academic_year=? AND child_id=? AND is_active=1")
        .bind(nursery_id)
        .bind(year)
        .bind(child_id)
        .execute(&mut *conn).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Class assignment of child {child_id} in {year}")));
    }
    info!("Child unassigned, nursery: {nursery_id}, year: {year}, child: {child_id}");
    Ok(())
}

async fn find_staff_assignment(nursery_id: NurseryId, year: Year, staff_id: StaffId, class_id: &str, conn: &mut SqliteConnection) -> ApiResult<Option<StaffAssignmentRecord>> {
    let rec = sqlx::query_as("SELECT * FROM staff_class_assignments WHERE nursery_id=? AND academic_year=? AND staff_id=? AND class_id=?")
        .bind(nursery_id)
        .bind(year)
        .bind(staff_id)
        .bind(class_id)
        .fetch_optional(&mut *conn).await?;
    Ok(rec)
}

pub async fn list_classes_with_staff(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<Vec<ClassWithStaff>> {
    let classes = year_classes(nursery_id, year, "staff_class_assignments", pool).await?;
    let teachers: Vec<ClassTeacher> = sqlx::query_as("SELECT a.class_id, a.staff_id, s.name, a.role, a.assigned_at
            FROM staff_class_assignments a JOIN staff s ON s.id = a.staff_id
            WHERE a.nursery_id=? AND a.academic_year=? AND a.is_active=1
            ORDER BY a.role DESC, s.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(pool).await?;
    let mut by_class = teachers.into_iter().into_group_map_by(|t| t.class_id.clone());
    Ok(classes.into_iter().map(|class| {
        let staff = by_class.remove(&class.class_id).unwrap_or_default();
        ClassWithStaff {
            main: staff.iter().find(|t| t.role == AssignmentRole::Main).cloned(),
            class_id: class.class_id,
            name: class.name,
            is_active: class.is_active,
            staff,
        }
    }).collect())
}

pub async fn list_unassigned_staff(nursery_id: NurseryId, year: Year, pool: &SqlitePool) -> ApiResult<Vec<StaffRecord>> {
    let staff = sqlx::query_as("SELECT s.id, s.nursery_id, s.name, s.email, s.login_id, s.role, s.is_active,
            s.failed_login_count, s.locked_until, s.created_at
            FROM staff s
            WHERE s.nursery_id=? AND s.is_active=1 AND NOT EXISTS
            (SELECT 1 FROM staff_class_assignments a
             WHERE a.nursery_id=s.nursery_id AND a.staff_id=s.id AND a.academic_year=? AND a.is_active=1)
            ORDER BY s.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(pool).await?;
    Ok(staff)
}

async fn assign_staff_in(nursery_id: NurseryId, year: &AcademicYearRecord, req: &AssignStaffRequest, conn: &mut SqliteConnection) -> ApiResult<StaffAssignmentRecord> {
    let staff_active: Option<(bool,)> = sqlx::query_as("SELECT is_active FROM staff WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(req.staff_id)
        .fetch_optional(&mut *conn).await?;
    if !staff_active.is_some_and(|s| s.0) {
        return Err(ApiError::not_found(format!("Staff {}", req.staff_id)));
    }
    active_class(nursery_id, &req.class_id, conn).await?;
    let existing = find_staff_assignment(nursery_id, year.year, req.staff_id, &req.class_id, conn).await?;
    if let Some(rec) = existing.as_ref().filter(|r| r.is_active && r.role == req.role) {
        return Ok(rec.clone());
    }
    if req.role == AssignmentRole::Main {
        let other_main: Option<(StaffId,)> = sqlx::query_as("SELECT staff_id FROM staff_class_assignments
                WHERE nursery_id=? AND academic_year=? AND class_id=? AND role='main' AND is_active=1 AND staff_id<>?")
            .bind(nursery_id)
            .bind(year.year)
            .bind(&req.class_id)
            .bind(req.staff_id)
            .fetch_optional(&mut *conn).await?;
        if let Some((other,)) = other_main {
            return Err(ApiError::conflict(format!("Class {} already has main teacher {other} in {}", req.class_id, year.year)));
        }
    }
    let assigned_at = existing.as_ref().map(|r| r.assigned_at).unwrap_or_else(dates::now);
    sqlx::query("INSERT INTO staff_class_assignments
            (academic_year, nursery_id, staff_id, class_id, role, is_current, is_future, is_active, assigned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT (academic_year, nursery_id, staff_id, class_id) DO UPDATE SET
            role=excluded.role, is_current=excluded.is_current, is_future=excluded.is_future,
            is_active=1, assigned_at=excluded.assigned_at")
        .bind(year.year)
        .bind(nursery_id)
        .bind(req.staff_id)
        .bind(&req.class_id)
        .bind(req.role)
        .bind(year.is_current)
        .bind(year.is_future)
        .bind(assigned_at)
        .execute(&mut *conn).await?;
    info!("Staff assigned, nursery: {nursery_id}, year: {}, staff: {}, class: {}, role: {}", year.year, req.staff_id, req.class_id, req.role);
    find_staff_assignment(nursery_id, year.year, req.staff_id, &req.class_id, conn).await?
        .ok_or_else(|| ApiError::not_found("Staff class assignment"))
}

pub async fn assign_staff(nursery_id: NurseryId, year: Year, req: &AssignStaffRequest, pool: &SqlitePool) -> ApiResult<StaffAssignmentRecord> {
    let mut tx = pool.begin().await?;
    let year = writable_year(nursery_id, year, &mut tx).await?;
    let rec = assign_staff_in(nursery_id, &year, req, &mut tx).await?;
    tx.commit().await?;
    Ok(rec)
}

pub async fn bulk_assign_staff(nursery_id: NurseryId, year: Year, req: &BulkAssignStaff, pool: &SqlitePool) -> ApiResult<Vec<StaffAssignmentRecord>> {
    if req.assignments.is_empty() {
        return Err(ApiError::invalid("assignments", "must not be empty"));
    }
    if let Some((staff_id, class_id)) = req.assignments.iter().map(|a| (a.staff_id, a.class_id.as_str())).duplicates().next() {
        return Err(ApiError::invalid("assignments", format!("staff {staff_id} is listed more than once for class {class_id}")));
    }
    let mut tx = pool.begin().await?;
    let year = writable_year(nursery_id, year, &mut tx).await?;
    let mut ret = Vec::with_capacity(req.assignments.len());
    for a in &req.assignments {
        ret.push(assign_staff_in(nursery_id, &year, a, &mut tx).await?);
    }
    tx.commit().await?;
    Ok(ret)
}

pub async fn unassign_staff(nursery_id: NurseryId, year: Year, staff_id: StaffId, class_id: &str, pool: &SqlitePool) -> ApiResult<()> {
    let mut conn = pool.acquire().await?;
    writable_year(nursery_id, year, &mut conn).await?;
    let res = sqlx::query("UPDATE staff_class_assignments SET is_active=0
            WHERE nursery_id=? AND academic_year=? AND staff_id=? AND class_id=? AND is_active=1")
        .bind(nursery_id)
        .bind(year)
        .bind(staff_id)
        .bind(class_id)
        .execute(&mut *conn).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Assignment of staff {staff_id} to class {class_id} in {year}")));
    }
    info!("Staff unassigned, nursery: {nursery_id}, year: {year}, staff: {staff_id}, class: {class_id}");
    Ok(())
}

#[get("/api/class-assignments/<year>/classes")]
async fn get_classes_with_children(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ClassWithChildren>> {
    reply(list_classes_with_children(ctx.nursery_id, year, &db.0).await?)
}

#[get("/api/class-assignments/<year>/unassigned")]
async fn get_unassigned_children(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ChildRecord>> {
    reply(list_unassigned_children(ctx.nursery_id, year, &db.0).await?)
}

#[post("/api/class-assignments/<year>/assign", data = "<req>")]
async fn post_assign_child(year: Year, req: Json<AssignChildRequest>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ChildAssignmentRecord> {
    let mut tx = db.0.begin().await?;
    let rec = assign_child(ctx.nursery_id, year, &req, &mut tx).await?;
    tx.commit().await?;
    reply(rec)
}

#[delete("/api/class-assignments/<year>/children/<child_id>")]
async fn delete_child_assignment(year: Year, child_id: ChildId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    reply(unassign_child(ctx.nursery_id, year, child_id, &db.0).await?)
}

#[post("/api/class-assignments/<year>/bulk-assign", data = "<req>")]
async fn post_bulk_assign_children(year: Year, req: Json<BulkAssignChildren>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ChildAssignmentRecord>> {
    reply(bulk_assign_children(ctx.nursery_id, year, &req, &db.0).await?)
}

#[get("/api/staff-class-assignments/<year>/classes")]
async fn get_classes_with_staff(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ClassWithStaff>> {
    reply(list_classes_with_staff(ctx.nursery_id, year, &db.0).await?)
}

#[get("/api/staff-class-assignments/<year>/unassigned")]
async fn get_unassigned_staff(year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<StaffRecord>> {
    reply(list_unassigned_staff(ctx.nursery_id, year, &db.0).await?)
}

#[post("/api/staff-class-assignments/<year>/assign", data = "<req>")]
async fn post_assign_staff(year: Year, req: Json<AssignStaffRequest>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffAssignmentRecord> {
    ctx.require_admin()?;
    reply(assign_staff(ctx.nursery_id, year, &req, &db.0).await?)
}

#[delete("/api/staff-class-assignments/<year>/<staff_id>/<class_id>")]
async fn delete_staff_assignment(year: Year, staff_id: StaffId, class_id: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    ctx.require_admin()?;
    reply(unassign_staff(ctx.nursery_id, year, staff_id, class_id, &db.0).await?)
}

#[post("/api/staff-class-assignments/<year>/bulk-assign", data = "<req>")]
async fn post_bulk_assign_staff(year: Year, req: Json<BulkAssignStaff>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<StaffAssignmentRecord>> {
    ctx.require_admin()?;
    reply(bulk_assign_staff(ctx.nursery_id, year, &req, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_classes_with_children,
            get_unassigned_children,
            post_assign_child,
            delete_child_assignment,
            post_bulk_assign_children,
            get_classes_with_staff,
            get_unassigned_staff,
            post_assign_staff,
            delete_staff_assignment,
            post_bulk_assign_staff,
        ])
}
