use chrono::{DateTime, Utc};
use log::info;
use nurseryd_macros::ChangedFields;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{hash_password, NurseryId, RequestContext, Role, StaffId};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::dates;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StaffRecord {
    pub id: StaffId,
    pub nursery_id: NurseryId,
    pub name: String,
    pub email: String,
    pub login_id: String,
    pub role: Role,
    pub is_active: bool,
    pub failed_login_count: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const STAFF_COLUMNS: &str = "id, nursery_id, name, email, login_id, role, is_active, failed_login_count, locked_until, created_at";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateStaff {
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub login_id: String,
    pub password: String,
    pub role: Role,
}

#[derive(Deserialize, ChangedFields, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStaff {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

pub async fn load_staff(nursery_id: NurseryId, staff_id: StaffId, pool: &SqlitePool) -> ApiResult<StaffRecord> {
    sqlx::query_as(&format!("SELECT {STAFF_COLUMNS} FROM staff WHERE nursery_id=? AND id=?"))
        .bind(nursery_id)
        .bind(staff_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Staff {staff_id}")))
}

pub async fn list_staff(nursery_id: NurseryId, include_inactive: bool, pool: &SqlitePool) -> ApiResult<Vec<StaffRecord>> {
    let active_filter = if include_inactive { "" } else { "AND is_active=1" };
    let staff = sqlx::query_as(&format!("SELECT {STAFF_COLUMNS} FROM staff WHERE nursery_id=? {active_filter} ORDER BY name"))
        .bind(nursery_id)
        .fetch_all(pool)
        .await?;
    Ok(staff)
}

pub async fn create_staff(nursery_id: NurseryId, req: &CreateStaff, pool: &SqlitePool) -> ApiResult<StaffRecord> {
    Validator::new()
        .required("name", &req.name)
        .max_len("name", &req.name, 100)
        .required("loginId", &req.login_id)
        .check(!req.login_id.contains(char::is_whitespace), "loginId", "must not contain whitespace")
        .check(req.password.chars().count() >= 8, "password", "must be at least 8 characters")
        .finish()?;
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM staff WHERE login_id=?")
        .bind(&req.login_id)
        .fetch_one(pool).await?;
    if exists.0 > 0 {
        return Err(ApiError::conflict(format!("Login id '{}' is already taken", req.login_id)));
    }
    let id: (i64,) = sqlx::query_as("INSERT INTO staff (nursery_id, name, email, login_id, password_hash, role, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(nursery_id)
        .bind(req.name.trim())
        .bind(req.email.trim())
        .bind(&req.login_id)
        .bind(hash_password(&req.password))
        .bind(req.role)
        .bind(dates::now())
        .fetch_one(pool).await?;
    info!("Staff created, nursery: {nursery_id}, id: {}", id.0);
    load_staff(nursery_id, id.0, pool).await
}

pub async fn update_staff(nursery_id: NurseryId, staff_id: StaffId, req: &UpdateStaff, pool: &SqlitePool) -> ApiResult<StaffRecord> {
    let mut v = Validator::new();
    v.check(!req.changed_fields().is_empty(), "body", "nothing to update");
    if let Some(name) = &req.name {
        v.required("name", name).max_len("name", name, 100);
    }
    v.finish()?;
    load_staff(nursery_id, staff_id, pool).await?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE staff SET ");
    req.push_assignments(&mut builder);
    builder.push(" WHERE nursery_id=").push_bind(nursery_id);
    builder.push(" AND id=").push_bind(staff_id);
    builder.build().execute(pool).await?;
    load_staff(nursery_id, staff_id, pool).await
}

/// Soft delete. The staff member's class assignments in non-archived years are released too.
pub async fn deactivate_staff(ctx: &RequestContext, staff_id: StaffId, pool: &SqlitePool) -> ApiResult<()> {
    if ctx.staff_id == staff_id {
        return Err(ApiError::conflict("Staff cannot deactivate their own account"));
    }
    load_staff(ctx.nursery_id, staff_id, pool).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE staff SET is_active=0 WHERE nursery_id=? AND id=?")
        .bind(ctx.nursery_id)
        .bind(staff_id)
        .execute(&mut *tx).await?;
    sqlx::query("UPDATE staff_class_assignments SET is_active=0
            WHERE nursery_id=? AND staff_id=? AND academic_year IN
            (SELECT year FROM academic_years WHERE nursery_id=? AND is_archived=0)")
        .bind(ctx.nursery_id)
        .bind(staff_id)
        .bind(ctx.nursery_id)
        .execute(&mut *tx).await?;
    sqlx::query("DELETE FROM sessions WHERE staff_id=?")
        .bind(staff_id)
        .execute(&mut *tx).await?;
    tx.commit().await?;
    info!("Staff deactivated, nursery: {}, id: {staff_id}", ctx.nursery_id);
    Ok(())
}

pub async fn unlock_staff(nursery_id: NurseryId, staff_id: StaffId, pool: &SqlitePool) -> ApiResult<StaffRecord> {
    load_staff(nursery_id, staff_id, pool).await?;
    sqlx::query("UPDATE staff SET failed_login_count=0, locked_until=NULL WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(staff_id)
        .execute(pool).await?;
    info!("Staff unlocked, nursery: {nursery_id}, id: {staff_id}");
    load_staff(nursery_id, staff_id, pool).await
}

#[get("/api/staff?<include_inactive>")]
async fn get_staff_list(include_inactive: Option<bool>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<StaffRecord>> {
    reply(list_staff(ctx.nursery_id, include_inactive.unwrap_or(false), &db.0).await?)
}

#[get("/api/staff/<staff_id>")]
async fn get_staff(staff_id: StaffId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffRecord> {
    reply(load_staff(ctx.nursery_id, staff_id, &db.0).await?)
}

#[post("/api/staff", data = "<req>")]
async fn post_staff(req: Json<CreateStaff>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffRecord> {
    ctx.require_admin()?;
    reply(create_staff(ctx.nursery_id, &req, &db.0).await?)
}

#[put("/api/staff/<staff_id>", data = "<req>")]
async fn put_staff(staff_id: StaffId, req: Json<UpdateStaff>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffRecord> {
    if req.role.is_some() || ctx.staff_id != staff_id {
        ctx.require_admin()?;
    }
    reply(update_staff(ctx.nursery_id, staff_id, &req, &db.0).await?)
}

#[delete("/api/staff/<staff_id>")]
async fn delete_staff(staff_id: StaffId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    ctx.require_admin()?;
    reply(deactivate_staff(&ctx, staff_id, &db.0).await?)
}

#[post("/api/staff/<staff_id>/unlock")]
async fn post_staff_unlock(staff_id: StaffId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffRecord> {
    ctx.require_admin()?;
    reply(unlock_staff(ctx.nursery_id, staff_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_staff_list,
            get_staff,
            post_staff,
            put_staff,
            delete_staff,
            post_staff_unlock,
        ])
}
