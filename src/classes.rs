use log::info;
use nurseryd_macros::ChangedFields;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use crate::auth::{NurseryId, RequestContext};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};

/// Classes outlive academic years, only their occupants change from year to year.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    pub nursery_id: NurseryId,
    pub class_id: String,
    pub name: String,
    pub age_group_min: i64,
    pub age_group_max: i64,
    pub max_capacity: i64,
    pub is_active: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateClass {
    pub class_id: String,
    pub name: String,
    pub age_group_min: i64,
    pub age_group_max: i64,
    pub max_capacity: i64,
}

#[derive(Deserialize, ChangedFields, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClass {
    pub name: Option<String>,
    pub age_group_min: Option<i64>,
    pub age_group_max: Option<i64>,
    pub max_capacity: Option<i64>,
}

pub async fn find_class(nursery_id: NurseryId, class_id: &str, conn: &mut SqliteConnection) -> ApiResult<ClassRecord> {
    sqlx::query_as("SELECT * FROM classes WHERE nursery_id=? AND class_id=?")
        .bind(nursery_id)
        .bind(class_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Class {class_id}")))
}

pub async fn load_class(nursery_id: NurseryId, class_id: &str, pool: &SqlitePool) -> ApiResult<ClassRecord> {
    let mut conn = pool.acquire().await?;
    find_class(nursery_id, class_id, &mut conn).await
}

pub async fn list_classes(nursery_id: NurseryId, include_inactive: bool, pool: &SqlitePool) -> ApiResult<Vec<ClassRecord>> {
    let active_filter = if include_inactive { "" } else { "AND is_active=1" };
    let classes = sqlx::query_as(&format!("SELECT * FROM classes WHERE nursery_id=? {active_filter} ORDER BY age_group_min, class_id"))
        .bind(nursery_id)
        .fetch_all(pool)
        .await?;
    Ok(classes)
}

fn validate_ages(v: &mut Validator, min: i64, max: i64) {
    v.check((0..=6).contains(&min), "ageGroupMin", "must be between 0 and 6")
        .check((0..=6).contains(&max), "ageGroupMax", "must be between 0 and 6")
        .check(min <= max, "ageGroupMax", "must not be below ageGroupMin");
}

pub async fn create_class(nursery_id: NurseryId, req: &CreateClass, pool: &SqlitePool) -> ApiResult<ClassRecord> {
    let mut v = Validator::new();
    v.required("classId", &req.class_id)
        .max_len("classId", &req.class_id, 32)
        .check(!req.class_id.contains(['/', '?', ' ']), "classId", "must not contain '/', '?' or spaces")
        .required("name", &req.name)
        .check(req.max_capacity > 0, "maxCapacity", "must be positive");
    validate_ages(&mut v, req.age_group_min, req.age_group_max);
    v.finish()?;
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM classes WHERE nursery_id=? AND class_id=?")
        .bind(nursery_id)
        .bind(&req.class_id)
        .fetch_one(pool).await?;
    if exists.0 > 0 {
        return Err(ApiError::conflict(format!("Class {} already exists", req.class_id)));
    }
    sqlx::query("INSERT INTO classes (nursery_id, class_id, name, age_group_min, age_group_max, max_capacity)
            VALUES (?, ?, ?, ?, ?, ?)")
        .bind(nursery_id)
        .bind(&req.class_id)
        .bind(req.name.trim())
        .bind(req.age_group_min)
        .bind(req.age_group_max)
        .bind(req.max_capacity)
        .execute(pool).await?;
    info!("Class created, nursery: {nursery_id}, class: {}", req.class_id);
    load_class(nursery_id, &req.class_id, pool).await
}

pub async fn update_class(nursery_id: NurseryId, class_id: &str, req: &UpdateClass, pool: &SqlitePool) -> ApiResult<ClassRecord> {
    let current = load_class(nursery_id, class_id, pool).await?;
    let mut v = Validator::new();
    v.check(!req.changed_fields().is_empty(), "body", "nothing to update");
    if let Some(name) = &req.name {
        v.required("name", name);
    }
    if let Some(cap) = req.max_capacity {
        v.check(cap > 0, "maxCapacity", "must be positive");
    }
    validate_ages(&mut v,
                  req.age_group_min.unwrap_or(current.age_group_min),
                  req.age_group_max.unwrap_or(current.age_group_max));
    v.finish()?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE classes SET ");
    req.push_assignments(&mut builder);
    builder.push(" WHERE nursery_id=").push_bind(nursery_id);
    builder.push(" AND class_id=").push_bind(class_id.to_string());
    builder.build().execute(pool).await?;
    load_class(nursery_id, class_id, pool).await
}

/// Soft delete, refused while the class still has children in the current year.
pub async fn deactivate_class(nursery_id: NurseryId, class_id: &str, pool: &SqlitePool) -> ApiResult<()> {
    load_class(nursery_id, class_id, pool).await?;
    let occupants: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM child_class_assignments
            WHERE nursery_id=? AND class_id=? AND is_current=1 AND is_active=1")
        .bind(nursery_id)
        .bind(class_id)
        .fetch_one(pool).await?;
    if occupants.0 > 0 {
        return Err(ApiError::conflict(format!("Class {class_id} still has {} children assigned", occupants.0)));
    }
    sqlx::query("UPDATE classes SET is_active=0 WHERE nursery_id=? AND class_id=?")
        .bind(nursery_id)
        .bind(class_id)
        .execute(pool).await?;
    info!("Class deactivated, nursery: {nursery_id}, class: {class_id}");
    Ok(())
}

#[get("/api/classes?<include_inactive>")]
async fn get_classes(include_inactive: Option<bool>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ClassRecord>> {
    reply(list_classes(ctx.nursery_id, include_inactive.unwrap_or(false), &db.0).await?)
}

#[get("/api/classes/<class_id>")]
async fn get_class(class_id: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ClassRecord> {
    reply(load_class(ctx.nursery_id, class_id, &db.0).await?)
}

#[post("/api/classes", data = "<req>")]
async fn post_class(req: Json<CreateClass>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ClassRecord> {
    ctx.require_admin()?;
    reply(create_class(ctx.nursery_id, &req, &db.0).await?)
}

#[put("/api/classes/<class_id>", data = "<req>")]
async fn put_class(class_id: &str, req: Json<UpdateClass>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ClassRecord> {
    ctx.require_admin()?;
    reply(update_class(ctx.nursery_id, class_id, &req, &db.0).await?)
}

#[delete("/api/classes/<class_id>")]
async fn delete_class(class_id: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    ctx.require_admin()?;
    reply(deactivate_class(ctx.nursery_id, class_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_classes,
            get_class,
            post_class,
            put_class,
            delete_class,
        ])
}
