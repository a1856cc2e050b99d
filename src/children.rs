use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use nurseryd_macros::ChangedFields;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use crate::auth::{NurseryId, RequestContext};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::dates;

pub type ChildId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub id: ChildId,
    pub nursery_id: NurseryId,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub gender: String,
    pub allergies: String,
    pub guardian_name: String,
    pub guardian_phone: String,
    pub enrolled_on: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateChild {
    pub name: String,
    pub date_of_birth: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub allergies: String,
    #[serde(default)]
    pub guardian_name: String,
    #[serde(default)]
    pub guardian_phone: String,
    pub enrolled_on: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChildRequest {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub allergies: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    pub enrolled_on: Option<String>,
}

/// Column values of an update once dates are parsed.
#[derive(ChangedFields, Default, Debug)]
struct ChildChanges {
    name: Option<String>,
    date_of_birth: Option<NaiveDate>,
    gender: Option<String>,
    allergies: Option<String>,
    guardian_name: Option<String>,
    guardian_phone: Option<String>,
    enrolled_on: Option<NaiveDate>,
}

pub async fn load_child(nursery_id: NurseryId, child_id: ChildId, pool: &SqlitePool) -> ApiResult<ChildRecord> {
    sqlx::query_as("SELECT * FROM children WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(child_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Child {child_id}")))
}

pub async fn list_children(nursery_id: NurseryId, class_id: Option<&str>, year: Option<i32>, include_inactive: bool, pool: &SqlitePool) -> ApiResult<Vec<ChildRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT c.* FROM children c WHERE c.nursery_id=");
    builder.push_bind(nursery_id);
    if !include_inactive {
        builder.push(" AND c.is_active=1");
    }
    if let Some(class_id) = class_id {
        builder.push(" AND c.id IN (SELECT child_id FROM child_class_assignments WHERE is_active=1 AND nursery_id=");
        builder.push_bind(nursery_id);
        builder.push(" AND class_id=");
        builder.push_bind(class_id.to_string());
        match year {
            Some(year) => {
                builder.push(" AND academic_year=");
                builder.push_bind(year);
            }
            None => {
                builder.push(" AND is_current=1");
            }
        }
        builder.push(")");
    }
    builder.push(" ORDER BY c.name");
    let children = builder.build_query_as::<ChildRecord>().fetch_all(pool).await?;
    Ok(children)
}

fn validate_child(req: &CreateChild) -> ApiResult<(NaiveDate, Option<NaiveDate>)> {
    Validator::new()
        .required("name", &req.name)
        .max_len("name", &req.name, 100)
        .max_len("allergies", &req.allergies, 500)
        .finish()?;
    let date_of_birth = dates::parse_date("dateOfBirth", &req.date_of_birth)?;
    if date_of_birth > dates::today() {
        return Err(ApiError::invalid("dateOfBirth", "must not be in the future"));
    }
    let enrolled_on = dates::parse_optional_date("enrolledOn", req.enrolled_on.as_deref())?;
    Ok((date_of_birth, enrolled_on))
}

/// Inserts a child on any connection so intake can do it inside its own transaction.
pub async fn insert_child(nursery_id: NurseryId, req: &CreateChild, conn: &mut SqliteConnection) -> ApiResult<ChildId> {
    let (date_of_birth, enrolled_on) = validate_child(req)?;
    let id: (i64,) = sqlx::query_as("INSERT INTO children
            (nursery_id, name, date_of_birth, gender, allergies, guardian_name, guardian_phone, enrolled_on, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(nursery_id)
        .bind(req.name.trim())
        .bind(date_of_birth)
        .bind(&req.gender)
        .bind(&req.allergies)
        .bind(&req.guardian_name)
        .bind(&req.guardian_phone)
        .bind(enrolled_on)
        .bind(dates::now())
        .fetch_one(&mut *conn).await?;
    info!("Child created, nursery: {nursery_id}, id: {}", id.0);
    Ok(id.0)
}

pub async fn create_child(nursery_id: NurseryId, req: &CreateChild, pool: &SqlitePool) -> ApiResult<ChildRecord> {
    let mut conn = pool.acquire().await?;
    let id = insert_child(nursery_id, req, &mut conn).await?;
    drop(conn);
    load_child(nursery_id, id, pool).await
}

pub async fn update_child(nursery_id: NurseryId, child_id: ChildId, req: &UpdateChildRequest, pool: &SqlitePool) -> ApiResult<ChildRecord> {
    let mut v = Validator::new();
    if let Some(name) = &req.name {
        v.required("name", name).max_len("name", name, 100);
    }
    v.finish()?;
    let changes = ChildChanges {
        name: req.name.as_ref().map(|s| s.trim().to_string()),
        date_of_birth: dates::parse_optional_date("dateOfBirth", req.date_of_birth.as_deref())?,
        gender: req.gender.clone(),
        allergies: req.allergies.clone(),
        guardian_name: req.guardian_name.clone(),
        guardian_phone: req.guardian_phone.clone(),
        enrolled_on: dates::parse_optional_date("enrolledOn", req.enrolled_on.as_deref())?,
    };
    if changes.changed_fields().is_empty() {
        return Err(ApiError::invalid("body", "nothing to update"));
    }
    load_child(nursery_id, child_id, pool).await?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE children SET ");
    changes.push_assignments(&mut builder);
    builder.push(" WHERE nursery_id=").push_bind(nursery_id);
    builder.push(" AND id=").push_bind(child_id);
    builder.build().execute(pool).await?;
    load_child(nursery_id, child_id, pool).await
}

/// Soft delete. Placements in years that are not archived yet are released, history stays.
pub async fn withdraw_child(nursery_id: NurseryId, child_id: ChildId, pool: &SqlitePool) -> ApiResult<()> {
    load_child(nursery_id, child_id, pool).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE children SET is_active=0 WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(child_id)
        .execute(&mut *tx).await?;
    sqlx::query("UPDATE child_class_assignments SET is_active=0
            WHERE nursery_id=? AND child_id=? AND academic_year IN
            (SELECT year FROM academic_years WHERE nursery_id=? AND is_archived=0)")
        .bind(nursery_id)
        .bind(child_id)
        .bind(nursery_id)
        .execute(&mut *tx).await?;
    tx.commit().await?;
    info!("Child withdrawn, nursery: {nursery_id}, id: {child_id}");
    Ok(())
}

#[get("/api/children?<class_id>&<year>&<include_inactive>")]
async fn get_children(class_id: Option<&str>, year: Option<i32>, include_inactive: Option<bool>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<ChildRecord>> {
    reply(list_children(ctx.nursery_id, class_id, year, include_inactive.unwrap_or(false), &db.0).await?)
}

#[get("/api/children/<child_id>")]
async fn get_child(child_id: ChildId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ChildRecord> {
    reply(load_child(ctx.nursery_id, child_id, &db.0).await?)
}

#[post("/api/children", data = "<req>")]
async fn post_child(req: Json<CreateChild>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ChildRecord> {
    reply(create_child(ctx.nursery_id, &req, &db.0).await?)
}

#[put("/api/children/<child_id>", data = "<req>")]
async fn put_child(child_id: ChildId, req: Json<UpdateChildRequest>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<ChildRecord> {
    reply(update_child(ctx.nursery_id, child_id, &req, &db.0).await?)
}

#[delete("/api/children/<child_id>")]
async fn delete_child(child_id: ChildId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    reply(withdraw_child(ctx.nursery_id, child_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_children,
            get_child,
            post_child,
            put_child,
            delete_child,
        ])
}
