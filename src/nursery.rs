use chrono::{DateTime, Utc};
use log::info;
use nurseryd_macros::ChangedFields;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{NurseryId, RequestContext};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NurseryRecord {
    pub id: NurseryId,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, ChangedFields, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNursery {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

pub async fn load_nursery(nursery_id: NurseryId, pool: &SqlitePool) -> ApiResult<NurseryRecord> {
    sqlx::query_as("SELECT * FROM nurseries WHERE id=?")
        .bind(nursery_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Nursery {nursery_id}")))
}

pub async fn update_nursery(nursery_id: NurseryId, req: &UpdateNursery, pool: &SqlitePool) -> ApiResult<NurseryRecord> {
    let mut v = Validator::new();
    v.check(!req.changed_fields().is_empty(), "body", "nothing to update");
    if let Some(name) = &req.name {
        v.required("name", name).max_len("name", name, 200);
    }
    v.finish()?;
    load_nursery(nursery_id, pool).await?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE nurseries SET ");
    req.push_assignments(&mut builder);
    builder.push(" WHERE id=").push_bind(nursery_id);
    builder.build().execute(pool).await?;
    info!("Nursery updated, id: {nursery_id}, fields: {:?}", req.changed_fields());
    load_nursery(nursery_id, pool).await
}

#[get("/api/nursery")]
async fn get_nursery(ctx: RequestContext, db: &State<DbPool>) -> ApiReply<NurseryRecord> {
    reply(load_nursery(ctx.nursery_id, &db.0).await?)
}

#[put("/api/nursery", data = "<req>")]
async fn put_nursery(req: Json<UpdateNursery>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<NurseryRecord> {
    ctx.require_admin()?;
    reply(update_nursery(ctx.nursery_id, &req, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_nursery,
            put_nursery,
        ])
}
