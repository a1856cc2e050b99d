use std::collections::HashSet;
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::dates::{self, DateRange};
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::text_enum;

pub type MenuId = i64;
pub type AllergenId = i64;

text_enum! {
    pub enum MealType {
        Lunch => "lunch",
        Snack => "snack",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Allergen {
    pub id: AllergenId,
    pub name: String,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MenuRecord {
    pub id: MenuId,
    pub nursery_id: NurseryId,
    pub menu_date: NaiveDate,
    pub meal_type: MealType,
    pub description: String,
    pub created_by: StaffId,
    pub created_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub allergen_ids: Vec<AllergenId>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateMenu {
    pub menu_date: String,
    pub meal_type: MealType,
    pub description: String,
    #[serde(default)]
    pub allergen_ids: Vec<AllergenId>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMenu {
    pub description: Option<String>,
    pub allergen_ids: Option<Vec<AllergenId>>,
}

pub async fn list_allergens(pool: &SqlitePool) -> ApiResult<Vec<Allergen>> {
    let list = sqlx::query_as("SELECT id, name FROM allergens ORDER BY id")
        .fetch_all(pool).await?;
    Ok(list)
}

async fn check_allergens(ids: &[AllergenId], pool: &SqlitePool) -> ApiResult<Vec<AllergenId>> {
    let known = list_allergens(pool).await?.into_iter().map(|a| a.id).collect::<HashSet<_>>();
    if let Some(unknown) = ids.iter().find(|id| !known.contains(id)) {
        return Err(ApiError::invalid("allergenIds", format!("unknown allergen id {unknown}")));
    }
    Ok(ids.iter().copied().sorted().dedup().collect())
}

async fn replace_allergens(menu_id: MenuId, ids: &[AllergenId], conn: &mut SqliteConnection) -> ApiResult<()> {
    sqlx::query("DELETE FROM menu_allergens WHERE menu_id=?")
        .bind(menu_id)
        .execute(&mut *conn).await?;
    for id in ids {
        sqlx::query("INSERT INTO menu_allergens (menu_id, allergen_id) VALUES (?, ?)")
            .bind(menu_id)
            .bind(id)
            .execute(&mut *conn).await?;
    }
    Ok(())
}

async fn menu_allergen_ids(menu_id: MenuId, pool: &SqlitePool) -> ApiResult<Vec<AllergenId>> {
    let ids: Vec<(AllergenId,)> = sqlx::query_as("SELECT allergen_id FROM menu_allergens WHERE menu_id=? ORDER BY allergen_id")
        .bind(menu_id)
        .fetch_all(pool).await?;
    Ok(ids.into_iter().map(|r| r.0).collect())
}

pub async fn load_menu(nursery_id: NurseryId, menu_id: MenuId, pool: &SqlitePool) -> ApiResult<MenuRecord> {
    let mut menu: MenuRecord = sqlx::query_as("SELECT * FROM menus WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(menu_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Menu {menu_id}")))?;
    menu.allergen_ids = menu_allergen_ids(menu_id, pool).await?;
    Ok(menu)
}

pub async fn list_menus(nursery_id: NurseryId, range: DateRange, pool: &SqlitePool) -> ApiResult<Vec<MenuRecord>> {
    let mut menus: Vec<MenuRecord> = sqlx::query_as("SELECT * FROM menus WHERE nursery_id=? AND menu_date BETWEEN ? AND ?
            ORDER BY menu_date, meal_type")
        .bind(nursery_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(pool).await?;
    for menu in &mut menus {
        menu.allergen_ids = menu_allergen_ids(menu.id, pool).await?;
    }
    Ok(menus)
}

pub async fn create_menu(ctx: &RequestContext, req: &CreateMenu, pool: &SqlitePool) -> ApiResult<MenuRecord> {
    Validator::new()
        .required("description", &req.description)
        .max_len("description", &req.description, 1000)
        .finish()?;
    let menu_date = dates::parse_date("menuDate", &req.menu_date)?;
    let allergen_ids = check_allergens(&req.allergen_ids, pool).await?;
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM menus WHERE nursery_id=? AND menu_date=? AND meal_type=?")
        .bind(ctx.nursery_id)
        .bind(menu_date)
        .bind(req.meal_type)
        .fetch_one(pool).await?;
    if exists.0 > 0 {
        return Err(ApiError::conflict(format!("A {} menu for {menu_date} already exists", req.meal_type)));
    }
    let mut tx = pool.begin().await?;
    let id: (i64,) = sqlx::query_as("INSERT INTO menus (nursery_id, menu_date, meal_type, description, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(ctx.nursery_id)
        .bind(menu_date)
        .bind(req.meal_type)
        .bind(req.description.trim())
        .bind(ctx.staff_id)
        .bind(dates::now())
        .fetch_one(&mut *tx).await?;
    replace_allergens(id.0, &allergen_ids, &mut tx).await?;
    tx.commit().await?;
    info!("Menu created, nursery: {}, id: {}, date: {menu_date}", ctx.nursery_id, id.0);
    load_menu(ctx.nursery_id, id.0, pool).await
}

pub async fn update_menu(nursery_id: NurseryId, menu_id: MenuId, req: &UpdateMenu, pool: &SqlitePool) -> ApiResult<MenuRecord> {
    let mut v = Validator::new();
    v.check(req.description.is_some() || req.allergen_ids.is_some(), "body", "nothing to update");
    if let Some(description) = &req.description {
        v.required("description", description).max_len("description", description, 1000);
    }
    v.finish()?;
    load_menu(nursery_id, menu_id, pool).await?;
    let allergen_ids = match &req.allergen_ids {
        Some(ids) => Some(check_allergens(ids, pool).await?),
        None => None,
    };
    let mut tx = pool.begin().await?;
    if let Some(description) = &req.description {
        sqlx::query("UPDATE menus SET description=? WHERE nursery_id=? AND id=?")
            .bind(description.trim())
            .bind(nursery_id)
            .bind(menu_id)
            .execute(&mut *tx).await?;
    }
    if let Some(ids) = &allergen_ids {
        replace_allergens(menu_id, ids, &mut tx).await?;
    }
    tx.commit().await?;
    load_menu(nursery_id, menu_id, pool).await
}

pub async fn delete_menu(nursery_id: NurseryId, menu_id: MenuId, pool: &SqlitePool) -> ApiResult<()> {
    let res = sqlx::query("DELETE FROM menus WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(menu_id)
        .execute(pool).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Menu {menu_id}")));
    }
    Ok(())
}

#[get("/api/allergens")]
async fn get_allergens(db: &State<DbPool>) -> ApiReply<Vec<Allergen>> {
    reply(list_allergens(&db.0).await?)
}

#[get("/api/menus?<from>&<to>")]
async fn get_menus(from: &str, to: &str, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<MenuRecord>> {
    reply(list_menus(ctx.nursery_id, DateRange::parse(from, to)?, &db.0).await?)
}

#[get("/api/menus/<menu_id>")]
async fn get_menu(menu_id: MenuId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<MenuRecord> {
    reply(load_menu(ctx.nursery_id, menu_id, &db.0).await?)
}

#[post("/api/menus", data = "<req>")]
async fn post_menu(req: Json<CreateMenu>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<MenuRecord> {
    reply(create_menu(&ctx, &req, &db.0).await?)
}

#[put("/api/menus/<menu_id>", data = "<req>")]
async fn put_menu(menu_id: MenuId, req: Json<UpdateMenu>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<MenuRecord> {
    reply(update_menu(ctx.nursery_id, menu_id, &req, &db.0).await?)
}

#[delete("/api/menus/<menu_id>")]
async fn delete_menu_route(menu_id: MenuId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    reply(delete_menu(ctx.nursery_id, menu_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_allergens,
            get_menus,
            get_menu,
            post_menu,
            put_menu,
            delete_menu_route,
        ])
}
