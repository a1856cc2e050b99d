use chrono::{DateTime, Utc};
use log::{error, info, warn};
use nurseryd_macros::ChangedFields;
use rocket::fairing::AdHoc;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::{dates, text_enum};

pub type AnnouncementId = i64;

text_enum! {
    pub enum AnnouncementStatus {
        Draft => "draft",
        Published => "published",
    }
}

text_enum! {
    pub enum Category {
        General => "general",
        Event => "event",
        Health => "health",
        Emergency => "emergency",
    }
}

text_enum! {
    pub enum Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
    }
}

text_enum! {
    pub enum DeliveryStatus {
        Sent => "sent",
        Failed => "failed",
        Skipped => "skipped",
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementRecord {
    pub id: AnnouncementId,
    pub nursery_id: NurseryId,
    pub title: String,
    pub content: String,
    pub category: Category,
    pub priority: Priority,
    pub target_class_id: Option<String>,
    pub status: AnnouncementStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_by: StaffId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateAnnouncement {
    pub title: String,
    pub content: String,
    #[serde(default = "default_category")]
    pub category: Category,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub target_class_id: Option<String>,
}

fn default_category() -> Category {
    Category::General
}

fn default_priority() -> Priority {
    Priority::Normal
}

#[derive(Deserialize, ChangedFields, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAnnouncement {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub target_class_id: Option<String>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: i64,
    pub nursery_id: NurseryId,
    pub announcement_id: AnnouncementId,
    pub channel: String,
    pub status: DeliveryStatus,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub announcement: AnnouncementRecord,
    pub notification: NotificationRecord,
}

/// Outcome reported by a gateway that did not fail outright.
pub struct Delivery {
    pub status: DeliveryStatus,
    pub detail: String,
}

/// Pushes published announcements to guardians.
#[rocket::async_trait]
pub trait NotificationGateway: Send + Sync {
    fn channel(&self) -> &'static str;
    async fn deliver(&self, announcement: &AnnouncementRecord) -> anyhow::Result<Delivery>;
}

pub struct WebhookGateway {
    client: reqwest::Client,
    url: String,
}

impl WebhookGateway {
    pub fn new(url: &str) -> Self {
        Self { client: reqwest::Client::new(), url: url.to_string() }
    }
}

#[rocket::async_trait]
impl NotificationGateway for WebhookGateway {
    fn channel(&self) -> &'static str {
        "webhook"
    }
    async fn deliver(&self, announcement: &AnnouncementRecord) -> anyhow::Result<Delivery> {
        let resp = self.client.post(&self.url)
            .json(announcement)
            .send().await?
            .error_for_status()?;
        Ok(Delivery { status: DeliveryStatus::Sent, detail: format!("HTTP {}", resp.status().as_u16()) })
    }
}

pub struct LogOnlyGateway;

#[rocket::async_trait]
impl NotificationGateway for LogOnlyGateway {
    fn channel(&self) -> &'static str {
        "log"
    }
    async fn deliver(&self, announcement: &AnnouncementRecord) -> anyhow::Result<Delivery> {
        info!("Announcement id: {} '{}' published, no notification webhook configured", announcement.id, announcement.title);
        Ok(Delivery { status: DeliveryStatus::Skipped, detail: "no webhook configured".to_string() })
    }
}

pub struct Notifier(pub Box<dyn NotificationGateway>);

impl Notifier {
    pub fn from_config(cfg: &AppConfig) -> Self {
        match cfg.notification_webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Notifier(Box::new(WebhookGateway::new(url))),
            None => Notifier(Box::new(LogOnlyGateway)),
        }
    }
}

pub async fn load_announcement(nursery_id: NurseryId, id: AnnouncementId, pool: &SqlitePool) -> ApiResult<AnnouncementRecord> {
    sqlx::query_as("SELECT * FROM announcements WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Announcement {id}")))
}

pub async fn list_announcements(nursery_id: NurseryId, status: Option<AnnouncementStatus>, pool: &SqlitePool) -> ApiResult<Vec<AnnouncementRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM announcements WHERE nursery_id=");
    builder.push_bind(nursery_id);
    if let Some(status) = status {
        builder.push(" AND status=").push_bind(status);
    }
    builder.push(" ORDER BY COALESCE(published_at, created_at) DESC, id DESC");
    let list = builder.build_query_as::<AnnouncementRecord>().fetch_all(pool).await?;
    Ok(list)
}

async fn check_target_class(nursery_id: NurseryId, class_id: Option<&str>, pool: &SqlitePool) -> ApiResult<()> {
    if let Some(class_id) = class_id {
        crate::classes::load_class(nursery_id, class_id, pool).await?;
    }
    Ok(())
}

pub async fn create_announcement(ctx: &RequestContext, req: &CreateAnnouncement, pool: &SqlitePool) -> ApiResult<AnnouncementRecord> {
    Validator::new()
        .required("title", &req.title)
        .max_len("title", &req.title, 200)
        .required("content", &req.content)
        .max_len("content", &req.content, 10_000)
        .finish()?;
    check_target_class(ctx.nursery_id, req.target_class_id.as_deref(), pool).await?;
    let now = dates::now();
    let id: (i64,) = sqlx::query_as("INSERT INTO announcements
            (nursery_id, title, content, category, priority, target_class_id, status, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(ctx.nursery_id)
        .bind(req.title.trim())
        .bind(&req.content)
        .bind(req.category)
        .bind(req.priority)
        .bind(&req.target_class_id)
        .bind(AnnouncementStatus::Draft)
        .bind(ctx.staff_id)
        .bind(now)
        .bind(now)
        .fetch_one(pool).await?;
    info!("Announcement created, nursery: {}, id: {}", ctx.nursery_id, id.0);
    load_announcement(ctx.nursery_id, id.0, pool).await
}

fn ensure_draft(rec: &AnnouncementRecord) -> ApiResult<()> {
    if rec.status == AnnouncementStatus::Published {
        Err(ApiError::conflict(format!("Announcement {} is already published", rec.id)))
    } else {
        Ok(())
    }
}

pub async fn update_announcement(nursery_id: NurseryId, id: AnnouncementId, req: &UpdateAnnouncement, pool: &SqlitePool) -> ApiResult<AnnouncementRecord> {
    let mut v = Validator::new();
    v.check(!req.changed_fields().is_empty(), "body", "nothing to update");
    if let Some(title) = &req.title {
        v.required("title", title).max_len("title", title, 200);
    }
    if let Some(content) = &req.content {
        v.required("content", content).max_len("content", content, 10_000);
    }
    v.finish()?;
    ensure_draft(&load_announcement(nursery_id, id, pool).await?)?;
    check_target_class(nursery_id, req.target_class_id.as_deref(), pool).await?;
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE announcements SET ");
    req.push_assignments(&mut builder);
    builder.push(", updated_at=").push_bind(dates::now());
    builder.push(" WHERE nursery_id=").push_bind(nursery_id);
    builder.push(" AND id=").push_bind(id);
    builder.build().execute(pool).await?;
    load_announcement(nursery_id, id, pool).await
}

pub async fn delete_announcement(nursery_id: NurseryId, id: AnnouncementId, pool: &SqlitePool) -> ApiResult<()> {
    load_announcement(nursery_id, id, pool).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM notifications WHERE nursery_id=? AND announcement_id=?")
        .bind(nursery_id)
        .bind(id)
        .execute(&mut *tx).await?;
    sqlx::query("DELETE FROM announcements WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(id)
        .execute(&mut *tx).await?;
    tx.commit().await?;
    info!("Announcement deleted, nursery: {nursery_id}, id: {id}");
    Ok(())
}

/// Marks the announcement published, then hands it to the gateway.
/// A failed delivery is recorded on the notification row and does not undo the publish.
pub async fn publish_announcement(nursery_id: NurseryId, id: AnnouncementId, notifier: &Notifier, pool: &SqlitePool) -> ApiResult<PublishResult> {
    ensure_draft(&load_announcement(nursery_id, id, pool).await?)?;
    let now = dates::now();
    sqlx::query("UPDATE announcements SET status=?, published_at=?, updated_at=? WHERE nursery_id=? AND id=?")
        .bind(AnnouncementStatus::Published)
        .bind(now)
        .bind(now)
        .bind(nursery_id)
        .bind(id)
        .execute(pool).await?;
    let announcement = load_announcement(nursery_id, id, pool).await?;
    let delivery = match notifier.0.deliver(&announcement).await {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!("Announcement id: {id}, {} delivery failed: {e}", notifier.0.channel());
            Delivery { status: DeliveryStatus::Failed, detail: e.to_string() }
        }
    };
    let notification: NotificationRecord = sqlx::query_as("INSERT INTO notifications
            (nursery_id, announcement_id, channel, status, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(nursery_id)
        .bind(id)
        .bind(notifier.0.channel())
        .bind(delivery.status)
        .bind(&delivery.detail)
        .bind(dates::now())
        .fetch_one(pool).await?;
    info!("Announcement published, nursery: {nursery_id}, id: {id}, notification: {}", notification.status);
    Ok(PublishResult { announcement, notification })
}

#[get("/api/announcements?<status>")]
async fn get_announcements(status: Option<&str>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<AnnouncementRecord>> {
    let status = status
        .map(|s| s.parse::<AnnouncementStatus>().map_err(|e| ApiError::invalid("status", e)))
        .transpose()?;
    reply(list_announcements(ctx.nursery_id, status, &db.0).await?)
}

#[get("/api/announcements/<id>")]
async fn get_announcement(id: AnnouncementId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AnnouncementRecord> {
    reply(load_announcement(ctx.nursery_id, id, &db.0).await?)
}

#[post("/api/announcements", data = "<req>")]
async fn post_announcement(req: Json<CreateAnnouncement>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AnnouncementRecord> {
    reply(create_announcement(&ctx, &req, &db.0).await?)
}

#[put("/api/announcements/<id>", data = "<req>")]
async fn put_announcement(id: AnnouncementId, req: Json<UpdateAnnouncement>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<AnnouncementRecord> {
    reply(update_announcement(ctx.nursery_id, id, &req, &db.0).await?)
}

#[delete("/api/announcements/<id>")]
async fn delete_announcement_route(id: AnnouncementId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    reply(delete_announcement(ctx.nursery_id, id, &db.0).await?)
}

#[post("/api/announcements/<id>/publish")]
async fn post_announcement_publish(id: AnnouncementId, ctx: RequestContext, notifier: &State<Notifier>, db: &State<DbPool>) -> ApiReply<PublishResult> {
    reply(publish_announcement(ctx.nursery_id, id, notifier, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .attach(AdHoc::try_on_ignite("Notification gateway", |rocket| async move {
            let Some(notifier) = rocket.state::<AppConfig>().map(Notifier::from_config) else {
                error!("Notification gateway needs the application config to be managed first");
                return Err(rocket);
            };
            info!("Notification channel: {}", notifier.0.channel());
            Ok(rocket.manage(notifier))
        }))
        .mount("/", routes![
            get_announcements,
            get_announcement,
            post_announcement,
            put_announcement,
            delete_announcement_route,
            post_announcement_publish,
        ])
}
