use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rocket::data::ToByteUnit;
use rocket::fairing::AdHoc;
use rocket::http::ContentType;
use rocket::{Build, Data, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::ChildId;
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::dates;
use crate::util::{generate_token, unzip_data};

pub type PhotoId = i64;

const MAX_UPLOAD_MIB: usize = 50;

/// Where photo bytes live. Metadata always stays in the database.
#[rocket::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> ApiResult<()>;
    async fn get(&self, key: &str) -> ApiResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> ApiResult<()>;
}

pub struct SqliteBlobStore(pub SqlitePool);

#[rocket::async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> ApiResult<()> {
        sqlx::query("INSERT INTO blobs (blob_key, data, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(data)
            .bind(dates::now())
            .execute(&self.0).await?;
        Ok(())
    }
    async fn get(&self, key: &str) -> ApiResult<Vec<u8>> {
        let data: (Vec<u8>,) = sqlx::query_as("SELECT data FROM blobs WHERE blob_key=?")
            .bind(key)
            .fetch_optional(&self.0).await?
            .ok_or_else(|| ApiError::not_found(format!("Blob {key}")))?;
        Ok(data.0)
    }
    async fn delete(&self, key: &str) -> ApiResult<()> {
        sqlx::query("DELETE FROM blobs WHERE blob_key=?")
            .bind(key)
            .execute(&self.0).await?;
        Ok(())
    }
}

pub struct PhotoStorage(pub Box<dyn BlobStore>);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub nursery_id: NurseryId,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
    pub description: String,
    #[serde(skip)]
    pub blob_key: String,
    pub uploaded_by: StaffId,
    pub uploaded_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub child_ids: Vec<ChildId>,
}

async fn load_tags(photo_id: PhotoId, pool: &SqlitePool) -> ApiResult<Vec<ChildId>> {
    let ids: Vec<(ChildId,)> = sqlx::query_as("SELECT child_id FROM photo_children WHERE photo_id=? ORDER BY child_id")
        .bind(photo_id)
        .fetch_all(pool).await?;
    Ok(ids.into_iter().map(|r| r.0).collect())
}

pub async fn load_photo(nursery_id: NurseryId, photo_id: PhotoId, pool: &SqlitePool) -> ApiResult<PhotoRecord> {
    let mut photo: PhotoRecord = sqlx::query_as("SELECT * FROM photos WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(photo_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Photo {photo_id}")))?;
    photo.child_ids = load_tags(photo_id, pool).await?;
    Ok(photo)
}

pub async fn list_photos(nursery_id: NurseryId, child_id: Option<ChildId>, pool: &SqlitePool) -> ApiResult<Vec<PhotoRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM photos WHERE nursery_id=");
    builder.push_bind(nursery_id);
    if let Some(child_id) = child_id {
        builder.push(" AND id IN (SELECT photo_id FROM photo_children WHERE child_id=").push_bind(child_id).push(")");
    }
    builder.push(" ORDER BY uploaded_at DESC, id DESC");
    let mut photos = builder.build_query_as::<PhotoRecord>().fetch_all(pool).await?;
    for photo in &mut photos {
        photo.child_ids = load_tags(photo.id, pool).await?;
    }
    Ok(photos)
}

pub struct PhotoUpload {
    pub file_name: String,
    pub description: String,
    pub child_ids: Vec<ChildId>,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

/// Zlib compressed uploads are unpacked, the stored media type then comes from the file extension.
fn resolve_payload(upload: PhotoUpload) -> ApiResult<(String, Vec<u8>)> {
    if upload.content_type == ContentType::ZIP {
        let limit = MAX_UPLOAD_MIB as u64 * 1024 * 1024;
        let data = unzip_data(&upload.data, limit).map_err(|e| ApiError::invalid("body", format!("cannot decompress upload: {e}")))?;
        if data.len() as u64 > limit {
            return Err(ApiError::TooLarge(format!("Decompressed photo exceeds {MAX_UPLOAD_MIB} MiB")));
        }
        let content_type = upload.file_name.rsplit_once('.')
            .and_then(|(_, ext)| ContentType::from_extension(ext))
            .filter(|ct| ct.top() == "image")
            .ok_or_else(|| ApiError::invalid("fileName", "compressed uploads need an image file extension"))?;
        Ok((content_type.to_string(), data))
    } else if upload.content_type.top() == "image" {
        Ok((upload.content_type.to_string(), upload.data))
    } else {
        Err(ApiError::invalid("contentType", "must be image/* or application/zip"))
    }
}

struct PhotoMeta<'a> {
    file_name: &'a str,
    content_type: &'a str,
    size: i64,
    description: &'a str,
    blob_key: &'a str,
}

async fn insert_photo(ctx: &RequestContext, meta: &PhotoMeta<'_>, child_ids: &[ChildId], pool: &SqlitePool) -> ApiResult<PhotoId> {
    let mut tx = pool.begin().await?;
    let id: (i64,) = sqlx::query_as("INSERT INTO photos
            (nursery_id, file_name, content_type, size, description, blob_key, uploaded_by, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(ctx.nursery_id)
        .bind(meta.file_name)
        .bind(meta.content_type)
        .bind(meta.size)
        .bind(meta.description)
        .bind(meta.blob_key)
        .bind(ctx.staff_id)
        .bind(dates::now())
        .fetch_one(&mut *tx).await?;
    for child_id in child_ids {
        sqlx::query("INSERT INTO photo_children (photo_id, child_id) VALUES (?, ?)")
            .bind(id.0)
            .bind(child_id)
            .execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(id.0)
}

pub async fn store_photo(ctx: &RequestContext, upload: PhotoUpload, storage: &PhotoStorage, pool: &SqlitePool) -> ApiResult<PhotoRecord> {
    Validator::new()
        .required("fileName", &upload.file_name)
        .max_len("fileName", &upload.file_name, 255)
        .max_len("description", &upload.description, 1000)
        .check(!upload.data.is_empty(), "body", "is empty")
        .finish()?;
    for child_id in &upload.child_ids {
        crate::children::load_child(ctx.nursery_id, *child_id, pool).await?;
    }
    let file_name = upload.file_name.trim().to_string();
    let description = upload.description.clone();
    let mut child_ids = upload.child_ids.clone();
    child_ids.sort_unstable();
    child_ids.dedup();
    let (content_type, data) = resolve_payload(upload)?;
    let size = data.len() as i64;
    let blob_key = format!("{}/{}", ctx.nursery_id, generate_token(24));
    storage.0.put(&blob_key, data).await?;

    let meta = PhotoMeta { file_name: &file_name, content_type: &content_type, size, description: &description, blob_key: &blob_key };
    let id = match insert_photo(ctx, &meta, &child_ids, pool).await {
        Ok(id) => id,
        Err(e) => {
            if let Err(de) = storage.0.delete(&blob_key).await {
                warn!("Photo metadata was not stored and its blob {blob_key} was left behind: {de}");
            }
            return Err(e);
        }
    };
    info!("Nursery: {}, photo id: {id} stored: {file_name} with {size} bytes of data", ctx.nursery_id);
    load_photo(ctx.nursery_id, id, pool).await
}

pub async fn photo_content(nursery_id: NurseryId, photo_id: PhotoId, storage: &PhotoStorage, pool: &SqlitePool) -> ApiResult<(ContentType, Vec<u8>)> {
    let photo = load_photo(nursery_id, photo_id, pool).await?;
    let data = storage.0.get(&photo.blob_key).await?;
    let content_type = ContentType::parse_flexible(&photo.content_type).unwrap_or(ContentType::Binary);
    Ok((content_type, data))
}

pub async fn delete_photo(nursery_id: NurseryId, photo_id: PhotoId, storage: &PhotoStorage, pool: &SqlitePool) -> ApiResult<()> {
    let photo = load_photo(nursery_id, photo_id, pool).await?;
    sqlx::query("DELETE FROM photos WHERE nursery_id=? AND id=?")
        .bind(nursery_id)
        .bind(photo_id)
        .execute(pool).await?;
    if let Err(e) = storage.0.delete(&photo.blob_key).await {
        warn!("Photo id: {photo_id} deleted, but its blob {} was not: {e}", photo.blob_key);
    }
    info!("Nursery: {nursery_id}, photo id: {photo_id} deleted");
    Ok(())
}

#[post("/api/photos?<file_name>&<description>&<child_ids>", data = "<data>")]
async fn post_photo(file_name: &str, description: Option<&str>, child_ids: Vec<ChildId>, data: Data<'_>, content_type: &ContentType,
                    ctx: RequestContext, storage: &State<PhotoStorage>, db: &State<DbPool>) -> ApiReply<PhotoRecord> {
    let data = data.open(MAX_UPLOAD_MIB.mebibytes()).into_bytes().await
        .map_err(|e| ApiError::invalid("body", e.to_string()))?;
    if !data.is_complete() {
        return Err(ApiError::TooLarge(format!("Photo exceeds {MAX_UPLOAD_MIB} MiB")));
    }
    let upload = PhotoUpload {
        file_name: file_name.to_string(),
        description: description.unwrap_or_default().to_string(),
        child_ids,
        content_type: content_type.clone(),
        data: data.into_inner(),
    };
    reply(store_photo(&ctx, upload, storage, &db.0).await?)
}

#[get("/api/photos?<child_id>")]
async fn get_photos(child_id: Option<ChildId>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<Vec<PhotoRecord>> {
    reply(list_photos(ctx.nursery_id, child_id, &db.0).await?)
}

#[get("/api/photos/<photo_id>")]
async fn get_photo(photo_id: PhotoId, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<PhotoRecord> {
    reply(load_photo(ctx.nursery_id, photo_id, &db.0).await?)
}

#[get("/api/photos/<photo_id>/content")]
async fn get_photo_content(photo_id: PhotoId, ctx: RequestContext, storage: &State<PhotoStorage>, db: &State<DbPool>) -> ApiResult<(ContentType, Vec<u8>)> {
    photo_content(ctx.nursery_id, photo_id, storage, &db.0).await
}

#[delete("/api/photos/<photo_id>")]
async fn delete_photo_route(photo_id: PhotoId, ctx: RequestContext, storage: &State<PhotoStorage>, db: &State<DbPool>) -> ApiReply<()> {
    reply(delete_photo(ctx.nursery_id, photo_id, storage, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .attach(AdHoc::try_on_ignite("SQLite photo blob store", |rocket| async move {
            let Some(pool) = rocket.state::<DbPool>().map(|db| db.0.clone()) else {
                error!("Photo storage needs the database pool to be managed first");
                return Err(rocket);
            };
            Ok(rocket.manage(PhotoStorage(Box::new(SqliteBlobStore(pool)))))
        }))
        .mount("/", routes![
            post_photo,
            get_photos,
            get_photo,
            get_photo_content,
            delete_photo_route,
        ])
}
