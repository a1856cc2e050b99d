use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::serde::json::Json;
use rocket::{Build, Request, Rocket, State};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult, Validator};
use crate::staff::{load_staff, StaffRecord};
use crate::text_enum;
use crate::util::{generate_random_string, generate_token};
use crate::dates;

pub type NurseryId = i64;
pub type StaffId = i64;

text_enum! {
    pub enum Role {
        Admin => "admin",
        Teacher => "teacher",
    }
}

const SALT_LEN: usize = 16;

pub fn hash_password(password: &str) -> String {
    let salt = generate_random_string(SALT_LEN);
    format!("{salt}${}", salted_digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    salted_digest(salt, password) == digest
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of the staff member behind a bearer token.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub nursery_id: NurseryId,
    pub staff_id: StaffId,
    pub role: Role,
    #[serde(skip)]
    pub token: String,
}

impl RequestContext {
    pub fn require_admin(&self) -> ApiResult<()> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Administrator role required".to_string()))
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    token: String,
    nursery_id: NurseryId,
    staff_id: StaffId,
    role: Role,
    expires_at: DateTime<Utc>,
}

async fn load_session(token: &str, pool: &SqlitePool) -> ApiResult<Option<RequestContext>> {
    let row: Option<SessionRow> = sqlx::query_as(
        "SELECT s.token, s.nursery_id, s.staff_id, st.role, s.expires_at
         FROM sessions s JOIN staff st ON st.id = s.staff_id
         WHERE s.token=? AND st.is_active=1")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(row.filter(|r| r.expires_at > dates::now()).map(|r| RequestContext {
        nursery_id: r.nursery_id,
        staff_id: r.staff_id,
        role: r.role,
        token: r.token,
    }))
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestContext {
    type Error = ApiError;
    async fn from_request(request: &'r Request<'_>) -> Outcome<RequestContext, ApiError> {
        let Some(token) = request.headers().get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty()) else {
            return Outcome::Error((Status::Unauthorized, ApiError::Unauthorized("Missing bearer token".to_string())));
        };
        let Some(db) = request.rocket().state::<DbPool>() else {
            return Outcome::Error((Status::InternalServerError, ApiError::Internal("Database not available".to_string())));
        };
        match load_session(token, &db.0).await {
            Ok(Some(ctx)) => Outcome::Success(ctx),
            Ok(None) => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized("Session expired".to_string()))),
            Err(e) => Outcome::Error((e.status(), e)),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub login_id: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub staff_id: StaffId,
    pub nursery_id: NurseryId,
    pub name: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct Credentials {
    id: StaffId,
    nursery_id: NurseryId,
    name: String,
    role: Role,
    password_hash: String,
    is_active: bool,
    locked_until: Option<DateTime<Utc>>,
}

pub async fn login(req: &LoginRequest, cfg: &AppConfig, pool: &SqlitePool) -> ApiResult<LoginResponse> {
    Validator::new()
        .required("loginId", &req.login_id)
        .required("password", &req.password)
        .finish()?;
    let invalid = || ApiError::Unauthorized("Invalid login id or password".to_string());
    let creds: Credentials = sqlx::query_as(
        "SELECT id, nursery_id, name, role, password_hash, is_active, locked_until
         FROM staff WHERE login_id=?")
        .bind(req.login_id.trim())
        .fetch_optional(pool)
        .await?
        .ok_or_else(invalid)?;
    if !creds.is_active {
        return Err(invalid());
    }
    let now = dates::now();
    if let Some(locked_until) = creds.locked_until.filter(|t| *t > now) {
        return Err(ApiError::Locked(format!("Account locked until {}", locked_until.to_rfc3339())));
    }
    if !verify_password(&req.password, &creds.password_hash) {
        let (failed,): (i64,) = sqlx::query_as("UPDATE staff SET failed_login_count=failed_login_count+1 WHERE id=? RETURNING failed_login_count")
            .bind(creds.id)
            .fetch_one(pool).await?;
        if failed >= cfg.max_failed_logins {
            let locked_until = now + Duration::minutes(cfg.lock_minutes);
            sqlx::query("UPDATE staff SET failed_login_count=0, locked_until=? WHERE id=?")
                .bind(locked_until)
                .bind(creds.id)
                .execute(pool).await?;
            warn!("Staff id: {} locked after {failed} failed logins", creds.id);
            return Err(ApiError::Locked(format!("Account locked until {}", locked_until.to_rfc3339())));
        }
        return Err(invalid());
    }
    sqlx::query("UPDATE staff SET failed_login_count=0, locked_until=NULL WHERE id=?")
        .bind(creds.id)
        .execute(pool).await?;
    let token = generate_token(40);
    let expires_at = now + Duration::hours(cfg.session_hours);
    sqlx::query("INSERT INTO sessions (token, nursery_id, staff_id, created_at, expires_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&token)
        .bind(creds.nursery_id)
        .bind(creds.id)
        .bind(now)
        .bind(expires_at)
        .execute(pool).await?;
    info!("Staff log in, id: {}, nursery: {}", creds.id, creds.nursery_id);
    Ok(LoginResponse {
        token,
        staff_id: creds.id,
        nursery_id: creds.nursery_id,
        name: creds.name,
        role: creds.role,
        expires_at,
    })
}

#[post("/api/auth/login", data = "<req>")]
async fn post_login(req: Json<LoginRequest>, cfg: &State<AppConfig>, db: &State<DbPool>) -> ApiReply<LoginResponse> {
    reply(login(&req, cfg, &db.0).await?)
}

#[post("/api/auth/logout")]
async fn post_logout(ctx: RequestContext, db: &State<DbPool>) -> ApiReply<()> {
    sqlx::query("DELETE FROM sessions WHERE token=?")
        .bind(&ctx.token)
        .execute(&db.0).await?;
    reply(())
}

#[get("/api/auth/me")]
async fn get_me(ctx: RequestContext, db: &State<DbPool>) -> ApiReply<StaffRecord> {
    reply(load_staff(ctx.nursery_id, ctx.staff_id, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_login,
            post_logout,
            get_me,
        ])
}

#[test]
fn test_password_hash_roundtrip() {
    let stored = hash_password("hoikuen-2025");
    assert!(verify_password("hoikuen-2025", &stored));
    assert!(!verify_password("hoikuen-2026", &stored));
    assert!(!verify_password("hoikuen-2025", "garbage"));
    // salted, so the same password never hashes the same twice
    assert_ne!(stored, hash_password("hoikuen-2025"));
}
