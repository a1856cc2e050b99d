use std::backtrace::Backtrace;
use std::fmt::{Display, Formatter};
use log::{error, warn};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Build, Request, Rocket};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Business and infrastructure failures, each kind maps to one HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Locked(String),
    TooLarge(String),
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError { field: field.to_string(), message: message.into() }])
    }
    pub fn not_found(what: impl Display) -> Self {
        Self::NotFound(format!("{what} not found"))
    }
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
    pub fn status(&self) -> Status {
        match self {
            ApiError::Validation(_) => Status::BadRequest,
            ApiError::Unauthorized(_) => Status::Unauthorized,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::Locked(_) => Status::Locked,
            ApiError::TooLarge(_) => Status::PayloadTooLarge,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Locked(_) => "LOCKED",
            ApiError::TooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
    fn body(&self) -> ErrorBody {
        let (message, fields) = match self {
            ApiError::Validation(fields) => {
                let message = fields.first()
                    .map(|f| format!("{}: {}", f.field, f.message))
                    .unwrap_or_else(|| "Validation failed".to_string());
                (message, fields.clone())
            }
            ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Locked(msg)
            | ApiError::TooLarge(msg)
            | ApiError::Internal(msg) => (msg.clone(), vec![]),
        };
        ErrorBody { code: self.code().to_string(), message, fields }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let body = self.body();
        write!(f, "{}: {}", body.code, body.message)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                warn!("Unique constraint violated: {db_err}");
                ApiError::Conflict("Record already exists".to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                warn!("Foreign key constraint violated: {db_err}");
                ApiError::Conflict("Referenced record is missing or still in use".to_string())
            }
            _ => {
                error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
        ApiError::Internal("Internal server error".to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

/// Uniform response envelope: `{success, data, error}`.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    pub fn failure(err: &ApiError) -> Self {
        Self { success: false, data: None, error: Some(err.body()) }
    }
}

impl<'r, T: Serialize> Responder<'r, 'static> for ApiResponse<T> {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        Json(self).respond_to(req)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        Custom(self.status(), Json(ApiResponse::failure(&self))).respond_to(req)
    }
}

pub type ApiReply<T> = ApiResult<ApiResponse<T>>;

pub fn reply<T: Serialize>(data: T) -> ApiReply<T> {
    Ok(ApiResponse::ok(data))
}

/// Collects field-level failures so a request reports all of them at once.
#[derive(Default, Debug)]
pub struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn check(&mut self, ok: bool, field: &str, message: &str) -> &mut Self {
        if !ok {
            self.errors.push(FieldError { field: field.to_string(), message: message.to_string() });
        }
        self
    }
    pub fn required(&mut self, field: &str, value: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "is required")
    }
    pub fn max_len(&mut self, field: &str, value: &str, max: usize) -> &mut Self {
        let ok = value.chars().count() <= max;
        self.check(ok, field, &format!("must be at most {max} characters"))
    }
    pub fn finish(&mut self) -> ApiResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(std::mem::take(&mut self.errors)))
        }
    }
}

#[catch(default)]
fn default_catcher(status: Status, req: &Request<'_>) -> Custom<Json<ApiResponse<()>>> {
    let err = match status.code {
        400 | 422 => ApiError::invalid("body", "Malformed request"),
        401 => ApiError::Unauthorized("Authentication required".to_string()),
        403 => ApiError::Forbidden("Forbidden".to_string()),
        404 => ApiError::NotFound(format!("No route for {}", req.uri().path())),
        409 => ApiError::Conflict("Conflict".to_string()),
        413 => ApiError::TooLarge("Payload too large".to_string()),
        423 => ApiError::Locked("Account locked".to_string()),
        _ => ApiError::Internal("Internal server error".to_string()),
    };
    Custom(status, Json(ApiResponse::failure(&err)))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.register("/", catchers![default_catcher])
}

#[test]
fn test_validator_collects_all_fields() {
    let mut v = Validator::new();
    v.required("name", " ")
        .check(false, "maxCapacity", "must be positive")
        .max_len("notes", "abc", 2);
    let Err(ApiError::Validation(fields)) = v.finish() else {
        panic!("expected validation error");
    };
    let names = fields.iter().map(|f| f.field.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["name", "maxCapacity", "notes"]);
}

#[test]
fn test_status_mapping() {
    assert_eq!(ApiError::invalid("a", "b").status(), Status::BadRequest);
    assert_eq!(ApiError::not_found("Child 3").status(), Status::NotFound);
    assert_eq!(ApiError::conflict("dup").status(), Status::Conflict);
    assert_eq!(ApiError::Locked("x".into()).status().code, 423);
    let body = ApiResponse::failure(&ApiError::not_found("Class sakura"));
    assert!(!body.success);
    assert_eq!(body.error.unwrap().message, "Class sakura not found");
}
