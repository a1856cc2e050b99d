use rocket::figment::Figment;
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous;
use rocket::local::blocking::{Client, LocalResponse};
use sqlx::SqlitePool;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use crate::db::DbPool;
use crate::error::ApiResponse;
use crate::staff::StaffRecord;

mod records;
mod slide;

pub(crate) const ADMIN: (&str, &str) = ("admin", "admin-pass-1");
pub(crate) const TEACHER: (&str, &str) = ("tanaka", "teacher-pass-1");
pub(crate) const MOMIJI_ADMIN: (&str, &str) = ("momiji-admin", "admin-pass-2");

fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(("database_url", "sqlite::memory:"))
        .merge(("seed_file", "tests/data/demo.yaml"))
        .merge(("log_level", "off"))
}

pub(crate) fn create_test_server() -> Client {
    Client::tracked(super::build(test_figment())).unwrap()
}

/// Async client for tests that also talk to the database directly.
pub(crate) async fn create_async_test_server() -> (asynchronous::Client, SqlitePool) {
    let client = asynchronous::Client::tracked(super::build(test_figment())).await.unwrap();
    let pool = client.rocket().state::<DbPool>().unwrap().0.clone();
    (client, pool)
}

pub(crate) async fn async_login(client: &asynchronous::Client, (login_id, password): (&str, &str)) -> Header<'static> {
    let resp = client.post("/api/auth/login")
        .json(&json!({"loginId": login_id, "password": password}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::Ok);
    let data: Value = async_data_of(resp).await;
    let token = data["token"].as_str().unwrap();
    Header::new("Authorization", format!("Bearer {token}"))
}

pub(crate) async fn async_data_of<T: DeserializeOwned + Send + 'static>(resp: asynchronous::LocalResponse<'_>) -> T {
    let body = resp.into_json::<ApiResponse<T>>().await.unwrap();
    assert!(body.success);
    body.data.unwrap()
}

pub(crate) fn login(client: &Client, (login_id, password): (&str, &str)) -> Header<'static> {
    let resp = client.post("/api/auth/login")
        .json(&json!({"loginId": login_id, "password": password}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let data: Value = data_of(resp);
    let token = data["token"].as_str().unwrap();
    Header::new("Authorization", format!("Bearer {token}"))
}

pub(crate) fn data_of<T: DeserializeOwned + Send + 'static>(resp: LocalResponse) -> T {
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    let body = resp.into_json::<ApiResponse<T>>().unwrap();
    assert!(body.success);
    assert!(body.error.is_none());
    body.data.unwrap()
}

pub(crate) fn error_code(resp: LocalResponse) -> String {
    let body = resp.into_json::<ApiResponse<Value>>().unwrap();
    assert!(!body.success);
    body.error.unwrap().code
}

#[test]
fn login_and_me() {
    let client = create_test_server();
    let auth = login(&client, ADMIN);
    let resp = client.get("/api/auth/me").header(auth.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let me: StaffRecord = data_of(resp);
    assert_eq!(me.login_id, "admin");
    assert_eq!(me.nursery_id, 1);

    let resp = client.post("/api/auth/logout").header(auth.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/auth/me").header(auth).dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn missing_token_is_unauthorized() {
    let client = create_test_server();
    let resp = client.get("/api/children").dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
    assert_eq!(error_code(resp), "UNAUTHORIZED");

    let resp = client.get("/api/children")
        .header(Header::new("Authorization", "Bearer no-such-token"))
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn public_routes_need_no_token() {
    let client = create_test_server();
    let resp = client.get("/api/allergens").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let allergens: Vec<Value> = data_of(resp);
    assert_eq!(allergens.len(), 10);

    let resp = client.get("/api/application/nursery/1").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let info: Value = data_of(resp);
    assert_eq!(info["name"], "Sakura Nursery");
    assert_eq!(info["classes"].as_array().unwrap().len(), 3);
}

#[test]
fn lockout_after_failed_logins() {
    let client = create_test_server();
    let wrong = json!({"loginId": "tanaka", "password": "wrong"});
    for _ in 0..4 {
        let resp = client.post("/api/auth/login").json(&wrong).dispatch();
        assert_eq!(resp.status(), Status::Unauthorized);
    }
    let resp = client.post("/api/auth/login").json(&wrong).dispatch();
    assert_eq!(resp.status(), Status::Locked);
    assert_eq!(error_code(resp), "LOCKED");

    // the right password does not help while locked
    let right = json!({"loginId": TEACHER.0, "password": TEACHER.1});
    let resp = client.post("/api/auth/login").json(&right).dispatch();
    assert_eq!(resp.status(), Status::Locked);

    let admin = login(&client, ADMIN);
    let resp = client.post("/api/staff/2/unlock").header(admin).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post("/api/auth/login").json(&right).dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn teacher_cannot_manage_staff() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let resp = client.post("/api/staff/3/unlock").header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
    assert_eq!(error_code(resp), "FORBIDDEN");
    let resp = client.post("/api/academic-years/slide/execute")
        .header(teacher)
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
}

#[test]
fn nurseries_do_not_see_each_other() {
    let client = create_test_server();
    let momiji = login(&client, MOMIJI_ADMIN);
    let resp = client.get("/api/children/1").header(momiji.clone()).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    assert_eq!(error_code(resp), "NOT_FOUND");
    let resp = client.get("/api/children").header(momiji).dispatch();
    let children: Vec<Value> = data_of(resp);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["name"], "Kato Kai");
}

#[test]
fn malformed_json_is_a_validation_error() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/children")
        .header(admin)
        .header(ContentType::JSON)
        .body("{\"name\": ")
        .dispatch();
    assert!(resp.status() == Status::UnprocessableEntity || resp.status() == Status::BadRequest);
    assert_eq!(error_code(resp), "VALIDATION_ERROR");
}

#[test]
fn unknown_route_is_json_not_found() {
    let client = create_test_server();
    let resp = client.get("/api/no-such-thing").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    assert_eq!(error_code(resp), "NOT_FOUND");
}
