use rocket::http::Status;
use rocket::local::blocking::Client;
use serde_json::{json, Value};
use crate::academic_years::AcademicYearRecord;
use crate::class_assignments::{ChildAssignmentRecord, ClassWithChildren, ClassWithStaff};
use crate::slide::{SlidePreview, SlideResult, SlideSource};
use super::{async_data_of, async_login, create_async_test_server, create_test_server, data_of, error_code, login, ADMIN, MOMIJI_ADMIN};

fn current_year(client: &Client, auth: &rocket::http::Header<'static>) -> AcademicYearRecord {
    let resp = client.get("/api/academic-years/current").header(auth.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    data_of(resp)
}

fn members(classes: &[ClassWithChildren], class_id: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = classes.iter()
        .find(|c| c.class_id == class_id)
        .map(|c| c.children.iter().map(|m| m.child_id).collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

#[test]
fn preview_shows_staged_and_carried_placements() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.get("/api/academic-years/slide/preview?target_year=2026").header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let preview: SlidePreview = data_of(resp);
    assert_eq!(preview.from_year, 2025);
    assert_eq!(preview.to_year, 2026);
    assert!(preview.target_year_exists);
    assert_eq!(preview.counts.children_total, 5);
    assert_eq!(preview.counts.children_staged, 1);
    assert_eq!(preview.counts.children_carried, 4);
    assert_eq!(preview.counts.children_moving_class, 1);
    assert_eq!(preview.counts.staff_assignments_total, 2);
    assert_eq!(preview.counts.staff_assignments_staged, 1);

    let haruto = preview.children.iter().find(|c| c.child_id == 2).unwrap();
    assert_eq!(haruto.from_class_id.as_deref(), Some("risu"));
    assert_eq!(haruto.to_class_id, "kuma");
    assert_eq!(haruto.source, SlideSource::Staged);
    assert!(haruto.moves_class);
    let aoi = preview.children.iter().find(|c| c.child_id == 1).unwrap();
    assert_eq!(aoi.to_class_id, "hiyoko");
    assert_eq!(aoi.source, SlideSource::Carried);

    // preview writes nothing
    assert_eq!(current_year(&client, &admin).year, 2025);
}

#[test]
fn execute_requires_confirmation() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/academic-years/slide/execute")
        .header(admin.clone())
        .json(&json!({"targetYear": 2026}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
    assert_eq!(error_code(resp), "VALIDATION_ERROR");
    assert_eq!(current_year(&client, &admin).year, 2025);
}

#[test]
fn execute_promotes_everybody_once() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/academic-years/slide/execute")
        .header(admin.clone())
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let result: SlideResult = data_of(resp);
    assert_eq!(result.from_year, 2025);
    assert_eq!(result.to_year, 2026);
    assert_eq!(result.counts.children_total, 5);

    let current = current_year(&client, &admin);
    assert_eq!(current.year, 2026);
    assert!(!current.is_future);
    let resp = client.get("/api/academic-years").header(admin.clone()).dispatch();
    let years: Vec<AcademicYearRecord> = data_of(resp);
    assert_eq!(years.iter().filter(|y| y.is_current).count(), 1);
    let old = years.iter().find(|y| y.year == 2025).unwrap();
    assert!(old.is_archived);
    assert!(!old.is_current);

    let resp = client.get("/api/class-assignments/2026/classes").header(admin.clone()).dispatch();
    let classes: Vec<ClassWithChildren> = data_of(resp);
    assert_eq!(members(&classes, "hiyoko"), vec![1]);
    assert_eq!(members(&classes, "risu"), vec![3]);
    assert_eq!(members(&classes, "kuma"), vec![2, 4, 5]);
    let kuma = classes.iter().find(|c| c.class_id == "kuma").unwrap();
    assert_eq!(kuma.available, 0);

    let resp = client.get("/api/class-assignments/2026/unassigned").header(admin.clone()).dispatch();
    let unassigned: Vec<Value> = data_of(resp);
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0]["id"], 6);

    // history stays where it was
    let resp = client.get("/api/class-assignments/2025/classes").header(admin.clone()).dispatch();
    let classes: Vec<ClassWithChildren> = data_of(resp);
    assert_eq!(members(&classes, "risu"), vec![2, 3]);

    let resp = client.get("/api/staff-class-assignments/2026/classes").header(admin.clone()).dispatch();
    let staff: Vec<ClassWithStaff> = data_of(resp);
    let main_of = |class_id: &str| staff.iter()
        .find(|c| c.class_id == class_id)
        .and_then(|c| c.main.as_ref().map(|m| m.staff_id));
    assert_eq!(main_of("hiyoko"), Some(2));
    assert_eq!(main_of("kuma"), Some(3));
    assert_eq!(main_of("risu"), None);

    // the archived year is read only
    let resp = client.post("/api/class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"childId": 6, "classId": "hiyoko"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    // a second slide to the same year is refused
    let resp = client.post("/api/academic-years/slide/execute")
        .header(admin)
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
}

#[test]
fn slide_target_must_follow_current_year() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.get("/api/academic-years/slide/preview?target_year=2028").header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
    let resp = client.get("/api/academic-years/slide/preview?target_year=2024").header(admin).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn slide_creates_missing_target_year() {
    let client = create_test_server();
    let momiji = login(&client, MOMIJI_ADMIN);
    let resp = client.get("/api/academic-years/slide/preview?target_year=2026").header(momiji.clone()).dispatch();
    let preview: SlidePreview = data_of(resp);
    assert!(!preview.target_year_exists);
    assert!(!preview.warnings.is_empty());
    // still not there after the preview
    let resp = client.get("/api/academic-years/2026").header(momiji.clone()).dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    let resp = client.post("/api/academic-years/slide/execute")
        .header(momiji.clone())
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let current = current_year(&client, &momiji);
    assert_eq!(current.year, 2026);
    assert_eq!(current.start_date.to_string(), "2026-04-01");

    let resp = client.get("/api/class-assignments/2026/classes").header(momiji.clone()).dispatch();
    let classes: Vec<ClassWithChildren> = data_of(resp);
    assert_eq!(members(&classes, "sora"), vec![7]);

    // the other nursery is untouched
    let admin = login(&client, ADMIN);
    assert_eq!(current_year(&client, &admin).year, 2025);
}

#[test]
fn reassigning_is_idempotent() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let assign = |child_id: i64, class_id: &str| client.post("/api/class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"childId": child_id, "classId": class_id}))
        .dispatch();

    let first: ChildAssignmentRecord = data_of(assign(6, "hiyoko"));
    assert!(first.is_current);
    assert!(first.is_active);
    let again: ChildAssignmentRecord = data_of(assign(6, "hiyoko"));
    assert_eq!(again, first);

    let resp = client.delete("/api/class-assignments/2025/children/6").header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.delete("/api/class-assignments/2025/children/6").header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    let back: ChildAssignmentRecord = data_of(assign(6, "hiyoko"));
    assert_eq!(back.assigned_at, first.assigned_at);
    assert_eq!(back.class_id, "hiyoko");
}

#[test]
fn full_class_rejects_assignment() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"childId": 1, "classId": "kuma"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post("/api/class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"childId": 3, "classId": "kuma"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    assert_eq!(error_code(resp), "CONFLICT");

    // bulk assignment is all or nothing
    let resp = client.post("/api/class-assignments/2025/bulk-assign")
        .header(admin.clone())
        .json(&json!({"assignments": [
            {"childId": 6, "classId": "hiyoko"},
            {"childId": 3, "classId": "kuma"},
        ]}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    let resp = client.get("/api/class-assignments/2025/classes").header(admin.clone()).dispatch();
    let classes: Vec<ClassWithChildren> = data_of(resp);
    assert_eq!(members(&classes, "hiyoko"), Vec::<i64>::new());

    let resp = client.post("/api/class-assignments/2025/bulk-assign")
        .header(admin)
        .json(&json!({"assignments": [
            {"childId": 6, "classId": "hiyoko"},
            {"childId": 6, "classId": "risu"},
        ]}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn one_main_teacher_per_class() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/staff-class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"staffId": 2, "classId": "risu", "role": "main"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    let resp = client.post("/api/staff-class-assignments/2025/assign")
        .header(admin.clone())
        .json(&json!({"staffId": 2, "classId": "risu", "role": "assistant"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/staff-class-assignments/2025/classes").header(admin.clone()).dispatch();
    let staff: Vec<ClassWithStaff> = data_of(resp);
    let risu = staff.iter().find(|c| c.class_id == "risu").unwrap();
    assert_eq!(risu.main.as_ref().map(|m| m.staff_id), Some(3));
    assert_eq!(risu.staff.len(), 2);

    let resp = client.delete("/api/staff-class-assignments/2025/3/risu").header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/staff-class-assignments/2025/unassigned").header(admin).dispatch();
    let unassigned: Vec<Value> = data_of(resp);
    assert!(unassigned.iter().any(|s| s["id"] == 3));
}

#[rocket::async_test]
async fn failed_slide_leaves_nothing_behind() {
    let (client, pool) = create_async_test_server().await;
    let momiji = async_login(&client, MOMIJI_ADMIN).await;
    // fails on the very last write, after the year and the assignment rows are in
    sqlx::query("CREATE TRIGGER block_year_flip BEFORE UPDATE OF is_current ON academic_years
            WHEN NEW.is_current=1 AND NEW.year=2026
            BEGIN SELECT RAISE(ABORT, 'year flip blocked'); END")
        .execute(&pool).await.unwrap();

    let resp = client.post("/api/academic-years/slide/execute")
        .header(momiji.clone())
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::InternalServerError);

    let resp = client.get("/api/academic-years/2026").header(momiji.clone()).dispatch().await;
    assert_eq!(resp.status(), Status::NotFound);
    let resp = client.get("/api/academic-years/current").header(momiji.clone()).dispatch().await;
    let current: AcademicYearRecord = async_data_of(resp).await;
    assert_eq!(current.year, 2025);
    assert!(!current.is_archived);

    let count = |sql: &'static str| {
        let pool = pool.clone();
        async move {
            let (n,): (i64,) = sqlx::query_as(sql).fetch_one(&pool).await.unwrap();
            n
        }
    };
    assert_eq!(count("SELECT COUNT(*) FROM child_class_assignments WHERE nursery_id=2 AND academic_year=2026").await, 0);
    assert_eq!(count("SELECT COUNT(*) FROM staff_class_assignments WHERE nursery_id=2 AND academic_year=2026").await, 0);
    assert_eq!(count("SELECT COUNT(*) FROM child_class_assignments WHERE nursery_id=2 AND academic_year=2025 AND is_current=1").await, 1);
    assert_eq!(count("SELECT COUNT(*) FROM staff_class_assignments WHERE nursery_id=2 AND academic_year=2025 AND is_current=1").await, 1);

    sqlx::query("DROP TRIGGER block_year_flip").execute(&pool).await.unwrap();
    let resp = client.post("/api/academic-years/slide/execute")
        .header(momiji)
        .json(&json!({"targetYear": 2026, "confirmed": true}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(count("SELECT COUNT(*) FROM child_class_assignments WHERE nursery_id=2 AND academic_year=2026 AND is_current=1").await, 1);
}
