use chrono::Duration;
use rocket::http::{ContentType, Status};
use serde_json::{json, Value};
use crate::announcements::{AnnouncementStatus, DeliveryStatus, PublishResult};
use crate::applications::{AcceptResult, ApplicationStatus, ApplicationStatusView};
use crate::attendance::{AttendanceRecord, AttendanceStatus, ChildStatsReport, GroupStatsReport, YearlyStatsReport};
use crate::daily_reports::{DailyReportRecord, ReportStatus};
use crate::dates;
use crate::entry_exit::MovementResult;
use crate::photos::PhotoRecord;
use crate::util::test::zip_data;
use super::{async_login, create_async_test_server, create_test_server, data_of, error_code, login, ADMIN, TEACHER};

#[test]
fn attendance_upsert_and_class_list() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let put = |child_id: i64, body: Value| client.put(format!("/api/attendance/{child_id}/2025-06-02"))
        .header(teacher.clone())
        .json(&body)
        .dispatch();

    let resp = put(2, json!({"status": "absent", "notes": "fever"}));
    assert_eq!(resp.status(), Status::Ok);
    let resp = put(2, json!({"status": "present", "arrivalTime": "08:45"}));
    let rec: AttendanceRecord = data_of(resp);
    assert_eq!(rec.status, AttendanceStatus::Present);
    assert_eq!(rec.arrival_time.as_deref(), Some("08:45"));
    assert_eq!(rec.child_name, "Ito Haruto");
    assert_eq!(rec.recorded_by, 2);
    let resp = put(4, json!({"status": "tardy", "arrivalTime": "09:40"}));
    assert_eq!(resp.status(), Status::Ok);

    let resp = put(1, json!({"status": "absent", "arrivalTime": "09:00"}));
    assert_eq!(resp.status(), Status::BadRequest);
    let resp = put(99, json!({"status": "present"}));
    assert_eq!(resp.status(), Status::NotFound);
    let tomorrow = dates::today() + Duration::days(1);
    let resp = client.put(format!("/api/attendance/1/{tomorrow}"))
        .header(teacher.clone())
        .json(&json!({"status": "present"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.get("/api/attendance?date=2025-06-02&class_id=risu").header(teacher.clone()).dispatch();
    let records: Vec<AttendanceRecord> = data_of(resp);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].child_id, 2);
    let resp = client.get("/api/attendance?date=2025-06-02").header(teacher).dispatch();
    let records: Vec<AttendanceRecord> = data_of(resp);
    assert_eq!(records.len(), 2);
}

#[test]
fn attendance_stats_and_export() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let resp = client.post("/api/attendance/bulk")
        .header(teacher.clone())
        .json(&json!({"date": "2025-06-02", "records": [
            {"childId": 2, "status": "present", "arrivalTime": "08:30", "departureTime": "16:00"},
            {"childId": 3, "status": "absent"},
        ]}))
        .dispatch();
    let records: Vec<AttendanceRecord> = data_of(resp);
    assert_eq!(records.len(), 2);
    let resp = client.post("/api/attendance/bulk")
        .header(teacher.clone())
        .json(&json!({"date": "2025-06-03", "records": [
            {"childId": 2, "status": "tardy", "arrivalTime": "10:00"},
            {"childId": 3, "status": "present"},
        ]}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post("/api/attendance/bulk")
        .header(teacher.clone())
        .json(&json!({"date": "2025-06-04", "records": [
            {"childId": 2, "status": "present"},
            {"childId": 2, "status": "absent"},
        ]}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.get("/api/attendance/stats/class/risu?from=2025-06-01&to=2025-06-30").header(teacher.clone()).dispatch();
    let report: GroupStatsReport = data_of(resp);
    assert_eq!(report.children.len(), 2);
    assert_eq!(report.totals.total_days, 4);
    assert_eq!(report.totals.present_days, 3);
    assert_eq!(report.totals.rate, Some(75.0));
    let haruto = report.children.iter().find(|c| c.child_id == 2).unwrap();
    assert_eq!(haruto.counts.rate, Some(100.0));

    let resp = client.get("/api/attendance/stats/child/6?from=2025-06-01&to=2025-06-30").header(teacher.clone()).dispatch();
    let report: ChildStatsReport = data_of(resp);
    assert_eq!(report.counts.total_days, 0);
    assert_eq!(report.counts.rate, None);

    let resp = client.get("/api/attendance/stats/monthly?month=2025-06").header(teacher.clone()).dispatch();
    let report: GroupStatsReport = data_of(resp);
    assert_eq!(report.totals.total_days, 4);
    // every active child is listed, with or without records
    assert_eq!(report.children.len(), 6);

    let resp = client.get("/api/attendance/stats/yearly?year=2025").header(teacher.clone()).dispatch();
    let report: YearlyStatsReport = data_of(resp);
    assert_eq!(report.months.len(), 12);
    assert_eq!(report.totals.total_days, 4);

    let resp = client.get("/api/attendance/export?from=2025-06-01&to=2025-06-30").header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::CSV));
    let csv = resp.into_string().unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "date,child_id,child_name,status,arrival_time,departure_time,notes");
    assert!(lines[1].starts_with("2025-06-02,2,Ito Haruto,present,08:30,16:00"));

    let resp = client.get("/api/attendance/export?from=2025-06-30&to=2025-06-01").header(teacher).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn entry_and_exit_update_attendance() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let log = |body: Value| client.post("/api/entry-exit").header(teacher.clone()).json(&body).dispatch();

    let resp = log(json!({"childId": 1, "kind": "entry", "time": "08:30", "guardianName": "Sato Emi"}));
    let res: MovementResult = data_of(resp);
    assert_eq!(res.attendance.status, AttendanceStatus::Present);
    assert_eq!(res.attendance.arrival_time.as_deref(), Some("08:30"));
    assert_eq!(res.log.logged_by, 2);

    let resp = log(json!({"childId": 1, "kind": "exit", "time": "12:00"}));
    assert_eq!(resp.status(), Status::Ok);
    // back again in the afternoon, the first arrival is kept
    let resp = log(json!({"childId": 1, "kind": "entry", "time": "13:00"}));
    let res: MovementResult = data_of(resp);
    assert_eq!(res.attendance.arrival_time.as_deref(), Some("08:30"));
    let resp = log(json!({"childId": 1, "kind": "exit", "time": "17:15"}));
    let res: MovementResult = data_of(resp);
    assert_eq!(res.attendance.departure_time.as_deref(), Some("17:15"));

    let resp = log(json!({"childId": 1, "kind": "entry", "time": "25:00"}));
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.get(format!("/api/entry-exit?date={}&child_id=1", dates::today())).header(teacher.clone()).dispatch();
    let logs: Vec<Value> = data_of(resp);
    assert_eq!(logs.len(), 4);

    let admin = login(&client, ADMIN);
    let resp = client.delete("/api/children/6").header(admin).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = log(json!({"childId": 6, "kind": "entry"}));
    assert_eq!(resp.status(), Status::Conflict);
}

#[test]
fn photo_upload_download_and_delete() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let image = b"\x89PNG\r\n\x1a\nnot-really-a-png";

    let resp = client.post("/api/photos?file_name=sandbox.png&description=Sandbox&child_ids=1&child_ids=2")
        .header(teacher.clone())
        .header(ContentType::PNG)
        .body(&image[..])
        .dispatch();
    let photo: PhotoRecord = data_of(resp);
    assert_eq!(photo.content_type, "image/png");
    assert_eq!(photo.size, image.len() as i64);
    assert_eq!(photo.child_ids, vec![1, 2]);

    let compressed = zip_data(image).unwrap();
    let resp = client.post("/api/photos?file_name=lunch.jpg&child_ids=2")
        .header(teacher.clone())
        .header(ContentType::ZIP)
        .body(compressed)
        .dispatch();
    let zipped: PhotoRecord = data_of(resp);
    assert_eq!(zipped.content_type, "image/jpeg");
    assert_eq!(zipped.size, image.len() as i64);

    let resp = client.get(format!("/api/photos/{}/content", zipped.id)).header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JPEG));
    assert_eq!(resp.into_bytes().unwrap(), image.to_vec());

    let resp = client.get("/api/photos?child_id=1").header(teacher.clone()).dispatch();
    let photos: Vec<PhotoRecord> = data_of(resp);
    assert_eq!(photos.len(), 1);
    let resp = client.get("/api/photos?child_id=2").header(teacher.clone()).dispatch();
    let photos: Vec<PhotoRecord> = data_of(resp);
    assert_eq!(photos.len(), 2);

    let resp = client.post("/api/photos?file_name=notes.txt")
        .header(teacher.clone())
        .header(ContentType::Plain)
        .body("hello")
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.delete(format!("/api/photos/{}", photo.id)).header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/photos/{}/content", photo.id)).header(teacher).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn compressed_photo_is_limited_after_inflating() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let zeros = vec![0u8; 51 * 1024 * 1024];
    let compressed = zip_data(&zeros).unwrap();
    assert!(compressed.len() < 1024 * 1024);
    drop(zeros);

    let resp = client.post("/api/photos?file_name=zeros.png")
        .header(teacher.clone())
        .header(ContentType::ZIP)
        .body(compressed)
        .dispatch();
    assert_eq!(resp.status(), Status::PayloadTooLarge);
    assert_eq!(error_code(resp), "PAYLOAD_TOO_LARGE");
    let resp = client.get("/api/photos").header(teacher).dispatch();
    let photos: Vec<PhotoRecord> = data_of(resp);
    assert!(photos.is_empty());
}

#[rocket::async_test]
async fn failed_photo_insert_drops_the_blob() {
    let (client, pool) = create_async_test_server().await;
    let teacher = async_login(&client, TEACHER).await;
    sqlx::query("CREATE TRIGGER block_photo_tags BEFORE INSERT ON photo_children
            BEGIN SELECT RAISE(ABORT, 'tagging blocked'); END")
        .execute(&pool).await.unwrap();

    let resp = client.post("/api/photos?file_name=garden.png&child_ids=1")
        .header(teacher)
        .header(ContentType::PNG)
        .body(&b"\x89PNG\r\n\x1a\ngarden"[..])
        .dispatch().await;
    assert_eq!(resp.status(), Status::InternalServerError);
    let (photos,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM photos").fetch_one(&pool).await.unwrap();
    assert_eq!(photos, 0);
    let (blobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs").fetch_one(&pool).await.unwrap();
    assert_eq!(blobs, 0);
}

#[test]
fn failed_logins_are_counted_in_the_database() {
    let client = create_test_server();
    let wrong = json!({"loginId": "suzuki", "password": "wrong"});
    for _ in 0..2 {
        let resp = client.post("/api/auth/login").json(&wrong).dispatch();
        assert_eq!(resp.status(), Status::Unauthorized);
    }
    let admin = login(&client, ADMIN);
    let resp = client.get("/api/staff/3").header(admin).dispatch();
    let staff: Value = data_of(resp);
    assert_eq!(staff["failedLoginCount"], 2);
}

#[test]
fn application_submit_and_accept() {
    let client = create_test_server();
    let submit = json!({
        "nurseryId": 1,
        "childName": "Hayashi Rin",
        "childDateOfBirth": "2023-01-20",
        "guardianName": "Hayashi Mai",
        "guardianPhone": "090-3333-0001",
        "guardianEmail": "mai@example.com",
    });
    let resp = client.post("/api/application/submit").json(&submit).dispatch();
    let view: ApplicationStatusView = data_of(resp);
    assert_eq!(view.status, ApplicationStatus::Pending);
    assert_eq!(view.reference_code.len(), 10);

    let resp = client.get(format!("/api/application/status/{}", view.reference_code)).dispatch();
    let status: ApplicationStatusView = data_of(resp);
    assert_eq!(status.child_name, "Hayashi Rin");

    let resp = client.post("/api/application/submit")
        .json(&json!({"nurseryId": 1, "childName": "", "childDateOfBirth": "2023-01-20", "guardianName": "x", "guardianPhone": "abc"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let admin = login(&client, ADMIN);
    let resp = client.get("/api/applications?status=pending").header(admin.clone()).dispatch();
    let pending: Vec<Value> = data_of(resp);
    assert_eq!(pending.len(), 1);
    let id = pending[0]["id"].as_i64().unwrap();

    let resp = client.post(format!("/api/applications/{id}/accept"))
        .header(admin.clone())
        .json(&json!({"classId": "hiyoko", "reviewNote": "welcome"}))
        .dispatch();
    let accepted: AcceptResult = data_of(resp);
    assert_eq!(accepted.application.status, ApplicationStatus::Accepted);
    assert_eq!(accepted.application.created_child_id, Some(accepted.child_id));
    let assignment = accepted.assignment.unwrap();
    assert_eq!(assignment.academic_year, 2025);
    assert_eq!(assignment.class_id, "hiyoko");

    let resp = client.get(format!("/api/children/{}", accepted.child_id)).header(admin.clone()).dispatch();
    let child: Value = data_of(resp);
    assert_eq!(child["name"], "Hayashi Rin");

    let resp = client.post(format!("/api/applications/{id}/reject"))
        .header(admin.clone())
        .json(&json!({"reason": "too late"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    assert_eq!(error_code(resp), "CONFLICT");
    let resp = client.get(format!("/api/applications/{id}")).header(admin.clone()).dispatch();
    let app: Value = data_of(resp);
    assert_eq!(app["status"], "accepted");
    assert_eq!(app["createdChildId"], accepted.child_id);

    let resp = client.get(format!("/api/application/status/{}", view.reference_code)).dispatch();
    let status: ApplicationStatusView = data_of(resp);
    assert_eq!(status.status, ApplicationStatus::Accepted);
    assert_eq!(status.review_note, "welcome");
}

#[test]
fn application_reject_needs_reason() {
    let client = create_test_server();
    let resp = client.post("/api/application/submit")
        .json(&json!({"nurseryId": 2, "childName": "Ueda Sora", "childDateOfBirth": "2022-03-03",
            "guardianName": "Ueda Ami", "guardianPhone": "080 1234 5678"}))
        .dispatch();
    let view: ApplicationStatusView = data_of(resp);

    let momiji = login(&client, super::MOMIJI_ADMIN);
    let resp = client.get("/api/applications").header(momiji.clone()).dispatch();
    let list: Vec<Value> = data_of(resp);
    let id = list[0]["id"].as_i64().unwrap();
    let resp = client.post(format!("/api/applications/{id}/reject"))
        .header(momiji.clone())
        .json(&json!({"reason": " "}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
    let resp = client.post(format!("/api/applications/{id}/reject"))
        .header(momiji.clone())
        .json(&json!({"reason": "no places left"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post(format!("/api/applications/{id}/reject"))
        .header(momiji.clone())
        .json(&json!({"reason": "changed my mind"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    let resp = client.get(format!("/api/application/status/{}", view.reference_code)).dispatch();
    let status: ApplicationStatusView = data_of(resp);
    assert_eq!(status.status, ApplicationStatus::Rejected);
    assert_eq!(status.review_note, "no places left");

    // nursery 1 never sees it
    let admin = login(&client, ADMIN);
    let resp = client.get(format!("/api/applications/{id}")).header(admin).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn daily_report_lifecycle() {
    let client = create_test_server();
    let teacher = login(&client, TEACHER);
    let resp = client.post("/api/daily-reports")
        .header(teacher.clone())
        .json(&json!({"childId": 1, "reportDate": "2025-06-02", "mood": "good", "meal": "all", "nap": "13:00-14:30"}))
        .dispatch();
    let report: DailyReportRecord = data_of(resp);
    assert_eq!(report.status, ReportStatus::Draft);
    assert_eq!(report.staff_id, 2);

    let resp = client.put(format!("/api/daily-reports/{}", report.id))
        .header(teacher.clone())
        .json(&json!({"content": "Played in the sandbox"}))
        .dispatch();
    let updated: DailyReportRecord = data_of(resp);
    assert_eq!(updated.content, "Played in the sandbox");
    assert_eq!(updated.mood, "good");

    let resp = client.put(format!("/api/daily-reports/{}", report.id))
        .header(teacher.clone())
        .json(&json!({}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.post(format!("/api/daily-reports/{}/publish", report.id)).header(teacher.clone()).dispatch();
    let published: DailyReportRecord = data_of(resp);
    assert_eq!(published.status, ReportStatus::Published);
    let resp = client.post(format!("/api/daily-reports/{}/publish", report.id)).header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    let resp = client.delete(format!("/api/daily-reports/{}", report.id)).header(teacher.clone()).dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    let resp = client.get("/api/daily-reports?date=2025-06-02&child_id=1").header(teacher).dispatch();
    let reports: Vec<DailyReportRecord> = data_of(resp);
    assert_eq!(reports.len(), 1);
}

#[test]
fn announcement_publish_records_notification() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/announcements")
        .header(admin.clone())
        .json(&json!({"title": "Summer festival", "content": "Saturday 10:00", "category": "event"}))
        .dispatch();
    let created: Value = data_of(resp);
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["status"], "draft");
    assert_eq!(created["priority"], "normal");

    let resp = client.post(format!("/api/announcements/{id}/publish")).header(admin.clone()).dispatch();
    let published: PublishResult = data_of(resp);
    assert_eq!(published.announcement.status, AnnouncementStatus::Published);
    assert!(published.announcement.published_at.is_some());
    assert_eq!(published.notification.status, DeliveryStatus::Skipped);
    assert_eq!(published.notification.channel, "log");

    let resp = client.put(format!("/api/announcements/{id}"))
        .header(admin.clone())
        .json(&json!({"title": "Changed"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    let resp = client.post(format!("/api/announcements/{id}/publish")).header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    let resp = client.get("/api/announcements?status=published").header(admin.clone()).dispatch();
    let list: Vec<Value> = data_of(resp);
    assert_eq!(list.len(), 1);
    let resp = client.get("/api/announcements?status=bogus").header(admin).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn menus_with_allergens() {
    let client = create_test_server();
    let admin = login(&client, ADMIN);
    let resp = client.post("/api/menus")
        .header(admin.clone())
        .json(&json!({"menuDate": "2025-06-02", "mealType": "lunch", "description": "Omelette rice", "allergenIds": [2, 1, 1]}))
        .dispatch();
    let menu: Value = data_of(resp);
    assert_eq!(menu["allergenIds"], json!([1, 2]));
    let id = menu["id"].as_i64().unwrap();

    let resp = client.post("/api/menus")
        .header(admin.clone())
        .json(&json!({"menuDate": "2025-06-02", "mealType": "lunch", "description": "Again"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    let resp = client.post("/api/menus")
        .header(admin.clone())
        .json(&json!({"menuDate": "2025-06-02", "mealType": "snack", "description": "Cookies", "allergenIds": [99]}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.put(format!("/api/menus/{id}"))
        .header(admin.clone())
        .json(&json!({"allergenIds": [3]}))
        .dispatch();
    let menu: Value = data_of(resp);
    assert_eq!(menu["allergenIds"], json!([3]));
    assert_eq!(menu["description"], "Omelette rice");

    let resp = client.get("/api/menus?from=2025-06-01&to=2025-06-07").header(admin.clone()).dispatch();
    let menus: Vec<Value> = data_of(resp);
    assert_eq!(menus.len(), 1);
    let resp = client.delete(format!("/api/menus/{id}")).header(admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/menus/{id}")).header(admin).dispatch();
    assert_eq!(error_code(resp), "NOT_FOUND");
}
