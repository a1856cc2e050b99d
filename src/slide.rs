//! Academic year slide: promotes child and staff placements from the current year into the next one.
//!
//! Rows staged ahead of time in the target year (`is_future`) win over the current placement;
//! anyone without a staged row is carried forward into the class they are in now. Past rows are
//! kept as history, only their `is_current` flag is cleared.

use std::collections::{BTreeMap, HashMap, HashSet};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::academic_years::{find_current_year, find_year, insert_year, AcademicYearRecord, Year};
use crate::auth::{NurseryId, RequestContext, StaffId};
use crate::children::ChildId;
use crate::class_assignments::AssignmentRole;
use crate::classes::ClassRecord;
use crate::db::DbPool;
use crate::error::{reply, ApiError, ApiReply, ApiResult};
use crate::{dates, text_enum};

text_enum! {
    pub enum SlideSource {
        Staged => "staged",
        Carried => "carried",
    }
}

#[derive(FromRow, Clone, Debug)]
pub(crate) struct ChildPlacement {
    pub child_id: ChildId,
    pub child_name: String,
    pub class_id: String,
}

#[derive(FromRow, Clone, Debug)]
pub(crate) struct StaffPlacement {
    pub staff_id: StaffId,
    pub staff_name: String,
    pub class_id: String,
    pub role: AssignmentRole,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildMove {
    pub child_id: ChildId,
    pub child_name: String,
    pub from_class_id: Option<String>,
    pub to_class_id: String,
    pub source: SlideSource,
    pub moves_class: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaffMove {
    pub staff_id: StaffId,
    pub staff_name: String,
    pub class_id: String,
    pub role: AssignmentRole,
    pub source: SlideSource,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlideCounts {
    pub children_total: usize,
    pub children_staged: usize,
    pub children_carried: usize,
    pub children_moving_class: usize,
    /// Staged in the target year without any placement in the current one.
    pub children_new: usize,
    pub staff_assignments_total: usize,
    pub staff_assignments_staged: usize,
    pub staff_assignments_carried: usize,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SlidePreview {
    pub nursery_id: NurseryId,
    pub from_year: Year,
    pub to_year: Year,
    pub target_year_exists: bool,
    pub children: Vec<ChildMove>,
    pub staff: Vec<StaffMove>,
    pub counts: SlideCounts,
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SlideResult {
    pub nursery_id: NurseryId,
    pub from_year: Year,
    pub to_year: Year,
    pub counts: SlideCounts,
    pub warnings: Vec<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSlideRequest {
    pub target_year: Year,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SlidePlan {
    pub children: Vec<ChildMove>,
    pub staff: Vec<StaffMove>,
    pub counts: SlideCounts,
}

/// Pure projection of what a slide does, given the active rows of both years.
pub(crate) fn plan_slide(current_children: &[ChildPlacement],
                         staged_children: &[ChildPlacement],
                         current_staff: &[StaffPlacement],
                         staged_staff: &[StaffPlacement]) -> SlidePlan {
    let mut plan = SlidePlan::default();
    let staged_by_child = staged_children.iter()
        .map(|p| (p.child_id, p))
        .collect::<HashMap<_, _>>();
    let mut placed_now = HashSet::new();
    for cur in current_children {
        placed_now.insert(cur.child_id);
        let (to_class_id, source) = match staged_by_child.get(&cur.child_id) {
            Some(staged) => (staged.class_id.clone(), SlideSource::Staged),
            None => (cur.class_id.clone(), SlideSource::Carried),
        };
        plan.children.push(ChildMove {
            child_id: cur.child_id,
            child_name: cur.child_name.clone(),
            moves_class: to_class_id != cur.class_id,
            from_class_id: Some(cur.class_id.clone()),
            to_class_id,
            source,
        });
    }
    for staged in staged_children.iter().filter(|p| !placed_now.contains(&p.child_id)) {
        plan.children.push(ChildMove {
            child_id: staged.child_id,
            child_name: staged.child_name.clone(),
            from_class_id: None,
            to_class_id: staged.class_id.clone(),
            source: SlideSource::Staged,
            moves_class: false,
        });
        plan.counts.children_new += 1;
    }

    // a staff member with anything staged keeps exactly the staged set
    let staged_staff_ids = staged_staff.iter().map(|p| p.staff_id).collect::<HashSet<_>>();
    for cur in current_staff.iter().filter(|p| !staged_staff_ids.contains(&p.staff_id)) {
        plan.staff.push(StaffMove {
            staff_id: cur.staff_id,
            staff_name: cur.staff_name.clone(),
            class_id: cur.class_id.clone(),
            role: cur.role,
            source: SlideSource::Carried,
        });
    }
    for staged in staged_staff {
        plan.staff.push(StaffMove {
            staff_id: staged.staff_id,
            staff_name: staged.staff_name.clone(),
            class_id: staged.class_id.clone(),
            role: staged.role,
            source: SlideSource::Staged,
        });
    }

    let counts = &mut plan.counts;
    counts.children_total = plan.children.len();
    counts.children_staged = plan.children.iter().filter(|m| m.source == SlideSource::Staged).count();
    counts.children_carried = plan.children.iter().filter(|m| m.source == SlideSource::Carried).count();
    counts.children_moving_class = plan.children.iter().filter(|m| m.moves_class).count();
    counts.staff_assignments_total = plan.staff.len();
    counts.staff_assignments_staged = plan.staff.iter().filter(|m| m.source == SlideSource::Staged).count();
    counts.staff_assignments_carried = plan.staff.iter().filter(|m| m.source == SlideSource::Carried).count();
    plan
}

pub(crate) fn plan_warnings(plan: &SlidePlan, classes: &[ClassRecord]) -> Vec<String> {
    let classes = classes.iter().map(|c| (c.class_id.as_str(), c)).collect::<HashMap<_, _>>();
    let mut occupancy: BTreeMap<&str, i64> = BTreeMap::new();
    for m in &plan.children {
        *occupancy.entry(m.to_class_id.as_str()).or_default() += 1;
    }
    let mut warnings = vec![];
    for (class_id, count) in &occupancy {
        match classes.get(class_id) {
            None => warnings.push(format!("Class {class_id} does not exist")),
            Some(c) if !c.is_active => warnings.push(format!("Class {class_id} is inactive but would receive {count} children")),
            Some(c) if *count > c.max_capacity => warnings.push(format!("Class {class_id} would hold {count} children, capacity is {}", c.max_capacity)),
            Some(_) => {}
        }
    }
    if plan.counts.children_new > 0 {
        warnings.push(format!("{} staged children have no placement in the current year", plan.counts.children_new));
    }
    for class_id in plan.staff.iter().map(|m| m.class_id.as_str()).collect::<HashSet<_>>() {
        if classes.get(class_id).is_none_or(|c| !c.is_active) {
            warnings.push(format!("Staff would be assigned to inactive or missing class {class_id}"));
        }
    }
    warnings
}

struct SlideContext {
    current: AcademicYearRecord,
    target: Option<AcademicYearRecord>,
}

async fn check_slide_target(nursery_id: NurseryId, target_year: Year, conn: &mut SqliteConnection) -> ApiResult<SlideContext> {
    let target = find_year(nursery_id, target_year, conn).await?;
    if target.as_ref().is_some_and(|t| t.is_current) {
        return Err(ApiError::conflict(format!("Academic year {target_year} is already the current year")));
    }
    let Some(current) = find_current_year(nursery_id, conn).await? else {
        return Err(ApiError::invalid("targetYear", "nursery has no current academic year"));
    };
    if target_year != current.year + 1 {
        return Err(ApiError::invalid("targetYear", format!("must be {} (current year + 1)", current.year + 1)));
    }
    if target.as_ref().is_some_and(|t| t.is_archived) {
        return Err(ApiError::conflict(format!("Academic year {target_year} is archived")));
    }
    Ok(SlideContext { current, target })
}

async fn load_child_placements(nursery_id: NurseryId, year: Year, conn: &mut SqliteConnection) -> ApiResult<Vec<ChildPlacement>> {
    let rows = sqlx::query_as("SELECT a.child_id, c.name AS child_name, a.class_id
            FROM child_class_assignments a JOIN children c ON c.id = a.child_id
            WHERE a.nursery_id=? AND a.academic_year=? AND a.is_active=1
            ORDER BY a.class_id, c.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(&mut *conn).await?;
    Ok(rows)
}

async fn load_staff_placements(nursery_id: NurseryId, year: Year, conn: &mut SqliteConnection) -> ApiResult<Vec<StaffPlacement>> {
    let rows = sqlx::query_as("SELECT a.staff_id, s.name AS staff_name, a.class_id, a.role
            FROM staff_class_assignments a JOIN staff s ON s.id = a.staff_id
            WHERE a.nursery_id=? AND a.academic_year=? AND a.is_active=1
            ORDER BY a.class_id, s.name")
        .bind(nursery_id)
        .bind(year)
        .fetch_all(&mut *conn).await?;
    Ok(rows)
}

async fn build_plan(nursery_id: NurseryId, sc: &SlideContext, conn: &mut SqliteConnection) -> ApiResult<(SlidePlan, Vec<String>)> {
    let from = sc.current.year;
    let to = from + 1;
    let current_children = load_child_placements(nursery_id, from, conn).await?;
    let staged_children = load_child_placements(nursery_id, to, conn).await?;
    let current_staff = load_staff_placements(nursery_id, from, conn).await?;
    let staged_staff = load_staff_placements(nursery_id, to, conn).await?;
    let plan = plan_slide(&current_children, &staged_children, &current_staff, &staged_staff);
    let classes: Vec<ClassRecord> = sqlx::query_as("SELECT * FROM classes WHERE nursery_id=?")
        .bind(nursery_id)
        .fetch_all(&mut *conn).await?;
    let mut warnings = plan_warnings(&plan, &classes);
    if sc.target.is_none() {
        warnings.insert(0, format!("Academic year {to} does not exist yet and will be created"));
    }
    Ok((plan, warnings))
}

pub async fn preview_slide(nursery_id: NurseryId, target_year: Year, pool: &SqlitePool) -> ApiResult<SlidePreview> {
    let mut conn = pool.acquire().await?;
    let sc = check_slide_target(nursery_id, target_year, &mut conn).await?;
    let (plan, warnings) = build_plan(nursery_id, &sc, &mut conn).await?;
    Ok(SlidePreview {
        nursery_id,
        from_year: sc.current.year,
        to_year: target_year,
        target_year_exists: sc.target.is_some(),
        children: plan.children,
        staff: plan.staff,
        counts: plan.counts,
        warnings,
    })
}

/// Runs the whole slide in one transaction, any failure leaves both years untouched.
pub async fn execute_slide(nursery_id: NurseryId, req: &ExecuteSlideRequest, pool: &SqlitePool) -> ApiResult<SlideResult> {
    if !req.confirmed {
        return Err(ApiError::invalid("confirmed", "must be true to execute the slide"));
    }
    let target_year = req.target_year;
    let mut tx = pool.begin().await?;
    let sc = check_slide_target(nursery_id, target_year, &mut tx).await?;
    let from_year = sc.current.year;
    let (plan, warnings) = build_plan(nursery_id, &sc, &mut tx).await?;
    let now = dates::now();

    if sc.target.is_none() {
        let start = dates::shift_years(sc.current.start_date, 1);
        let end = dates::shift_years(sc.current.end_date, 1);
        insert_year(nursery_id, target_year, start, end, "", (false, true, false), &mut tx).await?;
    }

    for m in plan.children.iter().filter(|m| m.source == SlideSource::Carried) {
        sqlx::query("INSERT INTO child_class_assignments
                (academic_year, nursery_id, child_id, class_id, is_current, is_future, is_active, assigned_at)
                VALUES (?, ?, ?, ?, 0, 1, 1, ?)
                ON CONFLICT (academic_year, nursery_id, child_id) DO UPDATE SET
                class_id=excluded.class_id, is_active=1, assigned_at=excluded.assigned_at")
            .bind(target_year)
            .bind(nursery_id)
            .bind(m.child_id)
            .bind(&m.to_class_id)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    for m in plan.staff.iter().filter(|m| m.source == SlideSource::Carried) {
        sqlx::query("INSERT INTO staff_class_assignments
                (academic_year, nursery_id, staff_id, class_id, role, is_current, is_future, is_active, assigned_at)
                VALUES (?, ?, ?, ?, ?, 0, 1, 1, ?)
                ON CONFLICT (academic_year, nursery_id, staff_id, class_id) DO UPDATE SET
                role=excluded.role, is_active=1, assigned_at=excluded.assigned_at")
            .bind(target_year)
            .bind(nursery_id)
            .bind(m.staff_id)
            .bind(&m.class_id)
            .bind(m.role)
            .bind(now)
            .execute(&mut *tx).await?;
    }

    for table in ["child_class_assignments", "staff_class_assignments"] {
        sqlx::query(&format!("UPDATE {table} SET is_current=0, is_future=0 WHERE nursery_id=? AND academic_year=?"))
            .bind(nursery_id)
            .bind(from_year)
            .execute(&mut *tx).await?;
        sqlx::query(&format!("UPDATE {table} SET is_current=is_active, is_future=0 WHERE nursery_id=? AND academic_year=?"))
            .bind(nursery_id)
            .bind(target_year)
            .execute(&mut *tx).await?;
    }

    // the old year has to let go first, the partial unique index allows one current row
    sqlx::query("UPDATE academic_years SET is_current=0, is_future=0, is_archived=1, updated_at=? WHERE nursery_id=? AND year=?")
        .bind(now)
        .bind(nursery_id)
        .bind(from_year)
        .execute(&mut *tx).await?;
    sqlx::query("UPDATE academic_years SET is_current=1, is_future=0, is_archived=0, updated_at=? WHERE nursery_id=? AND year=?")
        .bind(now)
        .bind(nursery_id)
        .bind(target_year)
        .execute(&mut *tx).await?;

    tx.commit().await?;
    for w in &warnings {
        warn!("Slide {from_year} -> {target_year}, nursery: {nursery_id}: {w}");
    }
    info!("Academic year slide executed, nursery: {nursery_id}, {from_year} -> {target_year}, children: {}, staff assignments: {}",
        plan.counts.children_total, plan.counts.staff_assignments_total);
    Ok(SlideResult {
        nursery_id,
        from_year,
        to_year: target_year,
        counts: plan.counts,
        warnings,
        executed_at: now,
    })
}

#[get("/api/academic-years/slide/preview?<target_year>")]
async fn get_slide_preview(target_year: Year, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<SlidePreview> {
    reply(preview_slide(ctx.nursery_id, target_year, &db.0).await?)
}

#[post("/api/academic-years/slide/execute", data = "<req>")]
async fn post_slide_execute(req: Json<ExecuteSlideRequest>, ctx: RequestContext, db: &State<DbPool>) -> ApiReply<SlideResult> {
    ctx.require_admin()?;
    reply(execute_slide(ctx.nursery_id, &req, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_slide_preview,
            post_slide_execute,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(child_id: ChildId, class_id: &str) -> ChildPlacement {
        ChildPlacement { child_id, child_name: format!("child-{child_id}"), class_id: class_id.to_string() }
    }
    fn staff(staff_id: StaffId, class_id: &str, role: AssignmentRole) -> StaffPlacement {
        StaffPlacement { staff_id, staff_name: format!("staff-{staff_id}"), class_id: class_id.to_string(), role }
    }
    fn class(class_id: &str, max_capacity: i64, is_active: bool) -> ClassRecord {
        ClassRecord {
            nursery_id: 1,
            class_id: class_id.to_string(),
            name: class_id.to_string(),
            age_group_min: 0,
            age_group_max: 6,
            max_capacity,
            is_active,
        }
    }

    #[test]
    fn carries_children_without_staged_rows() {
        let current = [child(1, "hiyoko"), child(2, "hiyoko"), child(3, "risu")];
        let staged = [child(2, "risu")];
        let plan = plan_slide(&current, &staged, &[], &[]);
        assert_eq!(plan.children.len(), 3);
        let by_id = plan.children.iter().map(|m| (m.child_id, m)).collect::<HashMap<_, _>>();
        assert_eq!(by_id[&1].source, SlideSource::Carried);
        assert_eq!(by_id[&1].to_class_id, "hiyoko");
        assert!(!by_id[&1].moves_class);
        assert_eq!(by_id[&2].source, SlideSource::Staged);
        assert_eq!(by_id[&2].to_class_id, "risu");
        assert!(by_id[&2].moves_class);
        assert_eq!(plan.counts.children_carried, 2);
        assert_eq!(plan.counts.children_staged, 1);
        assert_eq!(plan.counts.children_moving_class, 1);
        assert_eq!(plan.counts.children_new, 0);
    }

    #[test]
    fn every_current_child_gets_exactly_one_move() {
        let current = (1..=20).map(|id| child(id, if id % 2 == 0 { "a" } else { "b" })).collect::<Vec<_>>();
        let staged = (15..=25).map(|id| child(id, "c")).collect::<Vec<_>>();
        let plan = plan_slide(&current, &staged, &[], &[]);
        for cur in &current {
            assert_eq!(plan.children.iter().filter(|m| m.child_id == cur.child_id).count(), 1);
        }
        assert_eq!(plan.counts.children_new, 5);
        assert_eq!(plan.counts.children_total, 25);
        let warnings = plan_warnings(&plan, &[class("a", 20, true), class("b", 20, true), class("c", 20, true)]);
        assert_eq!(warnings, vec!["5 staged children have no placement in the current year".to_string()]);
    }

    #[test]
    fn staged_staff_replace_current_set() {
        let current = [
            staff(10, "hiyoko", AssignmentRole::Main),
            staff(10, "risu", AssignmentRole::Assistant),
            staff(11, "risu", AssignmentRole::Main),
        ];
        let staged = [staff(10, "kuma", AssignmentRole::Main)];
        let plan = plan_slide(&[], &[], &current, &staged);
        let of_10 = plan.staff.iter().filter(|m| m.staff_id == 10).collect::<Vec<_>>();
        assert_eq!(of_10.len(), 1);
        assert_eq!(of_10[0].class_id, "kuma");
        assert_eq!(of_10[0].source, SlideSource::Staged);
        let of_11 = plan.staff.iter().filter(|m| m.staff_id == 11).collect::<Vec<_>>();
        assert_eq!(of_11.len(), 1);
        assert_eq!(of_11[0].source, SlideSource::Carried);
        assert_eq!(plan.counts.staff_assignments_total, 2);
    }

    #[test]
    fn warns_about_capacity_and_inactive_classes() {
        let current = [child(1, "a"), child(2, "a"), child(3, "b")];
        let plan = plan_slide(&current, &[], &[staff(5, "c", AssignmentRole::Main)], &[]);
        let warnings = plan_warnings(&plan, &[class("a", 1, true), class("b", 10, false), class("c", 10, true)]);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("capacity is 1"));
        assert!(warnings[1].contains("inactive"));
    }
}
