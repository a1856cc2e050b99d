use std::collections::HashMap;
use std::fs;
use anyhow::{anyhow, bail};
use chrono::NaiveDate;
use log::info;
use serde::Deserialize;
use sqlx::SqlitePool;
use crate::academic_years::Year;
use crate::auth::{hash_password, NurseryId, Role, StaffId};
use crate::children::ChildId;
use crate::class_assignments::AssignmentRole;
use crate::{dates, text_enum};

text_enum! {
    pub enum YearState {
        Current => "current",
        Future => "future",
        Archived => "archived",
    }
}

#[derive(Deserialize, Debug)]
pub struct SeedNursery {
    pub id: NurseryId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Deserialize, Debug)]
pub struct SeedStaff {
    pub id: StaffId,
    pub nursery_id: NurseryId,
    pub name: String,
    pub login_id: String,
    /// Plain text, hashed while loading.
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub email: String,
}

#[derive(Deserialize, Debug)]
pub struct SeedClass {
    pub nursery_id: NurseryId,
    pub class_id: String,
    pub name: String,
    pub age_group_min: i64,
    pub age_group_max: i64,
    pub max_capacity: i64,
}

#[derive(Deserialize, Debug)]
pub struct SeedChild {
    pub id: ChildId,
    pub nursery_id: NurseryId,
    pub name: String,
    pub date_of_birth: NaiveDate,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub allergies: String,
    #[serde(default)]
    pub guardian_name: String,
    #[serde(default)]
    pub guardian_phone: String,
}

#[derive(Deserialize, Debug)]
pub struct SeedYear {
    pub nursery_id: NurseryId,
    pub year: Year,
    pub state: YearState,
}

#[derive(Deserialize, Debug)]
pub struct SeedChildAssignment {
    pub nursery_id: NurseryId,
    pub year: Year,
    pub child_id: ChildId,
    pub class_id: String,
}

#[derive(Deserialize, Debug)]
pub struct SeedStaffAssignment {
    pub nursery_id: NurseryId,
    pub year: Year,
    pub staff_id: StaffId,
    pub class_id: String,
    pub role: AssignmentRole,
}

#[derive(Deserialize, Debug)]
pub struct SeedData {
    pub nurseries: Vec<SeedNursery>,
    #[serde(default)]
    pub staff: Vec<SeedStaff>,
    #[serde(default)]
    pub classes: Vec<SeedClass>,
    #[serde(default)]
    pub children: Vec<SeedChild>,
    #[serde(default)]
    pub academic_years: Vec<SeedYear>,
    #[serde(default)]
    pub child_assignments: Vec<SeedChildAssignment>,
    #[serde(default)]
    pub staff_assignments: Vec<SeedStaffAssignment>,
}

pub fn parse_seed(content: &str) -> anyhow::Result<SeedData> {
    let data: SeedData = serde_yaml::from_str(content)?;
    let mut current = HashMap::new();
    for y in data.academic_years.iter().filter(|y| y.state == YearState::Current) {
        if let Some(other) = current.insert(y.nursery_id, y.year) {
            bail!("nursery {} has two current academic years: {other} and {}", y.nursery_id, y.year);
        }
    }
    Ok(data)
}

/// Loads a YAML fixture into an empty database. A database that already has nurseries is left alone.
pub async fn load_seed_file(path: &str, pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Loading seed data from file: {path}");
    let content = fs::read_to_string(path).map_err(|e| anyhow!("Cannot read seed file {path}: {e}"))?;
    let data = parse_seed(&content)?;
    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nurseries").fetch_one(pool).await?;
    if existing.0 > 0 {
        info!("Database already contains {} nurseries, seed skipped", existing.0);
        return Ok(());
    }
    load_seed(&data, pool).await
}

pub async fn load_seed(data: &SeedData, pool: &SqlitePool) -> anyhow::Result<()> {
    let now = dates::now();
    let mut tx = pool.begin().await?;
    for n in &data.nurseries {
        sqlx::query("INSERT INTO nurseries (id, name, address, phone, email, created_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(n.id)
            .bind(&n.name)
            .bind(&n.address)
            .bind(&n.phone)
            .bind(&n.email)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    for s in &data.staff {
        sqlx::query("INSERT INTO staff (id, nursery_id, name, email, login_id, password_hash, role, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)")
            .bind(s.id)
            .bind(s.nursery_id)
            .bind(&s.name)
            .bind(&s.email)
            .bind(&s.login_id)
            .bind(hash_password(&s.password))
            .bind(s.role)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    for c in &data.classes {
        sqlx::query("INSERT INTO classes (nursery_id, class_id, name, age_group_min, age_group_max, max_capacity)
                VALUES (?, ?, ?, ?, ?, ?)")
            .bind(c.nursery_id)
            .bind(&c.class_id)
            .bind(&c.name)
            .bind(c.age_group_min)
            .bind(c.age_group_max)
            .bind(c.max_capacity)
            .execute(&mut *tx).await?;
    }
    for c in &data.children {
        sqlx::query("INSERT INTO children
                (id, nursery_id, name, date_of_birth, gender, allergies, guardian_name, guardian_phone, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)")
            .bind(c.id)
            .bind(c.nursery_id)
            .bind(&c.name)
            .bind(c.date_of_birth)
            .bind(&c.gender)
            .bind(&c.allergies)
            .bind(&c.guardian_name)
            .bind(&c.guardian_phone)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    let mut year_states = HashMap::new();
    for y in &data.academic_years {
        let (start, end) = dates::default_year_bounds(y.year);
        sqlx::query("INSERT INTO academic_years
                (nursery_id, year, start_date, end_date, is_current, is_future, is_archived, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)")
            .bind(y.nursery_id)
            .bind(y.year)
            .bind(start)
            .bind(end)
            .bind(y.state == YearState::Current)
            .bind(y.state == YearState::Future)
            .bind(y.state == YearState::Archived)
            .bind(now)
            .bind(now)
            .execute(&mut *tx).await?;
        year_states.insert((y.nursery_id, y.year), y.state);
    }
    let state_of = |nursery_id: NurseryId, year: Year| {
        year_states.get(&(nursery_id, year)).copied()
            .ok_or_else(|| anyhow!("assignment refers to unknown academic year {year} of nursery {nursery_id}"))
    };
    for a in &data.child_assignments {
        let state = state_of(a.nursery_id, a.year)?;
        sqlx::query("INSERT INTO child_class_assignments
                (academic_year, nursery_id, child_id, class_id, is_current, is_future, is_active, assigned_at)
                VALUES (?, ?, ?, ?, ?, ?, 1, ?)")
            .bind(a.year)
            .bind(a.nursery_id)
            .bind(a.child_id)
            .bind(&a.class_id)
            .bind(state == YearState::Current)
            .bind(state == YearState::Future)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    for a in &data.staff_assignments {
        let state = state_of(a.nursery_id, a.year)?;
        sqlx::query("INSERT INTO staff_class_assignments
                (academic_year, nursery_id, staff_id, class_id, role, is_current, is_future, is_active, assigned_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)")
            .bind(a.year)
            .bind(a.nursery_id)
            .bind(a.staff_id)
            .bind(&a.class_id)
            .bind(a.role)
            .bind(state == YearState::Current)
            .bind(state == YearState::Future)
            .bind(now)
            .execute(&mut *tx).await?;
    }
    tx.commit().await?;
    info!("Seed loaded: {} nurseries, {} staff, {} children, {} child assignments",
        data.nurseries.len(), data.staff.len(), data.children.len(), data.child_assignments.len());
    Ok(())
}

#[test]
fn test_parse_demo_seed() {
    let content = fs::read_to_string("tests/data/demo.yaml").unwrap();
    let data = parse_seed(&content).unwrap();
    assert_eq!(data.nurseries.len(), 2);
    assert!(data.staff.iter().any(|s| s.role == Role::Admin));
    assert!(data.academic_years.iter().any(|y| y.state == YearState::Future));
}

#[test]
fn test_two_current_years_rejected() {
    let content = r#"
nurseries:
  - { id: 1, name: Test }
academic_years:
  - { nursery_id: 1, year: 2024, state: current }
  - { nursery_id: 1, year: 2025, state: current }
"#;
    assert!(parse_seed(content).is_err());
}
