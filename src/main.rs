#[macro_use] extern crate rocket;

use rocket::figment::Figment;
use rocket::{Build, Rocket};
use crate::db::DbPoolFairing;

#[cfg(test)]
mod tests;
mod academic_years;
mod announcements;
mod applications;
mod attendance;
mod auth;
mod children;
mod class_assignments;
mod classes;
mod config;
mod daily_reports;
mod dates;
mod db;
mod entry_exit;
mod error;
mod menus;
mod nursery;
mod photos;
mod seed;
mod slide;
mod staff;
mod util;

pub fn build(figment: Figment) -> Rocket<Build> {
    // ignite fairings run in attach order, config first, then the pool
    let rocket = rocket::custom(figment)
        .attach(config::fairing())
        .attach(DbPoolFairing());
    let rocket = error::extend(rocket);
    let rocket = auth::extend(rocket);
    let rocket = nursery::extend(rocket);
    let rocket = staff::extend(rocket);
    let rocket = children::extend(rocket);
    let rocket = classes::extend(rocket);
    let rocket = academic_years::extend(rocket);
    let rocket = slide::extend(rocket);
    let rocket = class_assignments::extend(rocket);
    let rocket = attendance::extend(rocket);
    let rocket = daily_reports::extend(rocket);
    let rocket = photos::extend(rocket);
    let rocket = announcements::extend(rocket);
    let rocket = menus::extend(rocket);
    let rocket = applications::extend(rocket);
    entry_exit::extend(rocket)
}

#[launch]
fn rocket() -> _ {
    build(rocket::Config::figment())
}
