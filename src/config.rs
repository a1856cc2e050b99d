use log::{error, info};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Wrong passwords in a row before the account is locked.
    pub max_failed_logins: i64,
    pub lock_minutes: i64,
    pub session_hours: i64,
    pub notification_webhook_url: Option<String>,
    pub seed_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://nursery.db".to_string(),
            max_failed_logins: 5,
            lock_minutes: 30,
            session_hours: 12,
            notification_webhook_url: None,
            seed_file: None,
        }
    }
}

impl AppConfig {
    pub fn from_figment(figment: &Figment) -> anyhow::Result<Self> {
        let cfg: AppConfig = figment.extract()?;
        if cfg.max_failed_logins < 1 {
            anyhow::bail!("max_failed_logins must be at least 1");
        }
        Ok(cfg)
    }
}

/// Extracts and validates `AppConfig` from the Rocket figment; launch aborts on a bad config.
pub fn fairing() -> AdHoc {
    AdHoc::try_on_ignite("Application config", |rocket| async move {
        match AppConfig::from_figment(rocket.figment()) {
            Ok(cfg) => {
                info!("Database: {}, webhook: {}", cfg.database_url, cfg.notification_webhook_url.as_deref().unwrap_or("-"));
                Ok(rocket.manage(cfg))
            }
            Err(e) => {
                error!("Invalid configuration: {e}");
                Err(rocket)
            }
        }
    })
}

#[test]
fn test_config_defaults_and_overrides() {
    let figment = Figment::new()
        .merge(("lock_minutes", 5))
        .merge(("notification_webhook_url", "http://localhost:9000/push"));
    let cfg = AppConfig::from_figment(&figment).unwrap();
    assert_eq!(cfg.lock_minutes, 5);
    assert_eq!(cfg.max_failed_logins, 5);
    assert_eq!(cfg.database_url, "sqlite://nursery.db");
    assert_eq!(cfg.notification_webhook_url.as_deref(), Some("http://localhost:9000/push"));

    let figment = Figment::new().merge(("max_failed_logins", 0));
    assert!(AppConfig::from_figment(&figment).is_err());
}
