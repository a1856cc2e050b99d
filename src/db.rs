use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::migrate::Migrator;
use std::path::Path;
use std::str::FromStr;
use log::{error, info};
use crate::config::AppConfig;

// macro to map a text enum onto a SQLite TEXT column
#[macro_export]
macro_rules! impl_sqlx_text_enum {
    ($type:ident) => {
        impl sqlx::Type<sqlx::Sqlite> for $type {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                // TEXT columns only
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(&self, buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.to_string(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $type {
            fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(value.parse::<$type>()?)
            }
        }
    };
}

// macro to declare a closed set of lowercase string values shared by JSON and SQL
#[macro_export]
macro_rules! text_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Unknown {} value: {s}", stringify!($name))),
                }
            }
        }

        $crate::impl_sqlx_text_enum!($name);
    };
}

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub struct DbPoolFairing();

impl DbPoolFairing {
    async fn open(&self, cfg: &AppConfig) -> anyhow::Result<SqlitePool> {
        let database_url = cfg.database_url.clone();
        let in_memory = database_url.contains(":memory:");
        if let Some(db_path) = database_url.strip_prefix("sqlite://") {
            if !in_memory && !Path::new(db_path).exists() {
                info!("creating database: {database_url}");
                std::fs::File::create(db_path)?;
            }
        }
        info!("Opening database: {database_url}");
        let opts = SqliteConnectOptions::from_str(&database_url)?
            .foreign_keys(true);
        let pool = if in_memory {
            // every connection to :memory: is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts.journal_mode(SqliteJournalMode::Wal))
                .await?
        };
        MIGRATOR.run(&pool).await?;
        info!("Migrations applied successfully!");
        if let Some(seed_file) = &cfg.seed_file {
            crate::seed::load_seed_file(seed_file, &pool).await?;
        }
        Ok(pool)
    }
}

#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(cfg) = rocket.state::<AppConfig>().cloned() else {
            error!("Database pool needs the application config to be managed first");
            return Err(rocket);
        };
        match self.open(&cfg).await {
            Ok(pool) => Ok(rocket.manage(DbPool(pool))),
            Err(err) => {
                error!("Database initialization error: {:?}", err);
                Err(rocket)
            }
        }
    }
}
