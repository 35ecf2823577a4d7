use std::{
    env::{self, VarError},
    fmt::Display,
    str::FromStr,
    sync::Arc,
};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use time::Duration;
use tracing::{info, instrument, warn};

use crate::{
    code_gen::{CodeGenerator, RandomCodeGenerator},
    expiry::{Clock, ExpiryPolicy, SystemClock},
    orm,
};

/// Knobs of the short-code engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub code_length: usize,
    pub expiry: ExpiryPolicy,
    /// Upper bound on candidate codes tried by a single shortening.
    pub max_allocation_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            code_length: 6,
            expiry: ExpiryPolicy::default(),
            max_allocation_attempts: 16,
        }
    }
}

/// # Errors
/// Will return [`Err`] if the connection to the database or the schema setup fails.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    let db = Database::connect(db_connection_options).await?;
    orm::ensure_schema(&db).await?;
    set_db_conn(db);

    info!(settings = ?container.read(engine_settings_capsule), "Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    const ENV_VAR_NAME: &str = "DB_URL";
    env::var(ENV_VAR_NAME)
        .unwrap_or_else(|err| match err {
            VarError::NotPresent => panic!("{ENV_VAR_NAME} is not set"),
            VarError::NotUnicode(actual) => {
                panic!("{ENV_VAR_NAME} is invalid unicode: {}", actual.display());
            }
        })
        .into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    env_or_default("ADDR", "127.0.0.1:0".to_owned())
}

/// # Panics
/// Panics when any of the engine's environment variables is invalid.
pub fn engine_settings_capsule(_: CapsuleHandle) -> EngineSettings {
    let defaults = EngineSettings::default();

    let code_length = env_or_default("SHORT_CODE_LENGTH", defaults.code_length);
    assert!(
        (1..=64).contains(&code_length),
        "SHORT_CODE_LENGTH must be between 1 and 64, got {code_length}"
    );

    let ttl_seconds = env_or_default("URL_TTL_SECONDS", defaults.expiry.ttl().whole_seconds());
    assert!(ttl_seconds > 0, "URL_TTL_SECONDS must be positive, got {ttl_seconds}");

    let max_allocation_attempts =
        env_or_default("MAX_ALLOCATION_ATTEMPTS", defaults.max_allocation_attempts);
    assert!(
        max_allocation_attempts > 0,
        "MAX_ALLOCATION_ATTEMPTS must be positive"
    );

    EngineSettings {
        code_length,
        expiry: ExpiryPolicy::new(Duration::seconds(ttl_seconds)),
        max_allocation_attempts,
    }
}

pub fn clock_capsule(_: CapsuleHandle) -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

pub fn code_generator_capsule(_: CapsuleHandle) -> Arc<dyn CodeGenerator> {
    Arc::new(RandomCodeGenerator)
}

fn env_or_default<T>(env_var_name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(env_var_name) {
        Ok(raw) => {
            info!(env_var_name, value = %raw, "Environment variable set");
            raw.parse().unwrap_or_else(|err| {
                panic!("{env_var_name} environment variable is invalid ({raw}): {err}")
            })
        }
        Err(VarError::NotPresent) => {
            warn!(
                env_var_name,
                %default,
                "Environment variable not set; falling back to default"
            );
            default
        }
        Err(VarError::NotUnicode(actual)) => {
            panic!(
                "{env_var_name} environment variable is invalid: {}",
                actual.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.code_length, 6);
        assert_eq!(settings.expiry.ttl(), Duration::hours(24));
        assert_eq!(settings.max_allocation_attempts, 16);
    }

    #[test]
    fn test_env_or_default_falls_back_when_unset() {
        let value = env_or_default("EXPIRING_SHORT_SURELY_UNSET_VARIABLE", 42_u32);
        assert_eq!(value, 42);
    }
}
