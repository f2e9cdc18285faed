use crate::config::DbConfig;
use crate::db::Pool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tracing::info;

impl From<&DbConfig> for PgConnectOptions {
    fn from(config: &DbConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password);
        match &config.schema {
            Some(schema) => options.options([("search_path", schema.as_str())]),
            None => options,
        }
    }
}

#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    pub async fn configured(config: &DbConfig) -> Result<Self, sqlx::Error> {
        info!(host = %config.host, database = %config.database, "connecting to postgres");
        let options = PgConnectOptions::from(config);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }
}

impl Pool for PostgresPool {
    type Db = Postgres;

    fn pool(&self) -> &sqlx::Pool<Postgres> {
        &self.pool
    }
}

/// Runs the forward-only migrations under `migrations/postgres` against a
/// fresh connection, independent of any pool, so it can run once at startup
/// before the long-lived pool is handed to the rest of the application.
pub async fn migrate(config: &DbConfig) -> Result<(), sqlx::Error> {
    info!(host = %config.host, database = %config.database, "running database migrations");
    let options = PgConnectOptions::from(config);
    let mut conn = PgConnection::connect_with(&options).await?;
    sqlx::migrate!("../migrations/postgres").run(&mut conn).await?;
    conn.close().await?;
    Ok(())
}
